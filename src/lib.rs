//! Sail relay - connection broker for the Sail host service.
//!
//! Sandboxed browser contexts cannot talk to the locally running Sail host
//! service directly: they cannot spawn the host process, and they cannot
//! open raw sockets to arbitrary local endpoints. This crate is the
//! privileged middleman. It owns the single native channel to the host,
//! multiplexes requests from any number of callers over it, and tunnels
//! the host's streaming run endpoint back to the caller that asked for it.
//!
//! # Architecture
//!
//! - **Relay** - boundary-facing dispatcher; one session per caller
//! - **Native** - the single host connection + FIFO response correlation
//! - **Tunnel** - per-session WebSocket stream republished as relay events
//! - **Approval** - allow-list gate consulted before any launch
//!
//! # Modules
//!
//! - [`relay`] - Unix socket listener, sessions, message contract
//! - [`native`] - host channel, framing, request correlation
//! - [`tunnel`] - streaming tunnel to the host's run endpoint
//! - [`approval`] - host approval gate
//! - [`config`] - configuration loading/saving

// Library modules
pub mod approval;
pub mod config;
pub mod constants;
pub mod error;
pub mod native;
pub mod relay;
pub mod tunnel;
pub mod ws;

// Re-export commonly used types
pub use approval::{ApprovalGate, HostAllowList};
pub use config::Config;
pub use error::RelayError;
pub use native::{NativeChannel, NativeHostLauncher};
pub use relay::{RelayServer, SessionCtx};
pub use tunnel::{SocketTunnel, TunnelEvent};
