//! Caller-facing relay: Unix socket listener, sessions, message contract.
//!
//! # Architecture
//!
//! ```text
//! caller ──frames──► RelayServer ──spawn──► session task ──► NativeChannel
//!        ◄──frames──                        │                (shared, Arc)
//!                                           └──────────────► SocketTunnel
//!                                                            (per session)
//! ```
//!
//! Each accepted connection becomes one [`session`] task holding that
//! caller's state and its zero-or-one tunnel. The router is the single
//! point deciding what callers see: every internal failure is converted to
//! a structured `{"type":"sail","error":...}` response at this boundary.

pub mod framing;
pub mod messages;
pub mod router;
pub mod session;

pub use router::RelayServer;
pub use session::SessionCtx;
