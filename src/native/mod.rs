//! Native channel to the Sail host service.
//!
//! # Architecture
//!
//! ```text
//! RelayRouter ──send(request)──► NativeChannel ──framed JSON──► host stdin
//!             ◄──response────── RequestCorrelator ◄──framed JSON── host stdout
//! ```
//!
//! The channel speaks the native messaging wire format (a `u32` LE length
//! prefix followed by a JSON document) over the host process's stdio. One
//! logical channel exists process-wide; all caller sessions share it, and
//! `connect()` coalesces concurrent callers into a single handshake so a
//! second host process is never spawned while one is in flight.
//!
//! The host service replies to requests strictly in the order they were
//! sent and carries no request IDs, so responses are matched to requests
//! positionally by [`correlator::RequestCorrelator`].

pub mod channel;
pub mod correlator;
pub mod framing;
pub mod host;

pub use channel::NativeChannel;
pub use host::{HostIo, HostLauncher, NativeHostLauncher};
