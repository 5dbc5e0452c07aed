//! Error taxonomy for the relay broker.
//!
//! Every failure a caller can observe maps onto one of these variants; the
//! router converts them into structured relay responses at its boundary, so
//! none of them propagate out of the crate as a panic or an unhandled task
//! error.

use thiserror::Error;

/// Failures surfaced by the native channel, tunnel, and router.
///
/// `Clone` is required because a single underlying failure (for example a
/// channel disconnect) may have to resolve many pending continuations and
/// coalesced `connect()` waiters with the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The host service could not be reached at all: the native messaging
    /// host manifest is missing (not installed / not registered), the
    /// binary failed to spawn, or it disconnected before completing the
    /// handshake. The message distinguishes these causes so callers can
    /// render actionable guidance.
    #[error("sail host unavailable: {reason}")]
    ChannelUnavailable {
        /// Human-readable cause, safe to show to the user.
        reason: String,
    },

    /// `send()` was invoked before a successful `connect()`, or after a
    /// disconnect without reconnecting.
    #[error("not connected to the sail host")]
    NotConnected,

    /// The channel went away while requests were outstanding. Transient:
    /// the caller may retry after a fresh `connect()`.
    #[error("native channel closed: {reason}")]
    ChannelClosed {
        /// What ended the channel (host exit, transport error, dispose).
        reason: String,
    },

    /// The tunnel is closed (or never opened); outbound frames are refused.
    #[error("tunnel closed: {reason}")]
    TunnelClosed {
        /// What closed the tunnel.
        reason: String,
    },

    /// An unrecognized frame arrived on a tunnel. Fatal for that tunnel
    /// only; the shared channel and other sessions are unaffected.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The approval gate denied the requesting origin. Terminal for the
    /// request; retrying requires new user action.
    #[error("host \"{host}\" is not approved")]
    ApprovalDenied {
        /// The hostname that failed the gate.
        host: String,
    },
}

impl RelayError {
    /// Channel-unavailable error with a formatted reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::ChannelUnavailable { reason: reason.into() }
    }

    /// Channel-closed error with a formatted reason.
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ChannelClosed { reason: reason.into() }
    }

    /// Tunnel-closed error with a formatted reason.
    pub fn tunnel_closed(reason: impl Into<String>) -> Self {
        Self::TunnelClosed { reason: reason.into() }
    }
}
