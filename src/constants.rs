//! Application-wide constants for sail-relay.
//!
//! This module centralizes magic numbers and protocol constants so they are
//! discoverable in one place. Constants are grouped by domain with
//! documentation explaining their purpose.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Deadline for the host handshake after launching the host process.
///
/// The host normally reports its endpoint within milliseconds of starting;
/// 10 seconds covers slow first-run setup without leaving a caller hanging
/// on a wedged host forever.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a single host request/response round trip.
///
/// Host operations can involve container work, so this is deliberately
/// generous. The continuation stays queued past the deadline — the
/// positional correlation must not skip a slot — only the waiting caller
/// gives up.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for a tunnel's WebSocket transport to report open.
pub const TUNNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Protocol
// ============================================================================

/// Name of the native messaging host the broker connects to.
pub const HOST_NAME: &str = "com.coder.sail";

/// Path appended to the host's advertised endpoint to reach the streaming
/// run API.
pub const RUN_ENDPOINT_PATH: &str = "/api/v1/run";
