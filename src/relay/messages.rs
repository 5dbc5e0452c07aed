//! The relay message contract exchanged with sandboxed callers.
//!
//! Requests are `{"type":"sail", projectUrl?, clientMessage?, origin?}`;
//! responses are `{"type":"sail", error?, url?, serverMessage?}` where the
//! absence of `error` signals success. Tunnel error events are delivered as
//! `{"type":"error","v":...}`; tunnel payload bytes travel as binary frames
//! (see [`super::framing`]) rather than JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// Body of a caller's `sail` request.
///
/// All fields optional: a bare request is an availability probe, a
/// `clientMessage` is a correlated passthrough to the host service, and a
/// `projectUrl` launches a streaming session. `origin` identifies the
/// requesting page for the approval gate (a local socket carries no
/// ambient tab URL, so the caller declares it).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SailRequest {
    /// Project to launch (repository URL).
    #[serde(rename = "projectUrl", default, skip_serializing_if = "Option::is_none")]
    pub project_url: Option<String>,
    /// Opaque message for the host service (request/response passthrough).
    #[serde(rename = "clientMessage", default, skip_serializing_if = "Option::is_none")]
    pub client_message: Option<Value>,
    /// Origin of the requesting page, checked against the approval gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// A message arriving from a caller on the JSON frame kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum CallerMessage {
    /// The one request type callers may send.
    #[serde(rename = "sail")]
    Sail(SailRequest),
}

/// A JSON message from the router to a caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RouterMessage {
    /// Response to a `sail` request. No `error` means success.
    #[serde(rename = "sail")]
    Sail {
        /// Failure description; absent on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// The host service's endpoint URL, when the request resolved one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// The host service's reply to a `clientMessage` passthrough.
        #[serde(rename = "serverMessage", default, skip_serializing_if = "Option::is_none")]
        server_message: Option<Value>,
    },
    /// Tunnel error event streamed to the caller.
    #[serde(rename = "error")]
    Error {
        /// Error message.
        v: String,
    },
}

impl RouterMessage {
    /// Bare success response.
    pub fn ok() -> Self {
        Self::Sail { error: None, url: None, server_message: None }
    }

    /// Success response carrying the host endpoint.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self::Sail { error: None, url: Some(url.into()), server_message: None }
    }

    /// Success response carrying the host's reply.
    pub fn with_server_message(msg: Value) -> Self {
        Self::Sail { error: None, url: None, server_message: Some(msg) }
    }

    /// Error response from a structured failure.
    pub fn failure(err: &RelayError) -> Self {
        Self::Sail { error: Some(err.to_string()), url: None, server_message: None }
    }

    /// Error response from a plain message.
    pub fn failure_msg(msg: impl Into<String>) -> Self {
        Self::Sail { error: Some(msg.into()), url: None, server_message: None }
    }
}

/// Extract the lowercased hostname from an origin.
///
/// Accepts a full URL (`https://gist.github.com/x/y`) or a bare authority
/// (`gist.github.com:443`). Returns `None` when no hostname remains.
pub fn origin_host(origin: &str) -> Option<String> {
    let rest = match origin.find("://") {
        Some(idx) => &origin[idx + 3..],
        None => origin,
    };
    let rest = rest.split(['/', '?', '#']).next().unwrap_or("");
    // Strip userinfo, then the port.
    let rest = rest.rsplit('@').next().unwrap_or("");
    let host = rest.split(':').next().unwrap_or("");
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}
