//! Native messaging wire codec.
//!
//! Wire format (the browser native-messaging framing, same length-prefix
//! discipline as the relay's own socket framing):
//!
//! ```text
//! [u32 LE: body_len] [JSON document: body_len bytes]
//! ```
//!
//! There is no type byte; every body is a complete JSON document. The
//! handshake, requests, and responses are all distinguished by their JSON
//! content, which the broker mostly treats as opaque.

use anyhow::{anyhow, bail, Result};
use serde_json::Value;

/// Maximum message body size (1 MB — the browser-side cap for messages
/// arriving from a native host, adopted here for both directions).
const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Encode a JSON message into a wire frame.
pub fn encode_message(msg: &Value) -> Vec<u8> {
    let body = serde_json::to_vec(msg).expect("JSON serialization cannot fail");
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Incremental message decoder that handles partial reads.
///
/// Feed bytes via [`MessageDecoder::feed`] and extract complete messages.
/// Incomplete data is retained for the next call.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: Vec<u8>,
}

impl MessageDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes and extract all complete messages.
    ///
    /// # Errors
    ///
    /// Returns an error if a message is oversized or is not valid JSON.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Value>> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }
            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if length == 0 {
                bail!("native message: zero length");
            }
            if length > MAX_MESSAGE_SIZE {
                bail!("native message too large: {length} bytes (max {MAX_MESSAGE_SIZE})");
            }
            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }

            let msg: Value = serde_json::from_slice(&self.buf[4..total])
                .map_err(|e| anyhow!("invalid native message JSON: {e}"))?;
            messages.push(msg);
            self.buf.drain(..total);
        }

        Ok(messages)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Extract the handshake endpoint from a host message, if present.
///
/// The host's first message after launch carries a `url` field with the
/// HTTP endpoint it is serving on; anything else is not a valid handshake.
pub fn handshake_url(msg: &Value) -> Option<&str> {
    msg.get("url").and_then(Value::as_str)
}
