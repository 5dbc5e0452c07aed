//! Wire protocol codec for the caller-facing Unix socket.
//!
//! Length-prefixed frames with a kind byte:
//!
//! ```text
//! [u32 LE: payload_len + 1] [u8 kind] [payload bytes]
//! ```
//!
//! Frame kinds:
//! - `0x01`: JSON relay message (UTF-8 `serde_json::Value`, both directions)
//! - `0x02`: stream data (router→caller) — decoded tunnel payload bytes
//! - `0x03`: stream input (caller→router) — bytes forwarded to the tunnel
//!
//! JSON frames carry the relay contract (`{"type":"sail",...}` requests and
//! responses, `{"type":"error","v":...}` tunnel error events); the binary
//! kinds exist so tunnel payloads reach the caller byte-for-byte without a
//! JSON string round-trip.

use anyhow::{anyhow, bail, Result};

/// Maximum frame payload size (16 MB).
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame kind constants.
pub mod frame_kind {
    /// JSON relay message.
    pub const JSON: u8 = 0x01;
    /// Tunnel payload bytes (router → caller).
    pub const STREAM_DATA: u8 = 0x02;
    /// Tunnel input bytes (caller → router).
    pub const STREAM_INPUT: u8 = 0x03;
}

/// A decoded frame from the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// JSON relay message.
    Json(serde_json::Value),
    /// Tunnel payload bytes (router → caller).
    StreamData(Vec<u8>),
    /// Tunnel input bytes (caller → router).
    StreamInput(Vec<u8>),
}

impl Frame {
    /// Encode this frame into a wire-format byte vector.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Json(value) => {
                let payload = serde_json::to_vec(value).expect("JSON serialization cannot fail");
                encode_raw(frame_kind::JSON, &payload)
            }
            Frame::StreamData(data) => encode_raw(frame_kind::STREAM_DATA, data),
            Frame::StreamInput(data) => encode_raw(frame_kind::STREAM_INPUT, data),
        }
    }
}

/// Encode a raw frame with kind byte and payload.
fn encode_raw(kind: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32; // +1 for the kind byte
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(kind);
    buf.extend_from_slice(payload);
    buf
}

/// Decode a single frame from a kind byte and payload.
fn decode_frame(kind: u8, payload: &[u8]) -> Result<Frame> {
    match kind {
        frame_kind::JSON => {
            let value: serde_json::Value = serde_json::from_slice(payload)
                .map_err(|e| anyhow!("invalid JSON frame: {e}"))?;
            Ok(Frame::Json(value))
        }
        frame_kind::STREAM_DATA => Ok(Frame::StreamData(payload.to_vec())),
        frame_kind::STREAM_INPUT => Ok(Frame::StreamInput(payload.to_vec())),
        _ => bail!("unknown frame kind: 0x{kind:02x}"),
    }
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is malformed or exceeds the size limit.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }
            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if length == 0 {
                bail!("invalid frame: zero length");
            }
            if length > MAX_FRAME_SIZE {
                bail!("frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
            }
            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }

            let kind = self.buf[4];
            let payload = &self.buf[5..total];
            frames.push(decode_frame(kind, payload)?);
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
