//! Streaming tunnel between a caller session and the host's run endpoint.
//!
//! A sandboxed caller cannot open a WebSocket to the host service itself,
//! so the broker opens one on its behalf and republishes the stream as
//! relay events. The wire protocol is small and tagged:
//!
//! ```text
//! broker → endpoint:  {"project": "<target>"}          (first frame only)
//! endpoint → broker:  {"type": "data",  "v": <base64>} (payload bytes)
//!                     {"type": "error", "v": <utf-8>}  (error message)
//! ```
//!
//! Any other tag is a protocol violation and kills that tunnel — never the
//! shared native channel or other sessions. A close with a non-1000 code
//! surfaces exactly one error event before teardown; a normal close
//! surfaces none.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Events republished to the owning caller session, in receipt order.
#[derive(Debug, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Decoded payload bytes from a `data` frame.
    Data(Vec<u8>),
    /// An `error` frame, an abnormal close, or a protocol violation.
    Error(String),
    /// The stream ended; always the final event.
    Closed,
}

/// Caller-side commands consumed by the pump task.
enum Outbound {
    /// Interactive input forwarded to the endpoint verbatim.
    Input(String),
    /// Graceful close requested by the owner.
    Close,
}

/// Handle to one open tunnel.
///
/// Dropping the handle (or the whole session task — structured
/// cancellation) closes the transport gracefully.
pub struct SocketTunnel {
    address: String,
    outgoing: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl std::fmt::Debug for SocketTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTunnel")
            .field("address", &self.address)
            .field("open", &self.is_open())
            .finish()
    }
}

impl SocketTunnel {
    /// Open a tunnel to `address` and send the project init frame.
    ///
    /// Resolves once the transport reports open and the init frame is on
    /// the wire; events start flowing on the returned receiver immediately
    /// after.
    pub async fn open(
        address: &str,
        project: &str,
        open_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<TunnelEvent>), RelayError> {
        let (mut writer, reader) = tokio::time::timeout(open_timeout, ws::connect(address))
            .await
            .map_err(|_| {
                RelayError::tunnel_closed(format!(
                    "timed out after {open_timeout:?} opening tunnel to {address}"
                ))
            })?
            .map_err(|e| {
                RelayError::tunnel_closed(format!("failed to open tunnel to {address}: {e}"))
            })?;

        let init = serde_json::json!({ "project": project });
        writer.send_text(&init.to_string()).await.map_err(|e| {
            RelayError::tunnel_closed(format!("failed to send tunnel init frame: {e}"))
        })?;

        log::info!("[Tunnel] opened {address}");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(256);
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(pump(writer, reader, out_rx, event_tx, Arc::clone(&open)));

        let tunnel = Self {
            address: address.to_string(),
            outgoing: out_tx,
            open,
        };
        Ok((tunnel, event_rx))
    }

    /// Forward caller-originated input to the endpoint verbatim.
    ///
    /// Fails with `TunnelClosed` once the tunnel has closed.
    pub fn send(&self, input: &str) -> Result<(), RelayError> {
        if !self.is_open() {
            return Err(RelayError::tunnel_closed("send after close"));
        }
        self.outgoing
            .send(Outbound::Input(input.to_string()))
            .map_err(|_| RelayError::tunnel_closed("send after close"))
    }

    /// Request a graceful close. Idempotent.
    pub fn close(&self) {
        let _ = self.outgoing.send(Outbound::Close);
    }

    /// True until the pump observes the stream end.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// A decoded endpoint frame.
enum DecodedFrame {
    Data(Vec<u8>),
    Error(String),
}

/// Decode one text frame per the tagged scheme.
///
/// # Errors
///
/// `ProtocolViolation` on non-JSON text, an unknown tag, or undecodable
/// base64 in a `data` frame.
fn decode_frame(text: &str) -> Result<DecodedFrame, RelayError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| RelayError::ProtocolViolation(format!("tunnel frame is not JSON: {e}")))?;
    let kind = value.get("type").and_then(serde_json::Value::as_str).unwrap_or("");
    let v = value
        .get("v")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");

    match kind {
        "data" => {
            let bytes = BASE64.decode(v).map_err(|e| {
                RelayError::ProtocolViolation(format!("invalid base64 in data frame: {e}"))
            })?;
            Ok(DecodedFrame::Data(bytes))
        }
        "error" => Ok(DecodedFrame::Error(v.to_string())),
        other => Err(RelayError::ProtocolViolation(format!(
            "unknown tunnel frame type: {other:?}"
        ))),
    }
}

/// Tunnel I/O loop: decodes inbound frames into events and forwards
/// outbound input, until either side closes.
async fn pump(
    mut writer: WsWriter,
    mut reader: WsReader,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::Sender<TunnelEvent>,
    open: Arc<AtomicBool>,
) {
    // Set when we initiated the close, so the peer's close reply is not
    // misreported as an abnormal termination.
    let mut local_close = false;
    // Set once the outbound channel is finished; keeps the closed channel
    // from being polled again (recv on a closed channel completes
    // immediately and would spin the select loop).
    let mut out_done = false;

    loop {
        tokio::select! {
            msg = reader.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => match decode_frame(&text) {
                    Ok(DecodedFrame::Data(bytes)) => {
                        if events.send(TunnelEvent::Data(bytes)).await.is_err() {
                            break; // session gone
                        }
                    }
                    Ok(DecodedFrame::Error(msg)) => {
                        if events.send(TunnelEvent::Error(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(violation) => {
                        log::warn!("[Tunnel] fatal: {violation}");
                        let _ = events.send(TunnelEvent::Error(violation.to_string())).await;
                        break;
                    }
                },
                Some(Ok(WsMessage::Binary(_))) => {
                    let violation =
                        RelayError::ProtocolViolation("unexpected binary tunnel frame".into());
                    log::warn!("[Tunnel] fatal: {violation}");
                    let _ = events.send(TunnelEvent::Error(violation.to_string())).await;
                    break;
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if writer.send_pong(data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close { code, reason })) => {
                    if code != 1000 && !local_close {
                        log::warn!("[Tunnel] abnormal close: {code} {reason}");
                        let _ = events
                            .send(TunnelEvent::Error(format!(
                                "sail socket was closed: {code}"
                            )))
                            .await;
                    }
                    break;
                }
                Some(Err(e)) => {
                    let _ = events
                        .send(TunnelEvent::Error(format!("tunnel transport error: {e}")))
                        .await;
                    break;
                }
                None => break,
            },

            cmd = out_rx.recv(), if !out_done => match cmd {
                Some(Outbound::Input(text)) => {
                    if let Err(e) = writer.send_text(&text).await {
                        log::warn!("[Tunnel] input write failed: {e}");
                        break;
                    }
                }
                // Owner requested close, or the handle was dropped.
                Some(Outbound::Close) | None => {
                    local_close = true;
                    out_done = true;
                    let _ = writer.close().await;
                }
            },
        }
    }

    open.store(false, Ordering::SeqCst);
    let _ = events.send(TunnelEvent::Closed).await;
    log::debug!("[Tunnel] pump finished");
}
