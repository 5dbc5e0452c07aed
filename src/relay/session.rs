//! Per-caller session: one cooperative task per accepted connection.
//!
//! The session owns the caller's socket halves and the zero-or-one tunnel
//! associated with it. Every stage (approval, channel connect, tunnel
//! open) is awaited in turn inside the session task, so cancelling the
//! task — caller disconnect, router shutdown — cancels whatever stage is
//! pending and drops the tunnel handle, which closes the tunnel's
//! transport gracefully.
//!
//! State machine per session:
//!
//! ```text
//! New → AwaitingApproval → Approved → Active → Closed
//!                        ↘ Rejected → Closed
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use super::framing::{Frame, FrameDecoder};
use super::messages::{origin_host, CallerMessage, RouterMessage, SailRequest};
use crate::approval::ApprovalGate;
use crate::constants::RUN_ENDPOINT_PATH;
use crate::error::RelayError;
use crate::native::NativeChannel;
use crate::tunnel::{SocketTunnel, TunnelEvent};
use crate::ws::http_to_ws_scheme;

/// Dependencies shared by all sessions, injected by the router.
#[derive(Clone)]
pub struct SessionCtx {
    /// The process-wide channel to the host service.
    pub channel: Arc<NativeChannel>,
    /// The approval gate collaborator.
    pub gate: Arc<dyn ApprovalGate>,
    /// Deadline for opening a tunnel's transport.
    pub tunnel_open_timeout: Duration,
}

impl std::fmt::Debug for SessionCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCtx")
            .field("tunnel_open_timeout", &self.tunnel_open_timeout)
            .finish_non_exhaustive()
    }
}

/// Lifecycle states of a caller session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    New,
    AwaitingApproval,
    Approved,
    Active,
    Rejected,
    Closed,
}

/// Whether the session loop keeps running after handling a request.
enum Flow {
    Continue,
    Close,
}

/// One caller's relay session.
struct CallerSession {
    id: String,
    ctx: SessionCtx,
    state: SessionState,
    /// Origin captured from the first request that declared one.
    origin: Option<String>,
    tunnel: Option<SocketTunnel>,
    frames_tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Run a session to completion. Spawned by the router per accepted
/// connection; never returns an error — every failure is structured into
/// a relay message or logged.
pub async fn run(stream: UnixStream, id: String, ctx: SessionCtx) {
    let (mut reader, mut writer) = stream.into_split();

    // Writer task: serializes all outbound frames for this caller.
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_id = id.clone();
    let _writer_task = tokio::spawn(async move {
        while let Some(data) = frames_rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                log::error!("[Relay] write error for {writer_id}: {e}");
                break;
            }
        }
    });

    let mut session = CallerSession {
        id: id.clone(),
        ctx,
        state: SessionState::New,
        origin: None,
        tunnel: None,
        frames_tx,
    };

    let mut decoder = FrameDecoder::new();
    let mut tunnel_rx: Option<mpsc::Receiver<TunnelEvent>> = None;
    let mut buf = [0u8; 64 * 1024];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    log::info!("[Relay] caller disconnected: {id}");
                    break;
                }
                Ok(n) => {
                    let frames = match decoder.feed(&buf[..n]) {
                        Ok(frames) => frames,
                        Err(e) => {
                            log::error!("[Relay] frame decode error for {id}: {e}");
                            break;
                        }
                    };
                    let mut close = false;
                    for frame in frames {
                        if let Flow::Close = session.handle_frame(frame, &mut tunnel_rx).await {
                            close = true;
                            break;
                        }
                    }
                    if close {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("[Relay] read error for {id}: {e}");
                    break;
                }
            },

            event = recv_tunnel(&mut tunnel_rx) => match event {
                Some(TunnelEvent::Data(bytes)) => {
                    session.send_frame(&Frame::StreamData(bytes));
                }
                Some(TunnelEvent::Error(msg)) => {
                    session.send_json(&RouterMessage::Error { v: msg });
                }
                Some(TunnelEvent::Closed) | None => {
                    // Tunnel is gone; the session ends with it.
                    log::info!("[Relay] tunnel closed for {id}");
                    session.tunnel = None;
                    tunnel_rx = None;
                    break;
                }
            },
        }
    }

    session.state = SessionState::Closed;
    log::debug!("[Relay] session finished: {id} ({:?})", session.state);
    // Dropping the session releases its tunnel handle, which closes the
    // tunnel transport gracefully; the writer task drains queued frames
    // and ends once the frame channel closes.
}

/// Receive from the tunnel when one is attached; pend forever otherwise
/// so the select arm stays quiet for tunnel-less sessions.
async fn recv_tunnel(rx: &mut Option<mpsc::Receiver<TunnelEvent>>) -> Option<TunnelEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl CallerSession {
    fn send_frame(&self, frame: &Frame) {
        if self.frames_tx.send(frame.encode()).is_err() {
            log::debug!("[Relay] dropping frame for finished session {}", self.id);
        }
    }

    fn send_json(&self, msg: &RouterMessage) {
        let value = serde_json::to_value(msg).expect("router message serialization cannot fail");
        self.send_frame(&Frame::Json(value));
    }

    /// Dispatch one decoded caller frame.
    async fn handle_frame(
        &mut self,
        frame: Frame,
        tunnel_rx: &mut Option<mpsc::Receiver<TunnelEvent>>,
    ) -> Flow {
        match frame {
            Frame::Json(value) => match serde_json::from_value::<CallerMessage>(value) {
                Ok(CallerMessage::Sail(req)) => self.handle_sail(req, tunnel_rx).await,
                Err(e) => {
                    log::warn!("[Relay] unrecognized message from {}: {e}", self.id);
                    self.send_json(&RouterMessage::failure_msg(format!(
                        "unrecognized relay message: {e}"
                    )));
                    Flow::Continue
                }
            },
            Frame::StreamInput(bytes) => {
                self.handle_input(bytes);
                Flow::Continue
            }
            Frame::StreamData(_) => {
                // Router→caller kind; callers never send it.
                log::warn!("[Relay] caller {} sent unexpected frame kind", self.id);
                Flow::Continue
            }
        }
    }

    /// Forward caller input to the session's tunnel.
    fn handle_input(&mut self, bytes: Vec<u8>) {
        let Some(tunnel) = &self.tunnel else {
            log::warn!("[Relay] input from {} with no tunnel active", self.id);
            return;
        };
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("[Relay] non-UTF-8 input from {}: {e}", self.id);
                return;
            }
        };
        if let Err(e) = tunnel.send(&text) {
            self.send_json(&RouterMessage::Error { v: e.to_string() });
        }
    }

    /// Handle one `sail` request. Every failure path resolves into a
    /// structured response; nothing propagates.
    async fn handle_sail(
        &mut self,
        req: SailRequest,
        tunnel_rx: &mut Option<mpsc::Receiver<TunnelEvent>>,
    ) -> Flow {
        if let Some(project_url) = req.project_url {
            return self.handle_launch(project_url, req.origin, tunnel_rx).await;
        }

        if let Some(client_message) = req.client_message {
            // Correlated passthrough: make sure the channel is up, then
            // relay the opaque message and its positional response.
            let result = match self.ctx.channel.connect().await {
                Ok(_) => self.ctx.channel.send(client_message).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(server_message) => {
                    self.send_json(&RouterMessage::with_server_message(server_message));
                }
                Err(e) => self.send_json(&RouterMessage::failure(&e)),
            }
            return Flow::Continue;
        }

        // Availability probe.
        match self.ctx.channel.connect().await {
            Ok(url) => self.send_json(&RouterMessage::with_url(url)),
            Err(e) => self.send_json(&RouterMessage::failure(&e)),
        }
        Flow::Continue
    }

    /// Approval-gated launch: connect the channel, open a tunnel to the
    /// host's run endpoint, and go Active.
    async fn handle_launch(
        &mut self,
        project_url: String,
        origin: Option<String>,
        tunnel_rx: &mut Option<mpsc::Receiver<TunnelEvent>>,
    ) -> Flow {
        // The data model allows zero-or-one tunnel per session; a caller
        // wanting a second stream opens a second relay connection.
        if self.state == SessionState::Active || self.tunnel.is_some() {
            self.send_json(&RouterMessage::failure_msg(
                "a tunnel is already active on this session",
            ));
            return Flow::Continue;
        }

        let Some(origin) = origin.or_else(|| self.origin.clone()) else {
            self.send_json(&RouterMessage::failure_msg(
                "an origin is required to launch a project",
            ));
            return Flow::Continue;
        };
        let Some(host) = origin_host(&origin) else {
            self.send_json(&RouterMessage::failure_msg(format!(
                "invalid origin: {origin:?}"
            )));
            return Flow::Continue;
        };
        self.origin = Some(origin);

        self.state = SessionState::AwaitingApproval;
        if !self.ctx.gate.is_approved(&host).await {
            self.state = SessionState::Rejected;
            log::warn!("[Relay] denied launch from unapproved host {host} ({})", self.id);
            self.send_json(&RouterMessage::failure(&RelayError::ApprovalDenied { host }));
            // Rejected → Closed: the session does not outlive the denial.
            return Flow::Close;
        }
        self.state = SessionState::Approved;

        let endpoint = match self.ctx.channel.connect().await {
            Ok(url) => url,
            Err(e) => {
                self.send_json(&RouterMessage::failure(&e));
                return Flow::Continue;
            }
        };

        let socket_url = format!("{}{}", http_to_ws_scheme(&endpoint), RUN_ENDPOINT_PATH);
        match SocketTunnel::open(&socket_url, &project_url, self.ctx.tunnel_open_timeout).await
        {
            Ok((tunnel, rx)) => {
                log::info!(
                    "[Relay] session {} active: {project_url} via {socket_url}",
                    self.id
                );
                self.tunnel = Some(tunnel);
                *tunnel_rx = Some(rx);
                self.state = SessionState::Active;
                self.send_json(&RouterMessage::with_url(endpoint));
            }
            Err(e) => {
                self.send_json(&RouterMessage::failure(&e));
            }
        }
        Flow::Continue
    }
}
