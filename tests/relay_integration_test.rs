//! End-to-end relay tests: a real Unix socket caller, a fake host service
//! over in-memory pipes, and a real WebSocket endpoint.
//!
//! These exercise the full dispatch path — probe, passthrough, approval
//! gate, launch, streaming — the way a browser caller would drive it.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use sail_relay::approval::HostAllowList;
use sail_relay::error::RelayError;
use sail_relay::native::framing::{encode_message, MessageDecoder};
use sail_relay::native::{HostIo, HostLauncher, NativeChannel};
use sail_relay::relay::framing::{Frame, FrameDecoder};
use sail_relay::{RelayServer, SessionCtx};

const TIMEOUT: Duration = Duration::from_secs(5);

// ─── Fake host service ─────────────────────────────────────────────────────

/// Launcher handing out pre-built in-memory transports, counting launches.
struct TestLauncher {
    io: Mutex<Vec<HostIo>>,
    launches: Arc<AtomicUsize>,
}

#[async_trait]
impl HostLauncher for TestLauncher {
    async fn launch(&self) -> Result<HostIo, RelayError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.io
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| RelayError::ChannelUnavailable {
                reason: "no more transports".to_string(),
            })
    }
}

/// Spawn a fake host: sends the handshake with `endpoint`, then echoes
/// every request back under an `echo` key. Returns the launcher to inject.
fn spawn_fake_host(endpoint: String) -> (Arc<TestLauncher>, Arc<AtomicUsize>) {
    let (broker_rd, mut host_wr) = tokio::io::duplex(64 * 1024);
    let (mut host_rd, broker_wr) = tokio::io::duplex(64 * 1024);

    tokio::spawn(async move {
        host_wr
            .write_all(&encode_message(&json!({ "url": endpoint })))
            .await
            .unwrap();

        let mut decoder = MessageDecoder::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = match host_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for request in decoder.feed(&buf[..n]).unwrap() {
                let reply = json!({ "echo": request });
                if host_wr.write_all(&encode_message(&reply)).await.is_err() {
                    return;
                }
            }
        }
    });

    let launches = Arc::new(AtomicUsize::new(0));
    let launcher = Arc::new(TestLauncher {
        io: Mutex::new(vec![HostIo {
            reader: Box::new(broker_rd),
            writer: Box::new(broker_wr),
            child: None,
        }]),
        launches: Arc::clone(&launches),
    });
    (launcher, launches)
}

// ─── Fake run endpoint ─────────────────────────────────────────────────────

/// WebSocket server standing in for the host's run endpoint. Behavior is
/// keyed off the project name in the init frame:
/// - contains "bogus": send an unknown frame tag
/// - contains "echo-input": wait for one text frame, send it back base64d
/// - otherwise: send one "hello" data frame, then close normally
async fn spawn_run_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

                let init = ws.next().await.unwrap().unwrap();
                let init: Value = serde_json::from_str(init.to_text().unwrap()).unwrap();
                let project = init["project"].as_str().unwrap().to_string();

                if project.contains("bogus") {
                    ws.send(Message::Text(r#"{"type":"bogus"}"#.to_string()))
                        .await
                        .unwrap();
                } else if project.contains("echo-input") {
                    if let Some(Ok(Message::Text(text))) = ws.next().await {
                        let frame = json!({"type": "data", "v": BASE64.encode(text.as_bytes())});
                        ws.send(Message::Text(frame.to_string())).await.unwrap();
                    }
                } else {
                    let frame = json!({"type": "data", "v": BASE64.encode("hello")});
                    ws.send(Message::Text(frame.to_string())).await.unwrap();
                    // Explicit 1000: a codeless close reads as 1005 and
                    // would be reported as abnormal.
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        }))
                        .await;
                }
            });
        }
    });

    // The handshake URL is HTTP-shaped; the router converts the scheme and
    // appends the run path itself.
    format!("http://{addr}")
}

// ─── Caller harness ────────────────────────────────────────────────────────

/// A caller connection speaking the relay framing.
struct Caller {
    stream: UnixStream,
    decoder: FrameDecoder,
    queued: VecDeque<Frame>,
}

impl Caller {
    async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        Self { stream, decoder: FrameDecoder::new(), queued: VecDeque::new() }
    }

    async fn send(&mut self, frame: &Frame) {
        self.stream.write_all(&frame.encode()).await.unwrap();
    }

    async fn send_json(&mut self, value: Value) {
        self.send(&Frame::Json(value)).await;
    }

    /// Next frame, or `None` once the router closes the connection.
    async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.queued.pop_front() {
                return Some(frame);
            }
            let mut buf = [0u8; 8192];
            let n = tokio::time::timeout(TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for relay frame")
                .unwrap();
            if n == 0 {
                return None;
            }
            self.queued.extend(self.decoder.feed(&buf[..n]).unwrap());
        }
    }

    /// Next frame, asserted to be a JSON relay message.
    async fn next_json(&mut self) -> Value {
        match self.next_frame().await {
            Some(Frame::Json(value)) => value,
            other => panic!("expected JSON frame, got: {other:?}"),
        }
    }
}

// ─── Test rig ──────────────────────────────────────────────────────────────

struct Rig {
    server: RelayServer,
    launches: Arc<AtomicUsize>,
    _tmp: tempfile::TempDir,
}

/// Full stack: run endpoint + fake host + relay server, default allow-list.
async fn rig() -> Rig {
    let endpoint = spawn_run_endpoint().await;
    let (launcher, launches) = spawn_fake_host(endpoint);

    let channel = Arc::new(NativeChannel::new(
        launcher,
        Duration::from_secs(2),
        Duration::from_secs(2),
    ));
    let gate = Arc::new(HostAllowList::in_memory());

    let tmp = tempfile::TempDir::new().unwrap();
    let socket_path = tmp.path().join("relay.sock");
    let server = RelayServer::start(
        socket_path,
        SessionCtx { channel, gate, tunnel_open_timeout: Duration::from_secs(2) },
    )
    .unwrap();

    Rig { server, launches, _tmp: tmp }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn probe_reports_host_endpoint() {
    let rig = rig().await;
    let mut caller = Caller::connect(rig.server.socket_path()).await;

    caller.send_json(json!({"type": "sail"})).await;
    let response = caller.next_json().await;

    assert_eq!(response["type"], "sail");
    assert!(response.get("error").is_none(), "unexpected error: {response}");
    assert!(response["url"].as_str().unwrap().starts_with("http://127.0.0.1:"));
}

#[tokio::test]
async fn probe_fails_cleanly_when_host_is_not_registered() {
    // Real manifest resolution against an empty directory.
    let tmp = tempfile::TempDir::new().unwrap();
    let launcher = sail_relay::NativeHostLauncher::new(
        "com.coder.sail",
        vec![tmp.path().to_path_buf()],
    );
    let channel = Arc::new(NativeChannel::new(
        Arc::new(launcher),
        Duration::from_secs(2),
        Duration::from_secs(2),
    ));
    let socket_path = tmp.path().join("relay.sock");
    let server = RelayServer::start(
        socket_path,
        SessionCtx {
            channel,
            gate: Arc::new(HostAllowList::in_memory()),
            tunnel_open_timeout: Duration::from_secs(2),
        },
    )
    .unwrap();

    let mut caller = Caller::connect(server.socket_path()).await;
    caller.send_json(json!({"type": "sail"})).await;
    let response = caller.next_json().await;

    assert_eq!(response["type"], "sail");
    let error = response["error"].as_str().unwrap();
    assert!(error.contains("not registered"), "error: {error}");

    server.shutdown();
}

#[tokio::test]
async fn client_message_round_trips_through_the_host() {
    let rig = rig().await;
    let mut caller = Caller::connect(rig.server.socket_path()).await;

    caller
        .send_json(json!({
            "type": "sail",
            "clientMessage": {"type": "list"},
        }))
        .await;
    let response = caller.next_json().await;

    assert_eq!(response["type"], "sail");
    assert!(response.get("error").is_none(), "unexpected error: {response}");
    assert_eq!(response["serverMessage"], json!({"echo": {"type": "list"}}));
}

#[tokio::test]
async fn responses_stay_in_request_order_across_callers() {
    let rig = rig().await;
    let mut a = Caller::connect(rig.server.socket_path()).await;
    let mut b = Caller::connect(rig.server.socket_path()).await;

    a.send_json(json!({"type": "sail", "clientMessage": {"seq": "a"}})).await;
    b.send_json(json!({"type": "sail", "clientMessage": {"seq": "b"}})).await;

    let ra = a.next_json().await;
    let rb = b.next_json().await;
    assert_eq!(ra["serverMessage"]["echo"]["seq"], "a");
    assert_eq!(rb["serverMessage"]["echo"]["seq"], "b");

    // One shared channel served both callers.
    assert_eq!(rig.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn launch_streams_tunnel_data_to_the_caller() {
    let rig = rig().await;
    let mut caller = Caller::connect(rig.server.socket_path()).await;

    caller
        .send_json(json!({
            "type": "sail",
            "projectUrl": "https://github.com/cdr/sail",
            "origin": "https://github.com/cdr/sail",
        }))
        .await;

    let response = caller.next_json().await;
    assert_eq!(response["type"], "sail");
    assert!(response.get("error").is_none(), "unexpected error: {response}");

    match caller.next_frame().await {
        Some(Frame::StreamData(bytes)) => assert_eq!(bytes, b"hello"),
        other => panic!("expected stream data, got: {other:?}"),
    }

    // Endpoint closes normally (1000): no error event, session just ends.
    assert_eq!(caller.next_frame().await, None);
}

#[tokio::test]
async fn caller_input_is_forwarded_to_the_tunnel() {
    let rig = rig().await;
    let mut caller = Caller::connect(rig.server.socket_path()).await;

    caller
        .send_json(json!({
            "type": "sail",
            "projectUrl": "https://github.com/cdr/echo-input",
            "origin": "https://github.com/cdr/echo-input",
        }))
        .await;
    let response = caller.next_json().await;
    assert!(response.get("error").is_none(), "unexpected error: {response}");

    caller.send(&Frame::StreamInput(b"ls -la\n".to_vec())).await;

    match caller.next_frame().await {
        Some(Frame::StreamData(bytes)) => assert_eq!(bytes, b"ls -la\n"),
        other => panic!("expected echoed input, got: {other:?}"),
    }
}

#[tokio::test]
async fn unapproved_origin_is_denied_with_no_host_activity() {
    let rig = rig().await;
    let mut caller = Caller::connect(rig.server.socket_path()).await;

    caller
        .send_json(json!({
            "type": "sail",
            "projectUrl": "https://evil.example/repo",
            "origin": "https://evil.example/page",
        }))
        .await;

    let response = caller.next_json().await;
    assert_eq!(response["type"], "sail");
    let error = response["error"].as_str().unwrap();
    assert!(error.contains("not approved"), "error: {error}");

    // Denial closes the session.
    assert_eq!(caller.next_frame().await, None);

    // The gate fired before any channel or tunnel work.
    assert_eq!(rig.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn protocol_violation_kills_one_tunnel_not_the_neighbor() {
    let rig = rig().await;

    // Session A: endpoint that speaks garbage.
    let mut a = Caller::connect(rig.server.socket_path()).await;
    a.send_json(json!({
        "type": "sail",
        "projectUrl": "https://github.com/cdr/bogus",
        "origin": "https://github.com/cdr/bogus",
    }))
    .await;
    let response = a.next_json().await;
    assert!(response.get("error").is_none(), "unexpected error: {response}");

    // A receives exactly one error event, then its session closes.
    let event = a.next_json().await;
    assert_eq!(event["type"], "error");
    assert!(
        event["v"].as_str().unwrap().contains("unknown tunnel frame type"),
        "event: {event}"
    );
    assert_eq!(a.next_frame().await, None);

    // Session B on the same relay still streams fine afterwards.
    let mut b = Caller::connect(rig.server.socket_path()).await;
    b.send_json(json!({
        "type": "sail",
        "projectUrl": "https://github.com/cdr/sail",
        "origin": "https://github.com/cdr/sail",
    }))
    .await;
    let response = b.next_json().await;
    assert!(response.get("error").is_none(), "unexpected error: {response}");
    match b.next_frame().await {
        Some(Frame::StreamData(bytes)) => assert_eq!(bytes, b"hello"),
        other => panic!("expected stream data, got: {other:?}"),
    }
}

#[tokio::test]
async fn second_launch_on_an_active_session_is_refused() {
    let rig = rig().await;
    let mut caller = Caller::connect(rig.server.socket_path()).await;

    caller
        .send_json(json!({
            "type": "sail",
            "projectUrl": "https://github.com/cdr/echo-input",
            "origin": "https://github.com/cdr/echo-input",
        }))
        .await;
    let response = caller.next_json().await;
    assert!(response.get("error").is_none(), "unexpected error: {response}");

    caller
        .send_json(json!({
            "type": "sail",
            "projectUrl": "https://github.com/cdr/other",
            "origin": "https://github.com/cdr/other",
        }))
        .await;
    let response = caller.next_json().await;
    let error = response["error"].as_str().unwrap();
    assert!(error.contains("already active"), "error: {error}");
}
