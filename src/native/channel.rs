//! The single channel to the Sail host service.
//!
//! At most one logical connection exists per process. `connect()` is
//! idempotent and coalescing: an established channel returns its stored
//! endpoint, and concurrent callers during a handshake all observe the
//! outcome of the one in-flight attempt — a second host process is never
//! spawned alongside a live one.
//!
//! Disconnection (host exit, transport error, or `dispose()`) fails every
//! pending request with `ChannelClosed`, resets the state, and the next
//! `connect()` starts fresh. There is no automatic reconnection; callers
//! re-initiate lazily.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::correlator::RequestCorrelator;
use super::framing::{encode_message, handshake_url, MessageDecoder};
use super::host::{HostIo, HostLauncher};
use crate::error::RelayError;

/// Outcome broadcast to callers waiting on an in-flight handshake.
type ConnectOutcome = Option<Result<String, RelayError>>;

/// State shared with the reader task: the pending-request queue and the
/// liveness flag the reader clears when the transport ends.
struct ChannelShared {
    correlator: Mutex<RequestCorrelator>,
    alive: AtomicBool,
}

/// An established connection: endpoint, outbound queue, I/O tasks.
struct ActiveChannel {
    endpoint: String,
    outgoing: mpsc::UnboundedSender<Value>,
    shared: Arc<ChannelShared>,
    child: Option<Child>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl ActiveChannel {
    /// Stop tasks, kill the host process, and fail anything pending.
    fn teardown(mut self, reason: &str) {
        self.shared.alive.store(false, Ordering::SeqCst);
        self.reader_task.abort();
        self.writer_task.abort();
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        let drained = self
            .shared
            .correlator
            .lock()
            .expect("correlator mutex poisoned")
            .drain(&RelayError::closed(reason));
        if drained > 0 {
            log::warn!("[Native] {reason}; failed {drained} pending request(s)");
        }
    }
}

enum ConnState {
    Disconnected,
    Connecting {
        attempt: u64,
        done: watch::Receiver<ConnectOutcome>,
    },
    Active(ActiveChannel),
}

/// Owner of the process-wide host connection.
///
/// Constructed once and injected (`Arc`) into the router; there is no
/// ambient global connector state.
pub struct NativeChannel {
    launcher: Arc<dyn HostLauncher>,
    connect_timeout: Duration,
    request_timeout: Duration,
    state: Mutex<ConnState>,
    next_attempt: std::sync::atomic::AtomicU64,
}

impl std::fmt::Debug for NativeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeChannel")
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Resets a `Connecting` state back to `Disconnected` if the owning
/// attempt is dropped before committing (caller cancelled mid-handshake),
/// so later callers are not stuck waiting on a dead attempt.
struct AttemptGuard<'a> {
    channel: &'a NativeChannel,
    attempt: u64,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.channel.state.lock().expect("channel state mutex poisoned");
        if matches!(&*state, ConnState::Connecting { attempt, .. } if *attempt == self.attempt) {
            *state = ConnState::Disconnected;
        }
    }
}

impl NativeChannel {
    /// New channel using `launcher` for the transport and the given
    /// deadlines for handshake and per-request waits.
    pub fn new(
        launcher: Arc<dyn HostLauncher>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            connect_timeout,
            request_timeout,
            state: Mutex::new(ConnState::Disconnected),
            next_attempt: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Connect to the host service, returning its advertised endpoint URL.
    ///
    /// Idempotent: an established channel returns the stored endpoint, and
    /// callers arriving during a handshake share that attempt's outcome.
    pub async fn connect(&self) -> Result<String, RelayError> {
        loop {
            enum Action {
                Wait(watch::Receiver<ConnectOutcome>),
                Attempt(u64, watch::Sender<ConnectOutcome>),
            }

            let action = {
                let mut state = self.state.lock().expect("channel state mutex poisoned");
                match &*state {
                    ConnState::Active(active) if active.shared.alive.load(Ordering::SeqCst) => {
                        return Ok(active.endpoint.clone());
                    }
                    ConnState::Active(_) => {
                        // The reader observed a disconnect; clear the husk
                        // and fall through to a fresh attempt.
                        let old = std::mem::replace(&mut *state, ConnState::Disconnected);
                        if let ConnState::Active(active) = old {
                            active.teardown("host connection lost");
                        }
                        continue;
                    }
                    ConnState::Connecting { done, .. } => Action::Wait(done.clone()),
                    ConnState::Disconnected => {
                        let attempt = self
                            .next_attempt
                            .fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = watch::channel(None);
                        *state = ConnState::Connecting { attempt, done: rx };
                        Action::Attempt(attempt, tx)
                    }
                }
            };

            match action {
                Action::Wait(mut rx) => {
                    loop {
                        let settled = rx.borrow().clone();
                        if let Some(outcome) = settled {
                            return outcome;
                        }
                        if rx.changed().await.is_err() {
                            return Err(RelayError::unavailable(
                                "connect attempt was cancelled",
                            ));
                        }
                    }
                }
                Action::Attempt(attempt, tx) => {
                    let mut guard = AttemptGuard { channel: self, attempt, armed: true };
                    let outcome = self.establish().await;
                    guard.armed = false;

                    let result = {
                        let mut state =
                            self.state.lock().expect("channel state mutex poisoned");
                        let current = matches!(
                            &*state,
                            ConnState::Connecting { attempt: a, .. } if *a == attempt
                        );
                        if current {
                            match outcome {
                                Ok(active) => {
                                    let endpoint = active.endpoint.clone();
                                    log::info!("[Native] connected, host endpoint {endpoint}");
                                    *state = ConnState::Active(active);
                                    Ok(endpoint)
                                }
                                Err(e) => {
                                    *state = ConnState::Disconnected;
                                    Err(e)
                                }
                            }
                        } else {
                            // dispose() superseded this attempt.
                            if let Ok(active) = outcome {
                                active.teardown("channel disposed during connect");
                            }
                            Err(RelayError::closed("channel disposed during connect"))
                        }
                    };

                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    /// Launch the host and complete the handshake.
    async fn establish(&self) -> Result<ActiveChannel, RelayError> {
        let HostIo { mut reader, writer, child } = self.launcher.launch().await?;

        let mut decoder = MessageDecoder::new();
        let handshake = tokio::time::timeout(
            self.connect_timeout,
            read_handshake(&mut reader, &mut decoder),
        )
        .await
        .map_err(|_| {
            RelayError::unavailable(format!(
                "timed out after {:?} waiting for the host handshake",
                self.connect_timeout
            ))
        })??;

        let Some(endpoint) = handshake_url(&handshake) else {
            return Err(RelayError::unavailable("invalid handshake message from host"));
        };
        let endpoint = endpoint.to_string();

        let shared = Arc::new(ChannelShared {
            correlator: Mutex::new(RequestCorrelator::new()),
            alive: AtomicBool::new(true),
        });
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, out_rx));
        let reader_task = tokio::spawn(read_loop(reader, decoder, Arc::clone(&shared)));

        Ok(ActiveChannel {
            endpoint,
            outgoing: out_tx,
            shared,
            child,
            reader_task,
            writer_task,
        })
    }

    /// Send an opaque request to the host and await its response.
    ///
    /// Fails with `NotConnected` before a successful `connect()`. Requests
    /// are answered in send order; concurrent senders are serialized at the
    /// enqueue point so continuation order always matches wire order.
    pub async fn send(&self, request: Value) -> Result<Value, RelayError> {
        let rx = {
            let state = self.state.lock().expect("channel state mutex poisoned");
            match &*state {
                ConnState::Active(active) if active.shared.alive.load(Ordering::SeqCst) => {
                    let mut correlator = active
                        .shared
                        .correlator
                        .lock()
                        .expect("correlator mutex poisoned");
                    let rx = correlator.push();
                    // A failed queue send means the writer died; the reader
                    // will notice the dead transport and drain our
                    // continuation with ChannelClosed.
                    let _ = active.outgoing.send(request);
                    rx
                }
                _ => return Err(RelayError::NotConnected),
            }
        };

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::closed("channel torn down")),
            Err(_) => Err(RelayError::closed(format!(
                "timed out after {:?} waiting for the host response",
                self.request_timeout
            ))),
        }
    }

    /// True while an established, live connection exists.
    pub fn is_connected(&self) -> bool {
        let state = self.state.lock().expect("channel state mutex poisoned");
        matches!(&*state, ConnState::Active(a) if a.shared.alive.load(Ordering::SeqCst))
    }

    /// Tear the channel down explicitly. Safe to call repeatedly.
    pub fn dispose(&self) {
        let prev = {
            let mut state = self.state.lock().expect("channel state mutex poisoned");
            std::mem::replace(&mut *state, ConnState::Disconnected)
        };
        match prev {
            ConnState::Active(active) => {
                active.teardown("channel disposed");
                log::info!("[Native] channel disposed");
            }
            ConnState::Connecting { .. } => {
                // The in-flight attempt observes the supersession when it
                // tries to commit.
                log::info!("[Native] channel disposed during connect");
            }
            ConnState::Disconnected => {}
        }
    }
}

impl Drop for NativeChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Read until the first complete host message arrives.
async fn read_handshake(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    decoder: &mut MessageDecoder,
) -> Result<Value, RelayError> {
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| {
            RelayError::unavailable(format!("host transport error during handshake: {e}"))
        })?;
        if n == 0 {
            return Err(RelayError::unavailable(
                "host disconnected before completing the handshake",
            ));
        }
        let mut messages = decoder.feed(&buf[..n]).map_err(|e| {
            RelayError::unavailable(format!("host handshake framing error: {e}"))
        })?;
        if messages.is_empty() {
            continue;
        }
        let first = messages.remove(0);
        for extra in messages {
            log::debug!("[Native] unsolicited message during handshake: {extra}");
        }
        return Ok(first);
    }
}

/// Writer task: frames queued requests onto the host's stdin.
async fn write_loop(
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(msg) = rx.recv().await {
        let frame = encode_message(&msg);
        if let Err(e) = writer.write_all(&frame).await {
            log::error!("[Native] write error: {e}");
            break;
        }
        if let Err(e) = writer.flush().await {
            log::error!("[Native] flush error: {e}");
            break;
        }
    }
}

/// Reader task: decodes host messages, resolves pending requests in FIFO
/// order, and drains the queue when the transport ends.
async fn read_loop(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    mut decoder: MessageDecoder,
    shared: Arc<ChannelShared>,
) {
    let mut buf = [0u8; 64 * 1024];
    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "host closed the channel".to_string(),
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(messages) => {
                    for msg in messages {
                        let unsolicited = shared
                            .correlator
                            .lock()
                            .expect("correlator mutex poisoned")
                            .resolve_next(msg);
                        if let Some(msg) = unsolicited {
                            log::debug!("[Native] unsolicited host message: {msg}");
                        }
                    }
                }
                Err(e) => break format!("host framing error: {e}"),
            },
            Err(e) => break format!("host transport error: {e}"),
        }
    };

    shared.alive.store(false, Ordering::SeqCst);
    let drained = shared
        .correlator
        .lock()
        .expect("correlator mutex poisoned")
        .drain(&RelayError::closed(&reason));
    if drained > 0 {
        log::warn!("[Native] {reason}; failed {drained} pending request(s)");
    } else {
        log::info!("[Native] {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;

    /// Test double: hands out pre-built in-memory pipes, counting launches.
    struct TestLauncher {
        io: Mutex<Vec<HostIo>>,
        launches: AtomicUsize,
    }

    #[async_trait]
    impl HostLauncher for TestLauncher {
        async fn launch(&self) -> Result<HostIo, RelayError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.io
                .lock()
                .expect("test launcher mutex poisoned")
                .pop()
                .ok_or_else(|| RelayError::unavailable("no more transports"))
        }
    }

    /// Host side of one in-memory transport: write to `to_broker`, read
    /// requests from `from_broker`.
    struct FakeHost {
        to_broker: DuplexStream,
        from_broker: DuplexStream,
        decoder: MessageDecoder,
        queued: std::collections::VecDeque<Value>,
    }

    impl FakeHost {
        async fn write_msg(&mut self, msg: &Value) {
            self.to_broker
                .write_all(&encode_message(msg))
                .await
                .expect("fake host write");
        }

        async fn read_msg(&mut self) -> Value {
            loop {
                if let Some(msg) = self.queued.pop_front() {
                    return msg;
                }
                let mut buf = [0u8; 8192];
                let n = self.from_broker.read(&mut buf).await.expect("fake host read");
                assert!(n > 0, "broker closed its writer");
                let msgs = self.decoder.feed(&buf[..n]).expect("fake host decode");
                self.queued.extend(msgs);
            }
        }
    }

    fn pair() -> (Arc<TestLauncher>, FakeHost) {
        let (broker_rd, host_wr) = tokio::io::duplex(64 * 1024);
        let (host_rd, broker_wr) = tokio::io::duplex(64 * 1024);
        let io = HostIo {
            reader: Box::new(broker_rd),
            writer: Box::new(broker_wr),
            child: None,
        };
        let launcher = Arc::new(TestLauncher {
            io: Mutex::new(vec![io]),
            launches: AtomicUsize::new(0),
        });
        let host = FakeHost {
            to_broker: host_wr,
            from_broker: host_rd,
            decoder: MessageDecoder::new(),
            queued: std::collections::VecDeque::new(),
        };
        (launcher, host)
    }

    fn channel(launcher: Arc<TestLauncher>) -> NativeChannel {
        NativeChannel::new(launcher, Duration::from_secs(2), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn connect_resolves_handshake_url() {
        let (launcher, mut host) = pair();
        let chan = channel(Arc::clone(&launcher));

        let connect = chan.connect();
        let handshake = async {
            host.write_msg(&json!({"url": "http://127.0.0.1:8828"})).await;
        };
        let (url, ()) = tokio::join!(connect, handshake);
        assert_eq!(url.unwrap(), "http://127.0.0.1:8828");

        // Second connect reuses the channel.
        assert_eq!(chan.connect().await.unwrap(), "http://127.0.0.1:8828");
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let (launcher, mut host) = pair();
        let chan = Arc::new(channel(Arc::clone(&launcher)));

        let a = tokio::spawn({
            let chan = Arc::clone(&chan);
            async move { chan.connect().await }
        });
        let b = tokio::spawn({
            let chan = Arc::clone(&chan);
            async move { chan.connect().await }
        });

        // Let both callers reach the handshake wait before answering.
        tokio::time::sleep(Duration::from_millis(50)).await;
        host.write_msg(&json!({"url": "http://127.0.0.1:9"})).await;

        assert_eq!(a.await.unwrap().unwrap(), "http://127.0.0.1:9");
        assert_eq!(b.await.unwrap().unwrap(), "http://127.0.0.1:9");
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_before_connect_is_not_connected() {
        let (launcher, _host) = pair();
        let chan = channel(launcher);
        let err = chan.send(json!({"type": "list"})).await.unwrap_err();
        assert_eq!(err, RelayError::NotConnected);
    }

    #[tokio::test]
    async fn responses_resolve_requests_in_send_order() {
        let (launcher, mut host) = pair();
        let chan = Arc::new(channel(launcher));

        let handshake = async {
            host.write_msg(&json!({"url": "http://h"})).await;
            host
        };
        let (url, mut host) = tokio::join!(chan.connect(), handshake);
        url.unwrap();

        let mut sends = Vec::new();
        for i in 0..3 {
            let chan = Arc::clone(&chan);
            sends.push(tokio::spawn(async move {
                chan.send(json!({"type": "run", "seq": i})).await
            }));
        }

        // Collect all three requests before answering any, then reply in
        // the order they arrived on the wire.
        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(host.read_msg().await);
        }
        for req in &got {
            host.write_msg(&json!({"reply_to": req["seq"]})).await;
        }

        for (i, handle) in sends.into_iter().enumerate() {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response["reply_to"], json!(i), "response out of order");
        }
    }

    #[tokio::test]
    async fn disconnect_drains_all_pending_requests() {
        let (launcher, mut host) = pair();
        let chan = Arc::new(channel(launcher));

        let handshake = async {
            host.write_msg(&json!({"url": "http://h"})).await;
            host
        };
        let (url, mut host) = tokio::join!(chan.connect(), handshake);
        url.unwrap();

        let s1 = tokio::spawn({
            let chan = Arc::clone(&chan);
            async move { chan.send(json!({"seq": 1})).await }
        });
        let s2 = tokio::spawn({
            let chan = Arc::clone(&chan);
            async move { chan.send(json!({"seq": 2})).await }
        });

        // Wait for both to be on the wire, then kill the host side.
        host.read_msg().await;
        host.read_msg().await;
        drop(host);

        for handle in [s1, s2] {
            let err = handle.await.unwrap().unwrap_err();
            assert!(
                matches!(err, RelayError::ChannelClosed { .. }),
                "expected ChannelClosed, got: {err:?}"
            );
        }

        // Channel requires a fresh connect before further use.
        let err = chan.send(json!({"seq": 3})).await.unwrap_err();
        assert_eq!(err, RelayError::NotConnected);
    }

    #[tokio::test]
    async fn immediate_disconnect_fails_connect_with_unavailable() {
        let (launcher, host) = pair();
        drop(host); // host exits before writing anything
        let chan = channel(launcher);

        let err = chan.connect().await.unwrap_err();
        match err {
            RelayError::ChannelUnavailable { reason } => {
                assert!(reason.contains("before completing"), "reason: {reason}");
            }
            other => panic!("expected ChannelUnavailable, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_without_url_is_rejected() {
        let (launcher, mut host) = pair();
        let chan = channel(launcher);

        let connect = chan.connect();
        let handshake = async {
            host.write_msg(&json!({"type": "hello"})).await;
        };
        let (result, ()) = tokio::join!(connect, handshake);
        match result.unwrap_err() {
            RelayError::ChannelUnavailable { reason } => {
                assert!(reason.contains("invalid handshake"), "reason: {reason}");
            }
            other => panic!("expected ChannelUnavailable, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_times_out_without_handshake() {
        let (launcher, _host) = pair(); // keep host alive but silent
        let chan = NativeChannel::new(
            launcher,
            Duration::from_millis(100),
            Duration::from_secs(2),
        );

        let err = chan.connect().await.unwrap_err();
        match err {
            RelayError::ChannelUnavailable { reason } => {
                assert!(reason.contains("timed out"), "reason: {reason}");
            }
            other => panic!("expected ChannelUnavailable, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsolicited_messages_do_not_shift_correlation() {
        let (launcher, mut host) = pair();
        let chan = Arc::new(channel(launcher));

        let handshake = async {
            host.write_msg(&json!({"url": "http://h"})).await;
            host
        };
        let (url, mut host) = tokio::join!(chan.connect(), handshake);
        url.unwrap();

        // Spontaneous host message while nothing is outstanding.
        host.write_msg(&json!({"type": "notice"})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let send = chan.send(json!({"type": "list"}));
        let host_side = async {
            host.read_msg().await;
            host.write_msg(&json!({"type": "list", "projects": []})).await;
        };
        let (response, ()) = tokio::join!(send, host_side);
        assert_eq!(response.unwrap()["type"], json!("list"));
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_requires_reconnect() {
        let (launcher, mut host) = pair();
        let chan = channel(launcher);

        let connect = chan.connect();
        let handshake = async {
            host.write_msg(&json!({"url": "http://h"})).await;
        };
        let (url, ()) = tokio::join!(connect, handshake);
        url.unwrap();

        chan.dispose();
        chan.dispose(); // second call is a no-op

        let err = chan.send(json!({"seq": 1})).await.unwrap_err();
        assert_eq!(err, RelayError::NotConnected);
    }
}
