//! Positional request/response correlation.
//!
//! The host protocol carries no request IDs: the host replies to requests
//! strictly in the order they were received, so correlation is by queue
//! position. A response always resolves the oldest pending request; a
//! message arriving with no requests outstanding is unsolicited (the
//! one-time handshake, or noise) and is never treated as a response.
//!
//! This positional scheme is a latent ordering assumption of the wire
//! protocol, not something this type can harden on its own — the host
//! echoes nothing an ID map could key on. Keeping the assumption confined
//! here means an ID-based scheme would replace only this type.

use std::collections::VecDeque;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RelayError;

/// One outstanding request awaiting the host's response.
struct Pending {
    tx: oneshot::Sender<Result<Value, RelayError>>,
    enqueued_at: Instant,
}

/// FIFO queue of continuations for in-flight requests.
#[derive(Default)]
pub struct RequestCorrelator {
    queue: VecDeque<Pending>,
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl RequestCorrelator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    /// Enqueue a continuation for a request about to be written.
    ///
    /// Must be called before the request bytes hit the wire so that the
    /// queue order matches the send order exactly.
    pub fn push(&mut self) -> oneshot::Receiver<Result<Value, RelayError>> {
        let (tx, rx) = oneshot::channel();
        self.queue.push_back(Pending { tx, enqueued_at: Instant::now() });
        rx
    }

    /// Resolve the oldest pending request with an inbound message.
    ///
    /// Returns the message back when no request was outstanding — the
    /// message is unsolicited (handshake traffic or host noise), not a
    /// response, and the caller decides what to do with it.
    pub fn resolve_next(&mut self, msg: Value) -> Option<Value> {
        match self.queue.pop_front() {
            Some(pending) => {
                log::trace!(
                    "[Native] response after {:?} in flight",
                    pending.enqueued_at.elapsed()
                );
                // Receiver may have given up (request timeout); ordering is
                // already consumed either way.
                let _ = pending.tx.send(Ok(msg));
                None
            }
            None => Some(msg),
        }
    }

    /// Fail every pending request, in order, with the given error.
    ///
    /// Returns how many requests were drained. Called on disconnect so no
    /// request is ever left unresolved.
    pub fn drain(&mut self, err: &RelayError) -> usize {
        let count = self.queue.len();
        for pending in self.queue.drain(..) {
            let _ = pending.tx.send(Err(err.clone()));
        }
        count
    }

    /// Number of requests currently outstanding.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
