//! The one lock in the system: socket threads push, the worker pops.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::http::StatusCode;
use scenegate_kernel::Command;
use serde_json::{Value, json};
use tokio::sync::oneshot;

/// Answer for one socket request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Value,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }
}

/// A parsed socket request waiting for the worker, plus where to send the
/// answer.
#[derive(Debug)]
pub struct PendingRequest {
    pub command: Command,
    pub reply: oneshot::Sender<Reply>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<PendingRequest>,
    /// Set between [`RequestQueue::close`] and [`RequestQueue::open`].
    closed: Option<Reply>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestQueue {
    inner: Arc<Mutex<Inner>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a request, or answers it at once while the queue is closed.
    pub fn push(&self, request: PendingRequest) {
        let rejection = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.pending.push_back(request);
                return;
            }
            inner.closed.clone()
        };
        if let Some(reply) = rejection {
            let _ = request.reply.send(reply);
        }
    }

    pub fn pop(&self) -> Option<PendingRequest> {
        self.lock().pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Empties the queue answering every waiter with `reply`, and keeps
    /// answering later pushes the same way until reopened.
    pub fn close(&self, reply: Reply) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = Some(reply.clone());
            inner.pending.drain(..).collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.reply.send(reply.clone());
        }
        count
    }

    pub fn open(&self) {
        self.lock().closed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(action: &str) -> (PendingRequest, oneshot::Receiver<Reply>) {
        let (reply, rx) = oneshot::channel();
        let command = Command::new(action);
        (PendingRequest { command, reply }, rx)
    }

    #[test]
    fn fifo_then_close_rejects_waiters_and_late_pushes() {
        let queue = RequestQueue::new();
        let (a, _rx_a) = request("a");
        let (b, mut rx_b) = request("b");
        queue.push(a);
        queue.push(b);
        assert_eq!(queue.pop().unwrap().command.action(), "a");

        let stopping = Reply::error(StatusCode::SERVICE_UNAVAILABLE, "stopping");
        assert_eq!(queue.close(stopping), 1);
        assert!(queue.is_empty());
        assert_eq!(rx_b.try_recv().unwrap().status, StatusCode::SERVICE_UNAVAILABLE);

        let (late, mut rx_late) = request("late");
        queue.push(late);
        assert!(queue.is_empty());
        assert_eq!(rx_late.try_recv().unwrap().body["error"], "stopping");

        queue.open();
        let (fresh, _rx_fresh) = request("fresh");
        queue.push(fresh);
        assert_eq!(queue.len(), 1);
    }
}
