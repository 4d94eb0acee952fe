//! Pending-call table: outstanding requests of one connection, keyed by
//! correlation token.
//!
//! A call leaves the table exactly once: on its response, or when the table
//! is cleared by teardown. Removal is the only way to reach the callback, so
//! a callback runs at most once. Cleared callbacks are dropped unrun.
//!
//! There is no expiry. A call whose target never responds stays until the
//! connection closes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::bridge::protocol::CorrelationToken;
use crate::error::ConnectionError;

pub(crate) type ResponseCallback = Box<dyn FnOnce(serde_json::Value) + Send + 'static>;

struct PendingCall {
    callback: ResponseCallback,
    issued_at: Instant,
}

#[derive(Default)]
struct Table {
    calls: HashMap<CorrelationToken, PendingCall>,
    closed: bool,
}

/// One exclusive lock per table. Callbacks always run after the lock is
/// released.
#[derive(Default)]
pub(crate) struct PendingCalls {
    table: StdMutex<Table>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // Nothing runs user code under the lock, so a poisoned table is
        // still consistent.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a callback under a fresh token.
    ///
    /// Returns `None` once the table has been closed.
    pub fn insert(&self, callback: ResponseCallback) -> Option<CorrelationToken> {
        let mut table = self.lock();
        if table.closed {
            return None;
        }
        let token = CorrelationToken::new();
        table.calls.insert(
            token,
            PendingCall {
                callback,
                issued_at: Instant::now(),
            },
        );
        Some(token)
    }

    /// Drop a call without running it.
    pub fn remove(&self, token: &CorrelationToken) -> bool {
        self.lock().calls.remove(token).is_some()
    }

    /// Run and remove the call for `token`.
    ///
    /// Returns `false` for unknown or already resolved tokens.
    pub fn resolve(&self, token: &CorrelationToken, payload: serde_json::Value) -> bool {
        let call = self.lock().calls.remove(token);
        match call {
            Some(call) => {
                tracing::trace!(%token, elapsed = ?call.issued_at.elapsed(), "Resolving pending call");
                (call.callback)(payload);
                true
            }
            None => {
                tracing::warn!(%token, "Stale response: no pending call for token");
                false
            }
        }
    }

    /// Close the table and drop every outstanding call unrun.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut table = self.lock();
            table.closed = true;
            std::mem::take(&mut table.calls)
        };
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    /// Age of the oldest outstanding call.
    pub fn oldest(&self) -> Option<Duration> {
        self.lock()
            .calls
            .values()
            .map(|call| call.issued_at.elapsed())
            .max()
    }
}

/// Awaitable response to a request.
///
/// Resolves to [`ConnectionError::Disconnected`] when the call is discarded
/// by teardown.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<serde_json::Value>,
}

impl ResponseFuture {
    pub(crate) fn channel() -> (ResponseCallback, Self) {
        let (tx, rx) = oneshot::channel();
        let callback: ResponseCallback = Box::new(move |payload| {
            let _ = tx.send(payload);
        });
        (callback, Self { rx })
    }
}

impl Future for ResponseFuture {
    type Output = Result<serde_json::Value, ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| ConnectionError::Disconnected))
    }
}
