//! Outbound call correlation.
//!
//! Every call gets the next id from the correlator's monotonic counter and
//! a pending entry. The entry is removed by exactly one of: a
//! matching response, a matching error, its timer, or the close of the
//! connection it was sent on. Whoever removes the entry delivers the
//! outcome; everyone else finds nothing and becomes a no-op.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionId};
use crate::envelope::{Envelope, ErrorObject, RequestId};
use crate::errors::RpcError;

/// Deadline applied when the caller does not pick one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

type Outcome = Result<Value, RpcError>;

struct PendingCall {
    connection: ConnectionId,
    method: String,
    tx: oneshot::Sender<Outcome>,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn settle(self, outcome: Outcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have dropped its handle; nothing to deliver then.
        let _ = self.tx.send(outcome);
    }
}

struct Inner {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingCall>>,
}

impl Inner {
    fn take(&self, id: i64, connection: Option<&ConnectionId>) -> Option<PendingCall> {
        let mut pending = self.pending.lock();
        let matches = pending
            .get(&id)
            .is_some_and(|call| connection.is_none_or(|c| &call.connection == c));
        if matches { pending.remove(&id) } else { None }
    }

    fn expire(&self, id: i64, timeout: Duration) {
        if let Some(call) = self.take(id, None) {
            warn!(
                id,
                method = %call.method,
                connection = %call.connection,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "call timed out"
            );
            counter!("rpc_call_timeouts_total").increment(1);
            let method = call.method.clone();
            call.settle(Err(RpcError::Timeout { method, timeout }));
        }
    }
}

/// Tracks outbound calls awaiting a response.
///
/// Cheap to clone; clones share the same id counter and pending table.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    /// Create an empty correlator whose first id is `1`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicI64::new(1),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn next_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request on `connection` and return a handle for its outcome.
    ///
    /// The handle resolves with the remote result, the remote error as
    /// [`RpcError::Remote`], [`RpcError::Timeout`] after `timeout`, or
    /// [`RpcError::Closed`] if the connection goes away first. Must be
    /// called within a Tokio runtime (the deadline timer is a task).
    pub fn invoke(
        &self,
        connection: &Arc<Connection>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<PendingReply, RpcError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();

        // Registered before sending so a fast reply always finds its entry.
        let _ = self.inner.pending.lock().insert(
            id,
            PendingCall {
                connection: connection.id().clone(),
                method: method.to_owned(),
                tx,
                timer: None,
            },
        );

        if !connection.send_envelope(&Envelope::request(id, method, params)) {
            let _ = self.inner.take(id, None);
            return Err(RpcError::Closed {
                method: method.to_owned(),
            });
        }
        counter!("rpc_calls_total", "method" => method.to_owned()).increment(1);
        debug!(id, method, connection = %connection.id(), "call sent");

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(id, timeout);
            }
        });
        {
            let mut pending = self.inner.pending.lock();
            match pending.get_mut(&id) {
                Some(call) => call.timer = Some(timer.abort_handle()),
                // Already settled while the timer was being armed.
                None => timer.abort(),
            }
        }

        Ok(PendingReply {
            id,
            method: method.to_owned(),
            rx,
        })
    }

    /// Convenience wrapper: invoke and await the outcome.
    pub async fn call(
        &self,
        connection: &Arc<Connection>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.invoke(connection, method, params, timeout)?.await
    }

    /// Settle the call `id` issued on `connection` with a result.
    ///
    /// Returns `false` (and logs) when no pending call matches.
    pub fn settle_response(&self, connection: &ConnectionId, id: &RequestId, result: Value) -> bool {
        self.settle(connection, id, Ok(result))
    }

    /// Settle the call `id` issued on `connection` with a remote error.
    ///
    /// Returns `false` (and logs) when no pending call matches.
    pub fn settle_error(&self, connection: &ConnectionId, id: &RequestId, error: ErrorObject) -> bool {
        self.settle(connection, id, Err(RpcError::Remote(error)))
    }

    fn settle(&self, connection: &ConnectionId, id: &RequestId, outcome: Outcome) -> bool {
        let call = id
            .as_number()
            .and_then(|n| self.inner.take(n, Some(connection)));
        match call {
            Some(call) => {
                debug!(%id, method = %call.method, %connection, "call settled");
                call.settle(outcome);
                true
            }
            None => {
                warn!(%id, %connection, "unmatched id, discarding reply");
                counter!("rpc_unmatched_responses_total").increment(1);
                false
            }
        }
    }

    /// Fail every call pending on `connection` with [`RpcError::Closed`].
    ///
    /// Returns how many calls were cancelled.
    pub fn cancel_all_for(&self, connection: &ConnectionId) -> usize {
        let cancelled: Vec<PendingCall> = {
            let mut pending = self.inner.pending.lock();
            let ids: Vec<i64> = pending
                .iter()
                .filter(|(_, call)| &call.connection == connection)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = cancelled.len();
        for call in cancelled {
            let method = call.method.clone();
            call.settle(Err(RpcError::Closed { method }));
        }
        if count > 0 {
            debug!(%connection, count, "cancelled pending calls");
        }
        count
    }

    /// Number of calls awaiting settlement.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Number of calls awaiting settlement on one connection.
    pub fn pending_for(&self, connection: &ConnectionId) -> usize {
        self.inner
            .pending
            .lock()
            .values()
            .filter(|call| &call.connection == connection)
            .count()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion handle for one outbound call.
#[must_use = "a pending reply does nothing unless awaited"]
pub struct PendingReply {
    id: i64,
    method: String,
    rx: oneshot::Receiver<Outcome>,
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply").field("id", &self.id).field("method", &self.method).finish_non_exhaustive()
    }
}

impl PendingReply {
    /// Id the request was sent with.
    pub fn id(&self) -> i64 {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Value, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Sender dropped unsettled: the correlator itself went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::Closed {
                method: self.method.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}
