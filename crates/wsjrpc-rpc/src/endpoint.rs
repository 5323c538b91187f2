//! Inbound routing shared by the hub and every peer.
//!
//! Each decoded envelope goes to exactly one place: requests to the
//! [`MethodRegistry`], notifications to the [`SubscriptionTable`], responses
//! and errors to the [`Correlator`].
//!
//! Requests for inline handlers are answered before the next envelope is
//! routed. Only async handlers move to a spawned task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::connection::{Connection, ConnectionId};
use crate::correlator::{Correlator, PendingReply};
use crate::envelope::{Envelope, decode};
use crate::errors::RpcError;
use crate::registry::{CallContext, MethodRegistry};
use crate::subscriptions::SubscriptionTable;

/// What [`Endpoint::release_connection`] removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Released {
    /// Pending calls failed with [`RpcError::Closed`].
    pub cancelled_calls: usize,
    /// Method entries removed (sorted).
    pub methods: Vec<String>,
    /// Subscription entries removed.
    pub subscriptions: usize,
}

/// Registry, subscription table, and correlator for one hub or peer.
#[derive(Clone)]
pub struct Endpoint {
    registry: Arc<MethodRegistry>,
    subscriptions: Arc<SubscriptionTable>,
    correlator: Correlator,
}

impl Endpoint {
    /// Empty endpoint whose handlers may run for up to `handler_timeout`.
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(MethodRegistry::with_handler_timeout(handler_timeout)),
            subscriptions: Arc::new(SubscriptionTable::new()),
            correlator: Correlator::new(),
        }
    }

    /// Method registry.
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    /// Subscription table.
    pub fn subscriptions(&self) -> &Arc<SubscriptionTable> {
        &self.subscriptions
    }

    /// Call correlator.
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Decode one inbound text frame and route every envelope in it.
    ///
    /// Undecodable frames and batch items are logged and dropped.
    #[instrument(skip_all, fields(connection = %connection.id()))]
    pub fn handle_text(&self, connection: &Arc<Connection>, text: &str) {
        debug!(payload = text, "remote -> local");
        let frame = match decode(text) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(code = error.code(), %error, "dropping undecodable message");
                return;
            }
        };
        for item in frame.into_envelopes() {
            match item {
                Ok(envelope) => self.route(connection, envelope),
                Err(error) => warn!(code = error.code(), %error, "dropping invalid batch item"),
            }
        }
    }

    /// Route one envelope that arrived on `connection`.
    pub fn route(&self, connection: &Arc<Connection>, envelope: Envelope) {
        match envelope {
            Envelope::Request { id, method, params } => {
                let ctx = CallContext {
                    connection: Arc::clone(connection),
                    request_id: id,
                };
                let params = match self.registry.dispatch_now(&method, params, &ctx) {
                    Ok(reply) => return send_reply(&ctx, &reply),
                    Err(params) => params,
                };
                // Async handlers may await other peers; never run them on the reader.
                let registry = Arc::clone(&self.registry);
                let _ = tokio::spawn(async move {
                    let reply = registry.dispatch(&method, params, &ctx).await;
                    send_reply(&ctx, &reply);
                });
            }
            Envelope::Notification { method, params } => {
                let _ = self.subscriptions.publish(&method, params);
            }
            Envelope::Response { id, result } => {
                let _ = self.correlator.settle_response(connection.id(), &id, result);
            }
            Envelope::Error { id, error } => {
                let _ = self.correlator.settle_error(connection.id(), &id, error);
            }
        }
    }

    /// Start a correlated call on `connection`.
    pub fn invoke(
        &self,
        connection: &Arc<Connection>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<PendingReply, RpcError> {
        self.correlator.invoke(connection, method, params, timeout)
    }

    /// Send a fire-and-forget notification. Returns whether it was queued.
    pub fn notify(connection: &Connection, method: &str, params: Option<Value>) -> bool {
        connection.send_envelope(&Envelope::notification(method, params))
    }

    /// Drop everything tied to a closed connection.
    ///
    /// Fails its pending calls and removes the method and subscription
    /// entries it owns. Nothing referencing `connection` survives this call.
    pub fn release_connection(&self, connection: &ConnectionId) -> Released {
        Released {
            cancelled_calls: self.correlator.cancel_all_for(connection),
            methods: self.registry.unregister_owned_by(connection),
            subscriptions: self.subscriptions.unsubscribe_owned_by(connection),
        }
    }
}

fn send_reply(ctx: &CallContext, reply: &Envelope) {
    if !ctx.connection.send_envelope(reply) {
        warn!(
            connection = %ctx.connection.id(),
            id = %ctx.request_id,
            "reply dropped"
        );
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(MethodRegistry::HANDLER_TIMEOUT)
    }
}
