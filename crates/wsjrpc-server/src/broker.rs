//! Hub procedures and the connection lifecycle.
//!
//! The broker owns one [`Endpoint`] and one [`Directory`]. Peers reach each
//! other through entries it installs on their behalf:
//!
//! - `registerMethod` puts a forwarding stub under `<peer>.<method>` that
//!   proxies the call to the owning connection through the correlator
//! - `subscribe` puts a forwarder under `<peer>.<event>` that re-emits
//!   notifications sent to the hub as `<event>` to the owning connection
//!
//! Closing a connection removes all of it again.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use wsjrpc_rpc::params::{optional_str, require_str};
use wsjrpc_rpc::{
    CallContext, Connection, ConnectionId, Correlator, Endpoint, MethodHandler, RpcError,
};

use crate::directory::{Directory, Identity, PeerState};

/// Name the hub reports for itself in `list`.
pub const HUB_NAME: &str = "server";

/// One entry of the `list` result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    /// Connection id; absent for the hub entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Declared name, `null` while anonymous.
    pub name: Option<String>,
    /// Declared description, `null` while anonymous.
    pub description: Option<String>,
    /// Identity state.
    pub state: PeerState,
    /// Subscribed event names.
    pub subscriptions: Vec<String>,
    /// Method names owned.
    pub methods: Vec<String>,
}

/// Proxies a call to the connection that registered it.
struct ForwardingStub {
    target: Weak<Connection>,
    method: String,
    correlator: Correlator,
    timeout: Duration,
}

#[async_trait]
impl MethodHandler for ForwardingStub {
    async fn handle(&self, params: Option<Value>, ctx: &CallContext) -> Result<Value, RpcError> {
        let Some(target) = self.target.upgrade() else {
            return Err(RpcError::Closed {
                method: self.method.clone(),
            });
        };
        debug!(
            from = %ctx.connection.id(),
            to = %target.id(),
            method = %self.method,
            "forwarding call"
        );
        self.correlator
            .invoke(&target, &self.method, params, self.timeout)?
            .await
    }
}

/// Identity tracking, namespacing, and fan-out for one hub.
pub struct Broker {
    endpoint: Endpoint,
    directory: Directory,
    call_timeout: Duration,
}

impl Broker {
    /// Create a broker with the hub-native procedures installed.
    pub fn new(call_timeout: Duration, handler_timeout: Duration) -> Arc<Self> {
        let broker = Arc::new(Self {
            endpoint: Endpoint::new(handler_timeout),
            directory: Directory::new(),
            call_timeout,
        });
        broker.install("introduce", Self::introduce);
        broker.install("registerMethod", Self::register_method);
        broker.install("subscribe", Self::subscribe);
        broker.install("broadcast", Self::broadcast);
        broker.install("list", Self::list);
        broker
    }

    /// Register a hub procedure as an inline handler.
    ///
    /// Inline procedures run on the connection's receive path, so a peer's
    /// pipelined `introduce` is applied before its next request is looked at.
    /// Handlers hold a weak reference so the registry does not keep the
    /// broker alive.
    fn install<F>(self: &Arc<Self>, name: &str, procedure: F)
    where
        F: Fn(&Self, Option<Value>, &CallContext) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(self);
        let handler = move |params: Option<Value>, ctx: &CallContext| match weak.upgrade() {
            Some(broker) => procedure(&broker, params, ctx),
            None => Err(RpcError::internal("hub is shutting down")),
        };
        if let Err(error) = self.endpoint.registry().register_inline(name, handler) {
            warn!(procedure = name, %error, "hub procedure not installed");
        }
    }

    /// Shared registry, subscriptions, and correlator.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connected peers.
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Calls forwarded to peers and still awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.endpoint.correlator().pending_count()
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// A connection opened; it starts anonymous.
    pub fn on_open(&self, connection: Arc<Connection>) {
        info!(connection = %connection.id(), "open");
        self.directory.attach(connection);
    }

    /// A text frame arrived on `connection`.
    pub fn on_message(&self, connection: &Arc<Connection>, text: &str) {
        self.endpoint.handle_text(connection, text);
    }

    /// A connection closed.
    ///
    /// Fails the calls forwarded to it and drops its directory record,
    /// method stubs, and subscription forwarders before returning.
    ///
    /// The record goes first: once detached, a concurrent `registerMethod`
    /// or `subscribe` for `id` sees it closed and undoes its own insert.
    pub fn on_close(&self, id: &ConnectionId) {
        let record = self.directory.detach(id);
        if let Some(record) = &record {
            record.connection.mark_closed();
        }
        let released = self.endpoint.release_connection(id);
        let name = record
            .as_ref()
            .and_then(|r| r.identity.as_ref())
            .map(|i| i.name.clone());
        let age_ms = record
            .as_ref()
            .map_or(0, |r| u64::try_from(r.connection.age().as_millis()).unwrap_or(u64::MAX));
        info!(
            connection = %id,
            name = name.as_deref().unwrap_or("-"),
            age_ms,
            cancelled_calls = released.cancelled_calls,
            methods = released.methods.len(),
            subscriptions = released.subscriptions,
            "close"
        );
    }

    // ── hub procedures ──────────────────────────────────────────────

    fn introduce(&self, params: Option<Value>, ctx: &CallContext) -> Result<Value, RpcError> {
        let params = params.as_ref();
        let name = require_str(params, "name")?;
        let description = optional_str(params, "description")
            .or_else(|| optional_str(params, "desc"))
            .unwrap_or_default();
        let id = ctx.connection.id();

        let identity = Identity {
            name: name.clone(),
            description,
        };
        match self.directory.introduce(id, identity) {
            Ok(Some(previous)) if previous.name != name => {
                info!(connection = %id, from = %previous.name, to = %name, "peer renamed");
            }
            Ok(_) => info!(connection = %id, name = %name, "peer introduced"),
            Err(_) => {
                return Err(RpcError::Closed {
                    method: "introduce".into(),
                });
            }
        }
        Ok(json!(true))
    }

    fn register_method(&self, params: Option<Value>, ctx: &CallContext) -> Result<Value, RpcError> {
        let id = ctx.connection.id();
        let identity = self.directory.require_introduced(id)?;
        // `description` is accepted for compatibility and not stored.
        let local = require_str(params.as_ref(), "name")?;
        let qualified = format!("{}.{local}", identity.name);

        let registry = self.endpoint.registry();
        if registry.owner_of(&qualified).as_ref() == Some(id) {
            return Ok(json!(true));
        }
        let stub = ForwardingStub {
            target: Arc::downgrade(&ctx.connection),
            method: local,
            correlator: self.endpoint.correlator().clone(),
            timeout: self.call_timeout,
        };
        registry.register_owned(&qualified, Arc::new(stub), id.clone())?;
        if self.directory.state(id) != PeerState::Introduced {
            let _ = registry.unregister_owned_by(id);
            return Err(RpcError::Closed {
                method: "registerMethod".into(),
            });
        }
        info!(connection = %id, method = %qualified, "method registered");
        Ok(json!(true))
    }

    fn subscribe(&self, params: Option<Value>, ctx: &CallContext) -> Result<Value, RpcError> {
        let id = ctx.connection.id();
        let identity = self.directory.require_introduced(id)?;
        let event = require_str(params.as_ref(), "name")?;
        let _ = self.directory.add_subscription(id, &event)?;

        let qualified = format!("{}.{event}", identity.name);
        let subscriptions = self.endpoint.subscriptions();
        if !subscriptions.is_subscribed_by(&qualified, id) {
            let target = Arc::downgrade(&ctx.connection);
            let forward = event.clone();
            let _ = subscriptions.subscribe_owned(
                &qualified,
                id.clone(),
                Arc::new(move |_name: &str, params: Option<Value>| {
                    if let Some(connection) = target.upgrade() {
                        let _ = Endpoint::notify(&connection, &forward, params);
                    }
                }),
            );
        }
        if self.directory.state(id) != PeerState::Introduced {
            let _ = subscriptions.unsubscribe_owned_by(id);
            return Err(RpcError::Closed {
                method: "subscribe".into(),
            });
        }
        info!(connection = %id, event = %event, "subscribed");
        Ok(json!(true))
    }

    fn broadcast(&self, params: Option<Value>, ctx: &CallContext) -> Result<Value, RpcError> {
        let id = ctx.connection.id();
        let _ = self.directory.require_introduced(id)?;
        let params = params.as_ref();
        let event = require_str(params, "name")?;
        let payload = params
            .and_then(|p| p.get("params"))
            .filter(|v| !v.is_null())
            .cloned();

        // Snapshot first; peers joining or leaving mid-fan-out are harmless.
        let targets = self.directory.subscribers_of(&event, id);
        let delivered = targets
            .iter()
            .filter(|connection| Endpoint::notify(connection, &event, payload.clone()))
            .count();
        debug!(event = %event, targets = targets.len(), delivered, "broadcast");
        Ok(json!(true))
    }

    fn list(&self, _params: Option<Value>, _ctx: &CallContext) -> Result<Value, RpcError> {
        serde_json::to_value(self.summaries()).map_err(|e| RpcError::internal(e.to_string()))
    }

    /// The hub followed by every connection in insertion order.
    pub fn summaries(&self) -> Vec<PeerSummary> {
        let registry = self.endpoint.registry();
        let records = self.directory.snapshot();
        let mut out = Vec::with_capacity(records.len() + 1);
        out.push(PeerSummary {
            connection_id: None,
            name: Some(HUB_NAME.into()),
            description: Some(HUB_NAME.into()),
            state: PeerState::Introduced,
            subscriptions: self.endpoint.subscriptions().names(),
            methods: registry.local_methods(),
        });
        out.extend(records.into_iter().map(|record| {
            let state = record.state();
            let id = record.connection.id();
            PeerSummary {
                connection_id: Some(id.to_string()),
                name: record.identity.as_ref().map(|i| i.name.clone()),
                description: record.identity.as_ref().map(|i| i.description.clone()),
                state,
                methods: registry.methods_owned_by(id),
                subscriptions: record.subscriptions,
            }
        }));
        out
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;
    use wsjrpc_rpc::errors::{
        CALL_TIMEOUT, CONNECTION_CLOSED, INVALID_PARAMS, METHOD_CONFLICT, METHOD_NOT_FOUND,
        NOT_INTRODUCED,
    };

    use super::*;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    struct TestPeer {
        conn: Arc<Connection>,
        rx: mpsc::Receiver<Arc<String>>,
        next_id: i64,
    }

    impl TestPeer {
        fn open(broker: &Broker, id: &str) -> Self {
            let (tx, rx) = mpsc::channel(64);
            let conn = Arc::new(Connection::new(id.into(), tx));
            broker.on_open(Arc::clone(&conn));
            Self {
                conn,
                rx,
                next_id: 100,
            }
        }

        fn id(&self) -> ConnectionId {
            self.conn.id().clone()
        }

        fn send(&self, broker: &Broker, value: &Value) {
            broker.on_message(&self.conn, &value.to_string());
        }

        async fn recv(&mut self) -> Value {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("channel closed");
            serde_json::from_str(&frame).unwrap()
        }

        async fn call(&mut self, broker: &Broker, method: &str, params: Value) -> Value {
            self.next_id += 1;
            let id = self.next_id;
            self.send(
                broker,
                &json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}),
            );
            let reply = self.recv().await;
            assert_eq!(reply["id"], id);
            reply
        }

        async fn introduce(&mut self, broker: &Broker, name: &str) {
            let reply = self
                .call(broker, "introduce", json!({"name": name, "description": "test"}))
                .await;
            assert_eq!(reply["result"], true);
        }
    }

    fn broker() -> Arc<Broker> {
        Broker::new(Duration::from_secs(10), Duration::from_secs(60))
    }

    // ── identity ────────────────────────────────────────────────────

    #[tokio::test]
    async fn hub_procedures_installed() {
        let broker = broker();
        assert_eq!(
            broker.endpoint().registry().local_methods(),
            vec!["broadcast", "introduce", "list", "registerMethod", "subscribe"]
        );
    }

    #[tokio::test]
    async fn anonymous_register_method_requires_identity() {
        let broker = broker();
        let mut peer = TestPeer::open(&broker, "c1");
        let reply = peer.call(&broker, "registerMethod", json!({"name": "greet"})).await;
        assert_eq!(reply["error"]["code"], NOT_INTRODUCED);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .contains("introduce yourself first")
        );
    }

    #[tokio::test]
    async fn anonymous_subscribe_and_broadcast_rejected() {
        let broker = broker();
        let mut peer = TestPeer::open(&broker, "c1");
        let reply = peer.call(&broker, "subscribe", json!({"name": "hello"})).await;
        assert_eq!(reply["error"]["code"], NOT_INTRODUCED);
        let reply = peer.call(&broker, "broadcast", json!({"name": "hello"})).await;
        assert_eq!(reply["error"]["code"], NOT_INTRODUCED);
    }

    #[tokio::test]
    async fn introduce_without_name_is_invalid_params() {
        let broker = broker();
        let mut peer = TestPeer::open(&broker, "c1");
        let reply = peer.call(&broker, "introduce", json!({"description": "x"})).await;
        assert_eq!(reply["error"]["code"], INVALID_PARAMS);
        assert_eq!(reply["error"]["message"], "name is required");
        assert_eq!(broker.directory().state(&peer.id()), PeerState::Anonymous);
    }

    #[tokio::test]
    async fn introduce_accepts_desc_alias() {
        let broker = broker();
        let mut peer = TestPeer::open(&broker, "c1");
        let reply = peer
            .call(&broker, "introduce", json!({"name": "phone", "desc": "android"}))
            .await;
        assert_eq!(reply["result"], true);
        let summary = &broker.summaries()[1];
        assert_eq!(summary.description.as_deref(), Some("android"));
    }

    // ── method forwarding ───────────────────────────────────────────

    #[tokio::test]
    async fn forwarded_call_round_trip() {
        let broker = broker();
        let mut device = TestPeer::open(&broker, "dev");
        let mut caller = TestPeer::open(&broker, "cli");
        device.introduce(&broker, "deviceA").await;
        let reply = device.call(&broker, "registerMethod", json!({"name": "greet"})).await;
        assert_eq!(reply["result"], true);
        assert!(broker.endpoint().registry().has_method("deviceA.greet"));

        caller.send(
            &broker,
            &json!({"jsonrpc": "2.0", "id": 7, "method": "deviceA.greet", "params": {"name": "x"}}),
        );

        let forwarded = device.recv().await;
        assert_eq!(forwarded["method"], "greet");
        assert_eq!(forwarded["params"], json!({"name": "x"}));
        device.send(
            &broker,
            &json!({"jsonrpc": "2.0", "id": forwarded["id"], "result": "hello x"}),
        );

        let reply = caller.recv().await;
        assert_eq!(reply, json!({"jsonrpc": "2.0", "id": 7, "result": "hello x"}));
        assert_eq!(broker.pending_calls(), 0);
    }

    #[tokio::test]
    async fn forwarded_error_passes_through() {
        let broker = broker();
        let mut device = TestPeer::open(&broker, "dev");
        let mut caller = TestPeer::open(&broker, "cli");
        device.introduce(&broker, "deviceA").await;
        let _ = device.call(&broker, "registerMethod", json!({"name": "vibrate"})).await;

        caller.send(&broker, &json!({"jsonrpc": "2.0", "id": 1, "method": "deviceA.vibrate"}));
        let forwarded = device.recv().await;
        device.send(
            &broker,
            &json!({"jsonrpc": "2.0", "id": forwarded["id"],
                    "error": {"code": 42, "message": "motor busy", "data": {"retry": true}}}),
        );

        let reply = caller.recv().await;
        assert_eq!(
            reply["error"],
            json!({"code": 42, "message": "motor busy", "data": {"retry": true}})
        );
    }

    #[tokio::test]
    async fn unknown_qualified_method_is_32601() {
        let broker = broker();
        let mut caller = TestPeer::open(&broker, "cli");
        let reply = caller.call(&broker, "nobody.greet", json!({})).await;
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn conflicting_registration_keeps_original() {
        let broker = broker();
        let mut first = TestPeer::open(&broker, "a1");
        let mut second = TestPeer::open(&broker, "a2");
        first.introduce(&broker, "alice").await;
        second.introduce(&broker, "alice").await;

        let ok = first.call(&broker, "registerMethod", json!({"name": "greet"})).await;
        assert_eq!(ok["result"], true);
        let again = first.call(&broker, "registerMethod", json!({"name": "greet"})).await;
        assert_eq!(again["result"], true);
        let clash = second.call(&broker, "registerMethod", json!({"name": "greet"})).await;
        assert_eq!(clash["error"]["code"], METHOD_CONFLICT);
        assert_eq!(
            broker.endpoint().registry().owner_of("alice.greet"),
            Some(first.id())
        );
    }

    #[tokio::test]
    async fn forwarded_call_times_out() {
        tokio::time::pause();
        let broker = Broker::new(Duration::from_millis(100), Duration::from_secs(60));
        let mut device = TestPeer::open(&broker, "dev");
        let mut caller = TestPeer::open(&broker, "cli");
        device.introduce(&broker, "deviceA").await;
        let _ = device.call(&broker, "registerMethod", json!({"name": "slow"})).await;

        let reply = caller.call(&broker, "deviceA.slow", json!(null)).await;
        assert_eq!(reply["error"]["code"], CALL_TIMEOUT);

        // The late answer is discarded.
        let forwarded = device.recv().await;
        device.send(&broker, &json!({"jsonrpc": "2.0", "id": forwarded["id"], "result": 1}));
        tokio::task::yield_now().await;
        assert!(caller.rx.try_recv().is_err());
    }

    // ── subscriptions ───────────────────────────────────────────────

    #[tokio::test]
    async fn broadcast_reaches_only_subscribers() {
        let broker = broker();
        let mut a = TestPeer::open(&broker, "a");
        let mut b = TestPeer::open(&broker, "b");
        let mut c = TestPeer::open(&broker, "c");
        a.introduce(&broker, "alice").await;
        b.introduce(&broker, "bob").await;
        c.introduce(&broker, "carol").await;
        let _ = a.call(&broker, "subscribe", json!({"name": "hello"})).await;
        let _ = b.call(&broker, "subscribe", json!({"name": "hello"})).await;

        let reply = a
            .call(&broker, "broadcast", json!({"name": "hello", "params": {"from": "alice"}}))
            .await;
        assert_eq!(reply["result"], true);

        assert_eq!(
            b.recv().await,
            json!({"jsonrpc": "2.0", "method": "hello", "params": {"from": "alice"}})
        );
        assert!(a.rx.try_recv().is_err());
        assert!(c.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notification_to_hub_forwarded_to_owner() {
        let broker = broker();
        let mut owner = TestPeer::open(&broker, "a");
        let sender = TestPeer::open(&broker, "b");
        owner.introduce(&broker, "alice").await;
        let _ = owner.call(&broker, "subscribe", json!({"name": "news"})).await;
        let _ = owner.call(&broker, "subscribe", json!({"name": "news"})).await;

        sender.send(&broker, &json!({"jsonrpc": "2.0", "method": "alice.news", "params": [1]}));
        assert_eq!(
            owner.recv().await,
            json!({"jsonrpc": "2.0", "method": "news", "params": [1]})
        );
        assert!(owner.rx.try_recv().is_err());
    }

    // ── list ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn list_reports_hub_then_connections_in_order() {
        let broker = broker();
        let mut a = TestPeer::open(&broker, "a");
        let mut anon = TestPeer::open(&broker, "anon");
        a.introduce(&broker, "alice").await;
        let _ = a.call(&broker, "registerMethod", json!({"name": "greet"})).await;
        let _ = a.call(&broker, "subscribe", json!({"name": "hello"})).await;

        let reply = anon.call(&broker, "list", json!(null)).await;
        let list = reply["result"].as_array().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0]["name"], HUB_NAME);
        assert_eq!(list[0]["subscriptions"], json!(["alice.hello"]));
        assert!(list[0].get("connectionId").is_none());
        assert_eq!(
            list[1],
            json!({
                "connectionId": "a",
                "name": "alice",
                "description": "test",
                "state": "introduced",
                "subscriptions": ["hello"],
                "methods": ["alice.greet"],
            })
        );
        assert_eq!(list[2]["name"], Value::Null);
        assert_eq!(list[2]["state"], "anonymous");
    }

    // ── close cascade ───────────────────────────────────────────────

    #[tokio::test]
    async fn close_fails_pending_and_removes_everything() {
        let broker = broker();
        let mut device = TestPeer::open(&broker, "dev");
        let mut caller = TestPeer::open(&broker, "cli");
        device.introduce(&broker, "deviceA").await;
        let _ = device.call(&broker, "registerMethod", json!({"name": "greet"})).await;
        let _ = device.call(&broker, "subscribe", json!({"name": "hello"})).await;

        caller.send(&broker, &json!({"jsonrpc": "2.0", "id": 5, "method": "deviceA.greet"}));
        let _forwarded = device.recv().await;
        assert_eq!(broker.pending_calls(), 1);

        broker.on_close(&device.id());

        let reply = caller.recv().await;
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["error"]["code"], CONNECTION_CLOSED);
        assert_eq!(broker.pending_calls(), 0);
        assert!(!broker.endpoint().registry().has_method("deviceA.greet"));
        assert!(broker.endpoint().subscriptions().names().is_empty());
        assert_eq!(broker.directory().state(&device.id()), PeerState::Closed);
        assert_eq!(broker.directory().len(), 1);
    }

    #[tokio::test]
    async fn close_log_reports_identity_and_age() {
        let (logs, _guard) = wsjrpc_logging::capture_logs();
        let broker = broker();
        let mut device = TestPeer::open(&broker, "dev");
        device.introduce(&broker, "deviceA").await;
        let _ = device.call(&broker, "registerMethod", json!({"name": "greet"})).await;
        broker.on_close(&device.id());

        let close = logs
            .events()
            .into_iter()
            .find(|e| e.message == "close")
            .expect("close event");
        assert_eq!(close.field("name"), Some("deviceA"));
        assert_eq!(close.field("methods"), Some("1"));
        assert!(close.field("age_ms").is_some_and(|v| v.parse::<u64>().is_ok()));
    }

    #[tokio::test]
    async fn name_reusable_after_owner_closes() {
        let broker = broker();
        let mut first = TestPeer::open(&broker, "a1");
        first.introduce(&broker, "alice").await;
        let _ = first.call(&broker, "registerMethod", json!({"name": "greet"})).await;
        broker.on_close(&first.id());

        let mut second = TestPeer::open(&broker, "a2");
        second.introduce(&broker, "alice").await;
        let reply = second.call(&broker, "registerMethod", json!({"name": "greet"})).await;
        assert_eq!(reply["result"], true);
    }

    // ── ordering and concurrency ────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batched_introduce_then_register_and_subscribe() {
        for round in 0..200 {
            let broker = broker();
            let mut peer = TestPeer::open(&broker, &format!("c{round}"));
            peer.send(
                &broker,
                &json!([
                    {"jsonrpc": "2.0", "id": 1, "method": "introduce", "params": {"name": "dev"}},
                    {"jsonrpc": "2.0", "id": 2, "method": "registerMethod", "params": {"name": "greet"}},
                    {"jsonrpc": "2.0", "id": 3, "method": "subscribe", "params": {"name": "hello"}},
                ]),
            );
            for expected in 1..=3 {
                let reply = peer.recv().await;
                assert_eq!(reply["id"], expected, "round {round}: {reply}");
                assert_eq!(reply["result"], true, "round {round}: {reply}");
            }
            assert!(broker.endpoint().registry().has_method("dev.greet"));
            assert_eq!(broker.endpoint().subscriptions().names(), vec!["dev.hello"]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pipelined_frames_apply_in_arrival_order() {
        let broker = broker();
        let mut peer = TestPeer::open(&broker, "c1");
        let frames = [
            json!({"jsonrpc": "2.0", "id": 1, "method": "introduce", "params": {"name": "dev"}}),
            json!({"jsonrpc": "2.0", "id": 2, "method": "registerMethod", "params": {"name": "a"}}),
            json!({"jsonrpc": "2.0", "id": 3, "method": "registerMethod", "params": {"name": "b"}}),
            json!({"jsonrpc": "2.0", "id": 4, "method": "subscribe", "params": {"name": "hello"}}),
        ];
        for frame in &frames {
            peer.send(&broker, frame);
        }
        for expected in 1..=4 {
            let reply = peer.recv().await;
            assert_eq!(reply["id"], expected);
            assert_eq!(reply["result"], true, "{reply}");
        }
        assert_eq!(
            broker.endpoint().registry().methods_owned_by(&peer.id()),
            vec!["dev.a", "dev.b"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn requests_racing_close_leave_nothing_behind() {
        for round in 0..200 {
            let broker = broker();
            let mut peer = TestPeer::open(&broker, &format!("c{round}"));
            peer.introduce(&broker, "racer").await;
            let id = peer.id();

            let mut tasks = Vec::new();
            for n in 0..8 {
                for method in ["registerMethod", "subscribe"] {
                    let broker = Arc::clone(&broker);
                    let conn = Arc::clone(&peer.conn);
                    tasks.push(tokio::spawn(async move {
                        let frame = json!({
                            "jsonrpc": "2.0",
                            "id": n,
                            "method": method,
                            "params": {"name": format!("m{n}")},
                        });
                        broker.on_message(&conn, &frame.to_string());
                    }));
                }
            }
            let closer = Arc::clone(&broker);
            let close_id = id.clone();
            tasks.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                closer.on_close(&close_id);
            }));
            for task in tasks {
                task.await.unwrap();
            }

            assert!(
                broker.endpoint().registry().methods_owned_by(&id).is_empty(),
                "round {round}: {:?}",
                broker.endpoint().registry().methods_owned_by(&id)
            );
            assert!(
                broker.endpoint().subscriptions().names().is_empty(),
                "round {round}: {:?}",
                broker.endpoint().subscriptions().names()
            );
            assert!(broker.directory().is_empty());
        }
    }
}
