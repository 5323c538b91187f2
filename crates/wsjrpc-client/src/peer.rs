//! A named peer connected to the hub.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wsjrpc_rpc::{
    Connection, ConnectionId, DEFAULT_CALL_TIMEOUT, Endpoint, MethodHandler, MethodRegistry,
    RpcError, Subscriber, SubscriberId,
};

use crate::errors::{ClientError, Result};
use crate::transport::{read_loop, write_loop};

/// Outbound frames buffered before sends are refused.
const SEND_QUEUE_CAPACITY: usize = 256;

/// Collects local procedures and subscriptions before connecting.
pub struct PeerBuilder {
    name: String,
    description: String,
    call_timeout: Duration,
    handler_timeout: Duration,
    exposed: Vec<(String, Arc<dyn MethodHandler>)>,
    subscriptions: Vec<(String, Subscriber)>,
}

impl PeerBuilder {
    /// Start a peer that will introduce itself as `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            handler_timeout: MethodRegistry::HANDLER_TIMEOUT,
            exposed: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Description sent with `introduce`.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Deadline for calls this peer makes.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Upper bound on one local handler execution.
    #[must_use]
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Expose a local procedure; the hub will route `<name>.<method>` here.
    #[must_use]
    pub fn expose(mut self, method: impl Into<String>, handler: impl MethodHandler + 'static) -> Self {
        self.exposed.push((method.into(), Arc::new(handler)));
        self
    }

    /// Receive notifications named `event`.
    #[must_use]
    pub fn subscribe(
        mut self,
        event: impl Into<String>,
        callback: impl Fn(&str, Option<Value>) + Send + Sync + 'static,
    ) -> Self {
        self.subscriptions.push((event.into(), Arc::new(callback)));
        self
    }

    /// Connect to `url` and run the handshake.
    ///
    /// Order: `introduce`, then `registerMethod` for every exposed
    /// procedure, then `subscribe` for every subscription. A rejected step
    /// closes the connection and is returned as [`ClientError::Handshake`].
    pub async fn connect(self, url: &str) -> Result<Peer> {
        let endpoint = Endpoint::new(self.handler_timeout);
        let mut methods = Vec::with_capacity(self.exposed.len());
        for (method, handler) in self.exposed {
            endpoint.registry().register_shared(&method, handler)?;
            methods.push(method);
        }
        let mut events = Vec::with_capacity(self.subscriptions.len());
        for (event, callback) in self.subscriptions {
            let _ = endpoint.subscriptions().subscribe(&event, callback);
            events.push(event);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (ws_tx, ws_rx) = ws.split();
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let connection = Arc::new(Connection::new(ConnectionId::new(), send_tx));
        let shutdown = CancellationToken::new();
        let ended = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            ws_rx,
            endpoint.clone(),
            Arc::clone(&connection),
            shutdown.clone(),
            ended.clone(),
        ));
        let writer = tokio::spawn(write_loop(ws_tx, send_rx, shutdown.clone()));
        info!(url, name = %self.name, "connected to hub");

        let peer = Peer {
            inner: Arc::new(PeerInner {
                name: self.name,
                endpoint,
                connection,
                call_timeout: self.call_timeout,
                shutdown,
                ended,
                tasks: Mutex::new(vec![reader, writer]),
            }),
        };

        if let Err(error) = peer.handshake(&self.description, &methods, &events).await {
            peer.close().await;
            return Err(error);
        }
        Ok(peer)
    }
}

struct PeerInner {
    name: String,
    endpoint: Endpoint,
    connection: Arc<Connection>,
    call_timeout: Duration,
    shutdown: CancellationToken,
    ended: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A connected peer. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("name", &self.inner.name).finish_non_exhaustive()
    }
}

impl Peer {
    async fn handshake(&self, description: &str, methods: &[String], events: &[String]) -> Result<()> {
        let step = |step: &'static str| move |source: RpcError| ClientError::Handshake { step, source };

        let _ = self
            .invoke("introduce", Some(json!({"name": self.inner.name, "description": description})))
            .await
            .map_err(step("introduce"))?;
        for method in methods {
            let _ = self
                .invoke("registerMethod", Some(json!({"name": method})))
                .await
                .map_err(step("registerMethod"))?;
        }
        for event in events {
            let _ = self
                .invoke("subscribe", Some(json!({"name": event})))
                .await
                .map_err(step("subscribe"))?;
        }
        Ok(())
    }

    /// Name this peer introduced itself with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Call `method` (hub-native or `<peer>.<method>`) with the default deadline.
    pub async fn invoke(&self, method: &str, params: Option<Value>) -> std::result::Result<Value, RpcError> {
        self.invoke_with_timeout(method, params, self.inner.call_timeout)
            .await
    }

    /// Call `method` with an explicit deadline.
    pub async fn invoke_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> std::result::Result<Value, RpcError> {
        self.inner
            .endpoint
            .invoke(&self.inner.connection, method, params, timeout)?
            .await
    }

    /// Send a notification to the hub.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if Endpoint::notify(&self.inner.connection, method, params) {
            Ok(())
        } else {
            Err(ClientError::Closed)
        }
    }

    /// Ask the hub to deliver `event` to every other subscribed peer.
    pub async fn broadcast(&self, event: &str, params: Option<Value>) -> std::result::Result<(), RpcError> {
        let _ = self
            .invoke("broadcast", Some(json!({"name": event, "params": params})))
            .await?;
        Ok(())
    }

    /// The hub's directory listing.
    pub async fn list(&self) -> std::result::Result<Value, RpcError> {
        self.invoke("list", None).await
    }

    /// Expose another procedure after connecting.
    ///
    /// The local entry is rolled back if the hub rejects the registration.
    pub async fn expose(&self, method: &str, handler: impl MethodHandler + 'static) -> std::result::Result<(), RpcError> {
        let registry = self.inner.endpoint.registry();
        registry.register(method, handler)?;
        if let Err(error) = self
            .invoke("registerMethod", Some(json!({"name": method})))
            .await
        {
            let _ = registry.unregister(method);
            return Err(error);
        }
        Ok(())
    }

    /// Subscribe to `event` after connecting.
    pub async fn subscribe(
        &self,
        event: &str,
        callback: impl Fn(&str, Option<Value>) + Send + Sync + 'static,
    ) -> std::result::Result<SubscriberId, RpcError> {
        let subscriptions = self.inner.endpoint.subscriptions();
        let id = subscriptions.subscribe(event, Arc::new(callback));
        if let Err(error) = self.invoke("subscribe", Some(json!({"name": event}))).await {
            let _ = subscriptions.unsubscribe(id);
            return Err(error);
        }
        Ok(id)
    }

    /// Close the connection and wait for the socket tasks to finish.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(error) = task.await {
                warn!(%error, "peer task failed");
            }
        }
    }

    /// Resolves once the connection has ended for any reason.
    pub async fn closed(&self) {
        self.inner.ended.cancelled().await;
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        !self.inner.ended.is_cancelled() && self.inner.connection.is_open()
    }

    /// Calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.endpoint.correlator().pending_count()
    }
}
