//! Method registry and async dispatch.
//!
//! Entries are either local handlers (no owner) or handlers installed on
//! behalf of a connection, such as the hub's forwarding stubs. Owned entries
//! are removed in bulk when their connection closes.
//!
//! Inline handlers are plain functions answered on the receive path, so one
//! connection's inline requests take effect strictly in arrival order.
//! Async handlers are awaited off that path by the caller of [`MethodRegistry::dispatch`].

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{error, warn};

use crate::connection::{Connection, ConnectionId};
use crate::envelope::{Envelope, RequestId};
use crate::errors::RpcError;

/// Per-call information handed to a handler.
#[derive(Clone, Debug)]
pub struct CallContext {
    /// Connection the request arrived on.
    pub connection: Arc<Connection>,
    /// Id of the request being answered.
    pub request_id: RequestId,
}

/// Trait implemented by every method handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the handler. `Ok(Value::Null)` is sent as `"result": null`.
    async fn handle(&self, params: Option<Value>, ctx: &CallContext) -> Result<Value, RpcError>;
}

/// Adapter turning an async closure into a [`MethodHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
///
/// ```ignore
/// registry.register("greet", handler_fn(|params, _ctx| async move {
///     Ok(json!(format!("hello {}", params.unwrap_or_default()["name"])))
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Option<Value>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Option<Value>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>, ctx: &CallContext) -> Result<Value, RpcError> {
        (self.0)(params, ctx.clone()).await
    }
}

/// Synchronous handler run directly on the receive path.
pub type InlineFn = Arc<dyn Fn(Option<Value>, &CallContext) -> Result<Value, RpcError> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Async(Arc<dyn MethodHandler>),
    Inline(InlineFn),
}

struct MethodEntry {
    handler: Handler,
    owner: Option<ConnectionId>,
}

/// Registry mapping fully-qualified method names to handlers.
pub struct MethodRegistry {
    entries: RwLock<HashMap<String, MethodEntry>>,
    handler_timeout: Duration,
}

impl MethodRegistry {
    /// Maximum time a single handler is allowed to run by default.
    pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_handler_timeout(Self::HANDLER_TIMEOUT)
    }

    /// Create an empty registry with a custom handler time limit.
    pub fn with_handler_timeout(handler_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            handler_timeout,
        }
    }

    /// Register a local handler. Rejects names that are already taken.
    pub fn register(&self, method: &str, handler: impl MethodHandler + 'static) -> Result<(), RpcError> {
        self.insert(
            method,
            MethodEntry {
                handler: Handler::Async(Arc::new(handler)),
                owner: None,
            },
        )
    }

    /// Register a local handler that is already shared.
    pub fn register_shared(&self, method: &str, handler: Arc<dyn MethodHandler>) -> Result<(), RpcError> {
        self.insert(
            method,
            MethodEntry {
                handler: Handler::Async(handler),
                owner: None,
            },
        )
    }

    /// Register a local synchronous handler, answered by [`Self::dispatch_now`].
    ///
    /// It runs on the receive path and must not block.
    pub fn register_inline<F>(&self, method: &str, handler: F) -> Result<(), RpcError>
    where
        F: Fn(Option<Value>, &CallContext) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.insert(
            method,
            MethodEntry {
                handler: Handler::Inline(Arc::new(handler)),
                owner: None,
            },
        )
    }

    /// Register a handler owned by `owner`, removed by [`Self::unregister_owned_by`].
    pub fn register_owned(
        &self,
        method: &str,
        handler: Arc<dyn MethodHandler>,
        owner: ConnectionId,
    ) -> Result<(), RpcError> {
        self.insert(
            method,
            MethodEntry {
                handler: Handler::Async(handler),
                owner: Some(owner),
            },
        )
    }

    fn insert(&self, method: &str, entry: MethodEntry) -> Result<(), RpcError> {
        let mut entries = self.entries.write();
        if entries.contains_key(method) {
            warn!(method, "method already registered, keeping original");
            return Err(RpcError::Conflict {
                method: method.to_owned(),
            });
        }
        let _ = entries.insert(method.to_owned(), entry);
        Ok(())
    }

    /// Remove one entry. Returns whether it existed.
    pub fn unregister(&self, method: &str) -> bool {
        self.entries.write().remove(method).is_some()
    }

    /// Remove every entry owned by `owner`, returning the removed names (sorted).
    pub fn unregister_owned_by(&self, owner: &ConnectionId) -> Vec<String> {
        let mut entries = self.entries.write();
        let mut removed: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.owner.as_ref() == Some(owner))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            let _ = entries.remove(name);
        }
        removed.sort();
        removed
    }

    /// Owner of an entry; `None` for local handlers and unknown names.
    pub fn owner_of(&self, method: &str) -> Option<ConnectionId> {
        self.entries
            .read()
            .get(method)
            .and_then(|entry| entry.owner.clone())
    }

    /// List all registered method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        self.sorted_names(|_| true)
    }

    /// Names owned by `owner` (sorted).
    pub fn methods_owned_by(&self, owner: &ConnectionId) -> Vec<String> {
        self.sorted_names(|entry| entry.owner.as_ref() == Some(owner))
    }

    /// Names of local, unowned handlers (sorted).
    pub fn local_methods(&self) -> Vec<String> {
        self.sorted_names(|entry| entry.owner.is_none())
    }

    fn sorted_names(&self, keep: impl Fn(&MethodEntry) -> bool) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| keep(entry))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Check whether a method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.entries.read().contains_key(method)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Run the handler for `method`.
    ///
    /// Lookup misses become [`RpcError::MethodNotFound`]; panics and
    /// overruns of the handler time limit become [`RpcError::Internal`].
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &CallContext,
    ) -> Result<Value, RpcError> {
        // Clone the handler out so the lock is not held across the await.
        let handler = match self.lookup(method)? {
            Handler::Inline(handler) => return run_inline(method, &handler, params, ctx),
            Handler::Async(handler) => handler,
        };

        let guarded = AssertUnwindSafe(handler.handle(params, ctx)).catch_unwind();
        match tokio::time::timeout(self.handler_timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                error!(method, panic = panic_message(panic.as_ref()), "handler panicked");
                Err(RpcError::internal(format!("handler for '{method}' panicked")))
            }
            Err(_elapsed) => {
                error!(method, "handler timed out after {:?}", self.handler_timeout);
                Err(RpcError::internal(format!("handler for '{method}' timed out")))
            }
        }
    }

    fn lookup(&self, method: &str) -> Result<Handler, RpcError> {
        self.entries
            .read()
            .get(method)
            .map(|entry| entry.handler.clone())
            .ok_or_else(|| RpcError::MethodNotFound {
                method: method.to_owned(),
            })
    }

    /// Dispatch a request and build the reply envelope keyed by its id.
    pub async fn dispatch(&self, method: &str, params: Option<Value>, ctx: &CallContext) -> Envelope {
        counter!("rpc_requests_total", "method" => method.to_owned()).increment(1);
        let start = Instant::now();
        let outcome = self.call(method, params, ctx).await;
        finish(method, start, outcome, ctx)
    }

    /// Answer a request without awaiting, when that is possible.
    ///
    /// Inline handlers and unknown names are answered here. For async
    /// handlers `params` is handed back so the caller can [`Self::dispatch`]
    /// off the receive path.
    pub fn dispatch_now(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &CallContext,
    ) -> Result<Envelope, Option<Value>> {
        let start = Instant::now();
        let outcome = match self.lookup(method) {
            Ok(Handler::Async(_)) => return Err(params),
            Ok(Handler::Inline(handler)) => run_inline(method, &handler, params, ctx),
            Err(error) => Err(error),
        };
        counter!("rpc_requests_total", "method" => method.to_owned()).increment(1);
        Ok(finish(method, start, outcome, ctx))
    }
}

fn run_inline(
    method: &str,
    handler: &InlineFn,
    params: Option<Value>,
    ctx: &CallContext,
) -> Result<Value, RpcError> {
    catch_unwind(AssertUnwindSafe(|| handler(params, ctx))).unwrap_or_else(|panic| {
        error!(method, panic = panic_message(panic.as_ref()), "handler panicked");
        Err(RpcError::internal(format!("handler for '{method}' panicked")))
    })
}

/// Record metrics for a finished call and build its reply.
fn finish(
    method: &str,
    start: Instant,
    outcome: Result<Value, RpcError>,
    ctx: &CallContext,
) -> Envelope {
    let duration = start.elapsed();
    histogram!("rpc_request_duration_seconds", "method" => method.to_owned())
        .record(duration.as_secs_f64());

    if duration.as_secs() >= 5 {
        warn!(
            method,
            duration_secs = duration.as_secs_f64(),
            "slow RPC request"
        );
    }

    match outcome {
        Ok(result) => Envelope::response(ctx.request_id.clone(), result),
        Err(err) => {
            counter!(
                "rpc_errors_total",
                "method" => method.to_owned(),
                "error_type" => err.kind()
            )
            .increment(1);
            Envelope::error(ctx.request_id.clone(), err.to_error_object())
        }
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
