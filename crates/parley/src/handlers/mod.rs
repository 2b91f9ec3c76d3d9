//! Handler registration and invocation.
//!
//! User callbacks are routed by `(agent external id, context kind)` with a
//! per-kind default as fallback, so one agent can react differently to
//! one-way, conversation, meeting, and system traffic. The registry is an
//! explicit object owned by the SDK instance, injected into the conversation
//! and meeting components; there is no ambient global state.
//!
//! Invocation comes in two modes. Synchronous invocation runs the handler on
//! its own task and waits up to a budget, handing back the still-running task
//! when the budget elapses so the caller can attach a continuation.
//! Asynchronous invocation is fire-and-forget on a tracked task set whose
//! shutdown hook awaits outstanding work; failures are logged, never
//! propagated to the caller of the triggering operation.

use crate::models::ContextKind;
use crate::observability::metrics;
use crate::types::{MeetingId, SessionId};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// What a handler returns: `Some(value)` is an immediate conversation reply,
/// `None` means no reply (or a reply will follow through the async path).
pub type HandlerResult = anyhow::Result<Option<Value>>;

/// Boxed handler future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A registered message handler.
pub trait Handler: Send + Sync {
    fn call(&self, payload: Value, ctx: MessageContext) -> HandlerFuture;
}

struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(Value, MessageContext) -> HandlerFuture + Send + Sync,
{
    fn call(&self, payload: Value, ctx: MessageContext) -> HandlerFuture {
        (self.0)(payload, ctx)
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Value, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(move |payload, ctx| {
        Box::pin(f(payload, ctx)) as HandlerFuture
    }))
}

/// Delivery context passed to every handler invocation.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// External id of the sending agent.
    pub sender: String,
    /// External id of the receiving agent, when addressed to one.
    pub recipient: Option<String>,
    pub session_id: Option<SessionId>,
    pub meeting_id: Option<MeetingId>,
    pub kind: ContextKind,
    pub metadata: Option<Value>,
}

/// Registry mapping `(agent external id, context kind)` to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<(String, ContextKind), Arc<dyn Handler>>>,
    defaults: RwLock<HashMap<ContextKind, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one agent and context kind, replacing any
    /// previous registration for the same key.
    pub fn register(&self, agent_external_id: &str, kind: ContextKind, handler: Arc<dyn Handler>) {
        let mut handlers = match self.handlers.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert((agent_external_id.to_string(), kind), handler);
    }

    /// Register the process-wide fallback for a context kind.
    pub fn register_default(&self, kind: ContextKind, handler: Arc<dyn Handler>) {
        let mut defaults = match self.defaults.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        defaults.insert(kind, handler);
    }

    /// Remove an agent-specific registration.
    pub fn unregister(&self, agent_external_id: &str, kind: ContextKind) {
        let mut handlers = match self.handlers.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.remove(&(agent_external_id.to_string(), kind));
    }

    /// Resolve the handler for an agent and kind, falling back to the
    /// per-kind default.
    #[must_use]
    pub fn resolve(&self, agent_external_id: &str, kind: ContextKind) -> Option<Arc<dyn Handler>> {
        {
            let handlers = match self.handlers.read() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(handler) = handlers.get(&(agent_external_id.to_string(), kind)) {
                return Some(Arc::clone(handler));
            }
        }

        let defaults = match self.defaults.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        defaults.get(&kind).map(Arc::clone)
    }
}

/// Outcome of a synchronous invocation attempt.
pub enum SyncInvocation {
    /// The handler finished within the budget.
    Completed(HandlerResult),
    /// Budget elapsed; the handler keeps running on this handle.
    StillRunning(JoinHandle<HandlerResult>),
}

/// Runs handlers on tasks separate from the invoking operation.
#[derive(Clone)]
pub struct HandlerInvoker {
    tracker: TaskTracker,
}

impl HandlerInvoker {
    #[must_use]
    pub fn new(tracker: TaskTracker) -> Self {
        Self { tracker }
    }

    /// Await a handler up to `budget`.
    ///
    /// The handler runs on its own task so a slow handler cannot stall the
    /// caller past the budget; past it, the caller receives the join handle
    /// and decides what to do with the eventual result.
    pub async fn invoke_sync(
        &self,
        handler: Arc<dyn Handler>,
        payload: Value,
        ctx: MessageContext,
        budget: Duration,
    ) -> SyncInvocation {
        let kind = ctx.kind.as_str();
        let mut handle = self.tracker.spawn(handler.call(payload, ctx));

        match tokio::time::timeout(budget, &mut handle).await {
            Ok(Ok(result)) => {
                let outcome = if result.is_ok() { "success" } else { "error" };
                metrics::record_handler_invocation(kind, "sync", outcome);
                SyncInvocation::Completed(result)
            }
            Ok(Err(join_error)) => {
                metrics::record_handler_invocation(kind, "sync", "panic");
                SyncInvocation::Completed(Err(anyhow::anyhow!(
                    "handler panicked: {join_error}"
                )))
            }
            Err(_) => {
                metrics::record_handler_invocation(kind, "sync", "budget_elapsed");
                SyncInvocation::StillRunning(handle)
            }
        }
    }

    /// Fire-and-forget invocation on the tracked task set.
    ///
    /// Errors are logged and isolated; the triggering operation's caller has
    /// already returned by the time the handler runs.
    pub fn invoke_async(&self, handler: Arc<dyn Handler>, payload: Value, ctx: MessageContext) {
        let kind = ctx.kind.as_str();
        self.tracker.spawn(async move {
            match handler.call(payload, ctx.clone()).await {
                Ok(Some(_)) => {
                    metrics::record_handler_invocation(kind, "async", "success");
                    debug!(
                        target: "parley.handlers",
                        sender = %ctx.sender,
                        kind = %ctx.kind,
                        "async handler returned a value; ignored on this path"
                    );
                }
                Ok(None) => {
                    metrics::record_handler_invocation(kind, "async", "success");
                }
                Err(e) => {
                    metrics::record_handler_invocation(kind, "async", "error");
                    warn!(
                        target: "parley.handlers",
                        sender = %ctx.sender,
                        kind = %ctx.kind,
                        error = %e,
                        "async handler failed"
                    );
                }
            }
        });
    }

    /// Spawn an arbitrary tracked follow-up task (e.g. a late-reply
    /// continuation).
    pub fn spawn_tracked<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(future);
    }
}
