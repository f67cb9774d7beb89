//! The operation executor: a middleware chain ("links") composed around each
//! query, mutation, or subscription, ending in a terminal link that performs
//! the transport call.

pub mod batch;
pub mod cache;
pub mod logging;
pub mod retry;
pub mod split;
pub mod terminal;

pub use batch::BatchLink;
pub use cache::CacheLink;
pub use logging::LoggingLink;
pub use retry::RetryLink;
pub use split::SplitLink;
pub use terminal::FetchTerminal;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use prism_proto::{EntityName, ErrorValue, OperationId, OperationKind};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::error;

use crate::error::ConfigError;

/// Mutable metadata exchanged between links; shared by all clones of one
/// context.
#[derive(Clone, Default)]
pub struct Metadata(Arc<Mutex<HashMap<String, Value>>>);

impl Metadata {
    pub fn get(&self, key: &str) -> Option<Value> { self.0.lock().expect("meta lock poisoned").get(key).cloned() }
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.0.lock().expect("meta lock poisoned").insert(key.into(), value);
    }
}

/// Channel for values produced after the first one: subscription data,
/// revalidated cache entries. Pushes are dropped when no observer exists.
#[derive(Clone)]
pub struct UpdateSink {
    tx: Option<mpsc::UnboundedSender<OperationResult>>,
}

impl UpdateSink {
    fn connected(tx: mpsc::UnboundedSender<OperationResult>) -> Self { Self { tx: Some(tx) } }
    fn disconnected() -> Self { Self { tx: None } }

    pub fn push(&self, result: OperationResult) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(result);
        }
    }
}

/// Immutable per-call record handed down the link chain.
#[derive(Clone)]
pub struct OperationContext {
    pub id: OperationId,
    pub kind: OperationKind,
    pub entity: EntityName,
    pub operation: String,
    pub args: Value,
    /// Field-selection tree, when the caller restricted the result shape.
    pub select: Option<Value>,
    pub meta: Metadata,
    pub updates: UpdateSink,
    cancelled: watch::Receiver<bool>,
}

impl OperationContext {
    pub fn new(kind: OperationKind, entity: EntityName, operation: impl Into<String>, args: Value) -> Self {
        // Sender dropped immediately: this context can never be cancelled.
        let (_tx, rx) = watch::channel(false);
        Self {
            id: OperationId::new(),
            kind,
            entity,
            operation: operation.into(),
            args,
            select: None,
            meta: Metadata::default(),
            updates: UpdateSink::disconnected(),
            cancelled: rx,
        }
    }

    pub fn is_cancelled(&self) -> bool { *self.cancelled.borrow() }

    /// Resolves when the operation is cancelled; pends forever if it never is.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // No cancel sender left: cancellation can no longer happen
                std::future::pending::<()>().await;
            }
        }
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}.{}", self.id, self.kind, self.entity, self.operation)
    }
}

/// The outcome of one dispatch: a decoded data payload or an error value,
/// never both.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub data: Option<Value>,
    pub error: Option<ErrorValue>,
}

impl OperationResult {
    pub fn ok(data: Value) -> Self { Self { data: Some(data), error: None } }
    pub fn empty() -> Self { Self { data: None, error: None } }
    pub fn error(error: ErrorValue) -> Self { Self { data: None, error: Some(error) } }
    pub fn is_error(&self) -> bool { self.error.is_some() }
}

/// A link is a middleware in the operation chain: it may short-circuit by not
/// calling `next`, transform the context before calling it, or transform the
/// result after.
#[async_trait]
pub trait Link: Send + Sync {
    async fn call(&self, ctx: OperationContext, next: Next<'_>) -> OperationResult;
}

/// Erase a concrete link for chain composition.
pub fn link<L: Link + 'static>(link: L) -> Arc<dyn Link> { Arc::new(link) }

/// Continuation handle for the rest of the chain. Copyable, so a link (e.g.
/// retry) can invoke the remainder more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Link>],
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: OperationContext) -> OperationResult {
        match self.chain.split_first() {
            Some((head, rest)) => head.call(ctx, Next { chain: rest }).await,
            None => {
                error!("executor: link chain exhausted without a terminal ({ctx:?})");
                OperationResult::error(ErrorValue::internal("link chain exhausted without a terminal"))
            }
        }
    }

    /// An owned copy of the remaining chain, for links that re-run it from a
    /// background task (cache revalidation).
    pub fn rest(self) -> LinkChain { LinkChain { links: self.chain.to_vec().into() } }
}

/// The composed dispatcher: middlewares in order, the terminal last.
#[derive(Clone)]
pub struct LinkChain {
    links: Arc<[Arc<dyn Link>]>,
}

impl LinkChain {
    /// Compose a chain. At least one link (the terminal) is required.
    pub fn new(links: Vec<Arc<dyn Link>>) -> Result<Self, ConfigError> {
        if links.is_empty() {
            return Err(ConfigError::EmptyLinkChain);
        }
        Ok(Self { links: links.into() })
    }

    /// Walk the chain left-to-right and await the final result. Errors are
    /// carried in the result's `error` slot; this never panics across the
    /// boundary.
    pub async fn dispatch(&self, ctx: OperationContext) -> OperationResult { Next { chain: &self.links }.run(ctx).await }

    /// Dispatch with a hybrid awaitable-and-observable result. The promise
    /// side resolves with the chain's return value; the observable side
    /// yields every value pushed through the context's update sink afterward.
    pub fn execute(&self, kind: OperationKind, entity: EntityName, operation: impl Into<String>, args: Value) -> OperationHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        let mut ctx = OperationContext::new(kind, entity, operation, args);
        ctx.updates = UpdateSink::connected(update_tx);
        ctx.cancelled = cancel_rx;

        let chain = self.clone();
        let first: Shared<BoxFuture<'static, OperationResult>> = async move { chain.dispatch(ctx).await }.boxed().shared();

        // Drive the producer even when nobody awaits the promise side yet
        crate::task::spawn(first.clone());

        OperationHandle { first, updates: Mutex::new(Some(update_rx)), cancel: Arc::new(cancel_tx) }
    }
}

/// Hybrid result of [`LinkChain::execute`]: await the first settled value
/// with [`result`](Self::result), or take the stream of subsequent values
/// with [`observe`](Self::observe). Both sides share one producer.
pub struct OperationHandle {
    first: Shared<BoxFuture<'static, OperationResult>>,
    updates: Mutex<Option<mpsc::UnboundedReceiver<OperationResult>>>,
    cancel: Arc<watch::Sender<bool>>,
}

impl OperationHandle {
    /// The first settled value. May be awaited from several holders.
    pub async fn result(&self) -> OperationResult { self.first.clone().await }

    /// The stream of values after the first. Single consumer: the second call
    /// returns an already-finished stream.
    pub fn observe(&self) -> UpdateStream {
        UpdateStream { rx: self.updates.lock().expect("updates lock poisoned").take(), cancel: self.cancel.clone() }
    }

    /// Flip the cancellation signal. Links observe it between stages as their
    /// awaits unwind, innermost first.
    pub fn cancel(&self) { let _ = self.cancel.send(true); }
}

/// Stream of post-first values for a subscription-shaped operation. Dropping
/// it cancels the operation.
pub struct UpdateStream {
    rx: Option<mpsc::UnboundedReceiver<OperationResult>>,
    cancel: Arc<watch::Sender<bool>>,
}

impl UpdateStream {
    pub async fn next(&mut self) -> Option<OperationResult> {
        match &mut self.rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn try_next(&mut self) -> Option<OperationResult> {
        match &mut self.rx {
            Some(rx) => rx.try_recv().ok(),
            None => None,
        }
    }
}

impl Drop for UpdateStream {
    fn drop(&mut self) {
        if self.rx.is_some() {
            let _ = self.cancel.send(true);
        }
    }
}
