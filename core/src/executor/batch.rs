use async_trait::async_trait;
use futures::future::BoxFuture;
use prism_proto::{ErrorValue, OperationKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::{Link, Next, OperationContext, OperationResult};

pub type BatchExecutor = Arc<dyn Fn(Vec<OperationContext>) -> BoxFuture<'static, Vec<OperationResult>> + Send + Sync>;

struct Pending {
    ctx: OperationContext,
    responder: oneshot::Sender<OperationResult>,
}

struct Inner {
    window: Duration,
    execute_batch: BatchExecutor,
    pending: Mutex<Vec<Pending>>,
    scheduled: AtomicBool,
}

/// Accumulates queries over a short window and dispatches them as one
/// transport call, demultiplexing results by index. Mutations and
/// subscriptions pass straight through.
pub struct BatchLink(Arc<Inner>);

impl BatchLink {
    pub fn new(window: Duration, execute_batch: BatchExecutor) -> Self {
        Self(Arc::new(Inner { window, execute_batch, pending: Mutex::new(Vec::new()), scheduled: AtomicBool::new(false) }))
    }

    fn schedule(&self) {
        if self.0.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.0);
        crate::task::spawn(async move {
            tokio::time::sleep(inner.window).await;
            inner.scheduled.store(false, Ordering::Release);

            let drained: Vec<Pending> = {
                let mut pending = inner.pending.lock().expect("pending lock poisoned");
                pending.drain(..).collect()
            };
            if drained.is_empty() {
                return;
            }
            debug!("batch: dispatching {} queries as one call", drained.len());

            let (contexts, responders): (Vec<_>, Vec<_>) =
                drained.into_iter().map(|p| (p.ctx, p.responder)).unzip();
            let mut results = (inner.execute_batch)(contexts).await;

            if results.len() != responders.len() {
                error!("batch: executor returned {} results for {} queries", results.len(), responders.len());
                results.resize_with(responders.len(), || {
                    OperationResult::error(ErrorValue::internal("batch result count mismatch"))
                });
            }
            for (responder, result) in responders.into_iter().zip(results) {
                let _ = responder.send(result);
            }
        });
    }
}

#[async_trait]
impl Link for BatchLink {
    async fn call(&self, ctx: OperationContext, next: Next<'_>) -> OperationResult {
        if ctx.kind != OperationKind::Query {
            return next.run(ctx).await;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.0.pending.lock().expect("pending lock poisoned");
            pending.push(Pending { ctx, responder: tx });
        }
        self.schedule();

        match rx.await {
            Ok(result) => result,
            Err(_) => OperationResult::error(ErrorValue::internal("batch dispatch dropped the query")),
        }
    }
}
