use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, warn};

use super::{Link, Next, OperationContext, OperationResult};

/// Logs each operation with its outcome and duration.
#[derive(Default)]
pub struct LoggingLink {}

impl LoggingLink {
    pub fn new() -> Self { Self {} }
}

#[async_trait]
impl Link for LoggingLink {
    async fn call(&self, ctx: OperationContext, next: Next<'_>) -> OperationResult {
        let started = Instant::now();
        debug!("op {ctx:?}: dispatch");

        let result = next.run(ctx.clone()).await;

        let elapsed = started.elapsed();
        match &result.error {
            None => debug!("op {ctx:?}: ok in {elapsed:?}"),
            Some(error) => warn!("op {ctx:?}: {error} in {elapsed:?}"),
        }
        result
    }
}
