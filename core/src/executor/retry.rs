use async_trait::async_trait;
use prism_proto::{ErrorKind, ErrorValue};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Link, Next, OperationContext, OperationResult};

pub type RetryPredicate = Arc<dyn Fn(&ErrorValue) -> bool + Send + Sync>;

/// Re-runs the rest of the chain on retryable errors with exponential backoff
/// and optional jitter.
pub struct RetryLink {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    predicate: RetryPredicate,
}

impl RetryLink {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            jitter: true,
            // Transport failures are the retryable default; application and
            // validation failures are deterministic
            predicate: Arc::new(|error| error.kind == ErrorKind::Transport),
        }
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_delay);
        if self.jitter && capped > Duration::ZERO {
            // Up to half the delay of random spread keeps herds apart
            let spread = capped.as_millis() as u64 / 2;
            let extra = rand::thread_rng().gen_range(0..=spread);
            capped + Duration::from_millis(extra)
        } else {
            capped
        }
    }
}

#[async_trait]
impl Link for RetryLink {
    async fn call(&self, ctx: OperationContext, next: Next<'_>) -> OperationResult {
        let mut attempt = 0;
        loop {
            let result = next.run(ctx.clone()).await;

            let Some(error) = &result.error else {
                return result;
            };
            if attempt + 1 >= self.max_attempts || !(self.predicate)(error) {
                return result;
            }
            if ctx.is_cancelled() {
                debug!("retry: {ctx:?} cancelled, not retrying");
                return result;
            }

            let delay = self.delay_for(attempt);
            warn!("retry: {ctx:?} attempt {} failed ({error}), retrying in {delay:?}", attempt + 1);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
