use async_trait::async_trait;
use prism_proto::{deterministic_json, OperationKind};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{Link, Next, OperationContext, OperationResult};

struct CachedEntry {
    result: OperationResult,
    stored_at: Instant,
    revalidating: bool,
}

/// Request cache keyed by the deterministic JSON of (entity, operation, args),
/// with a TTL and optional stale-while-revalidate: a stale hit is returned
/// immediately while the rest of the chain re-runs in the background, and the
/// fresh value is swapped in through the observable channel.
///
/// Only query results are cached; mutations and subscriptions pass through.
pub struct CacheLink {
    ttl: Duration,
    stale_while_revalidate: bool,
    entries: Arc<Mutex<HashMap<String, CachedEntry>>>,
}

impl CacheLink {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, stale_while_revalidate: false, entries: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    fn cache_key(ctx: &OperationContext) -> String {
        deterministic_json(&json!({
            "entity": ctx.entity.as_str(),
            "operation": ctx.operation,
            "args": ctx.args,
        }))
    }

    pub fn len(&self) -> usize { self.entries.lock().expect("cache lock poisoned").len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn clear(&self) { self.entries.lock().expect("cache lock poisoned").clear(); }
}

#[async_trait]
impl Link for CacheLink {
    async fn call(&self, ctx: OperationContext, next: Next<'_>) -> OperationResult {
        if ctx.kind != OperationKind::Query {
            return next.run(ctx).await;
        }

        let key = Self::cache_key(&ctx);

        enum Hit {
            Fresh(OperationResult),
            Stale(OperationResult),
            Miss,
        }

        let hit = {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            match entries.get_mut(&key) {
                Some(entry) if entry.stored_at.elapsed() < self.ttl => Hit::Fresh(entry.result.clone()),
                Some(entry) if self.stale_while_revalidate => {
                    if entry.revalidating {
                        // A revalidation is already running; keep serving stale
                        Hit::Fresh(entry.result.clone())
                    } else {
                        entry.revalidating = true;
                        Hit::Stale(entry.result.clone())
                    }
                }
                Some(_) | None => Hit::Miss,
            }
        };

        match hit {
            Hit::Fresh(result) => {
                debug!("cache: hit for {ctx:?}");
                result
            }
            Hit::Stale(stale) => {
                debug!("cache: stale hit for {ctx:?}, revalidating");
                let rest = next.rest();
                let entries = self.entries.clone();
                let revalidate_ctx = ctx.clone();
                crate::task::spawn(async move {
                    let fresh = rest.dispatch(revalidate_ctx.clone()).await;
                    {
                        let mut entries = entries.lock().expect("cache lock poisoned");
                        if fresh.is_error() {
                            // Keep the stale entry; it can revalidate again
                            if let Some(entry) = entries.get_mut(&key) {
                                entry.revalidating = false;
                            }
                        } else {
                            entries.insert(
                                key,
                                CachedEntry { result: fresh.clone(), stored_at: Instant::now(), revalidating: false },
                            );
                        }
                    }
                    if !fresh.is_error() {
                        revalidate_ctx.updates.push(fresh);
                    }
                });
                stale
            }
            Hit::Miss => {
                let result = next.run(ctx).await;
                if !result.is_error() {
                    let mut entries = self.entries.lock().expect("cache lock poisoned");
                    entries.insert(key, CachedEntry { result: result.clone(), stored_at: Instant::now(), revalidating: false });
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LinkChain;
    use prism_proto::ErrorValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Link for Counter {
        async fn call(&self, _ctx: OperationContext, _next: Next<'_>) -> OperationResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                OperationResult::error(ErrorValue::transport("down"))
            } else {
                OperationResult::ok(json!(n))
            }
        }
    }

    fn ctx() -> OperationContext {
        OperationContext::new(OperationKind::Query, "User".into(), "get", json!({"id": "u1"}))
    }

    #[tokio::test]
    async fn fresh_hits_skip_the_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = LinkChain::new(vec![
            crate::executor::link(CacheLink::new(Duration::from_secs(60))),
            crate::executor::link(Counter { calls: calls.clone(), fail: false }),
        ])
        .unwrap();

        assert_eq!(chain.dispatch(ctx()).await.data, Some(json!(0)));
        assert_eq!(chain.dispatch(ctx()).await.data, Some(json!(0)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = LinkChain::new(vec![
            crate::executor::link(CacheLink::new(Duration::from_secs(60))),
            crate::executor::link(Counter { calls: calls.clone(), fail: true }),
        ])
        .unwrap();

        assert!(chain.dispatch(ctx()).await.is_error());
        assert!(chain.dispatch(ctx()).await.is_error());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_hit_returns_then_revalidates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = LinkChain::new(vec![
            crate::executor::link(CacheLink::new(Duration::from_millis(1)).stale_while_revalidate(true)),
            crate::executor::link(Counter { calls: calls.clone(), fail: false }),
        ])
        .unwrap();

        // Prime the cache, then let the entry go stale
        assert_eq!(chain.dispatch(ctx()).await.data, Some(json!(0)));
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Stale value comes back immediately; fresh lands on the update channel
        let handle = chain.execute(OperationKind::Query, "User".into(), "get", json!({"id": "u1"}));
        let stale = handle.result().await;
        assert_eq!(stale.data, Some(json!(0)));

        let mut stream = handle.observe();
        let fresh = stream.next().await.unwrap();
        assert_eq!(fresh.data, Some(json!(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_args_use_distinct_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = LinkChain::new(vec![
            crate::executor::link(CacheLink::new(Duration::from_secs(60))),
            crate::executor::link(Counter { calls: calls.clone(), fail: false }),
        ])
        .unwrap();

        let a = OperationContext::new(OperationKind::Query, "User".into(), "get", json!({"id": "u1"}));
        let b = OperationContext::new(OperationKind::Query, "User".into(), "get", json!({"id": "u2"}));
        chain.dispatch(a).await;
        chain.dispatch(b).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
