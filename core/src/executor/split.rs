use async_trait::async_trait;
use std::sync::Arc;

use super::{link, Link, LinkChain, Next, OperationContext, OperationResult};

pub type SplitPredicate = Arc<dyn Fn(&OperationContext) -> bool + Send + Sync>;

/// Routes each operation to one of two chains by shape. Short-circuits its
/// own chain position: the selected branch runs to its own terminal.
pub struct SplitLink {
    predicate: SplitPredicate,
    left: LinkChain,
    right: LinkChain,
}

impl SplitLink {
    /// `predicate` true selects `left`.
    pub fn new(predicate: SplitPredicate, left: LinkChain, right: LinkChain) -> Self { Self { predicate, left, right } }
}

#[async_trait]
impl Link for SplitLink {
    async fn call(&self, ctx: OperationContext, _next: Next<'_>) -> OperationResult {
        if (self.predicate)(&ctx) { self.left.dispatch(ctx).await } else { self.right.dispatch(ctx).await }
    }
}
