use async_trait::async_trait;
use prism_proto::{ErrorValue, FetchRequest, FieldName, OperationKind};
use serde_json::Value;
use std::sync::Arc;
use tracing::error;

use super::{Link, Next, OperationContext, OperationResult};
use crate::connector::Fetcher;
use crate::error::RetrievalError;

/// The terminal link: performs the actual transport call for the operation
/// shapes the resolver and mutation path produce (`get`, `list`, `batch`, and
/// mutations).
pub struct FetchTerminal {
    fetcher: Arc<dyn Fetcher>,
}

impl FetchTerminal {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self { Self { fetcher } }
}

fn retrieval_result<T: serde::Serialize>(result: Result<T, RetrievalError>) -> OperationResult {
    match result {
        Ok(data) => match serde_json::to_value(data) {
            Ok(value) => OperationResult::ok(value),
            Err(e) => {
                error!("terminal: response encoding failed: {e}");
                OperationResult::error(ErrorValue::internal("response encoding failed"))
            }
        },
        Err(err) => OperationResult::error((&err).into()),
    }
}

#[async_trait]
impl Link for FetchTerminal {
    async fn call(&self, ctx: OperationContext, _next: Next<'_>) -> OperationResult {
        if ctx.kind == OperationKind::Mutation {
            return match self.fetcher.mutate(&ctx.entity, &ctx.operation, &ctx.args).await {
                Ok(record) => match record {
                    Some(record) => OperationResult::ok(serde_json::to_value(record).unwrap_or(Value::Null)),
                    None => OperationResult::empty(),
                },
                Err(err) => OperationResult::error(err),
            };
        }

        match ctx.operation.as_str() {
            "get" => {
                let id: prism_proto::EntityId = ctx.args.get("id").and_then(|v| v.as_str()).unwrap_or_default().into();
                let fields: Option<Vec<FieldName>> =
                    ctx.args.get("fields").and_then(|v| serde_json::from_value(v.clone()).ok());
                retrieval_result(self.fetcher.fetch(&ctx.entity, &id, fields.as_deref()).await)
            }
            "list" => {
                let options = ctx.args.get("options").cloned().unwrap_or(Value::Null);
                retrieval_result(self.fetcher.fetch_list(&ctx.entity, &options).await)
            }
            "batch" => {
                let requests: Vec<FetchRequest> = match ctx.args.get("requests").cloned() {
                    Some(value) => match serde_json::from_value(value) {
                        Ok(requests) => requests,
                        Err(e) => return OperationResult::error(ErrorValue::validation(format!("bad batch request: {e}"))),
                    },
                    None => return OperationResult::error(ErrorValue::validation("batch request without requests")),
                };
                retrieval_result(self.fetcher.fetch_batch(&requests).await)
            }
            other => {
                error!("terminal: unknown query operation {other}");
                OperationResult::error(ErrorValue::internal(format!("unknown query operation {other}")))
            }
        }
    }
}
