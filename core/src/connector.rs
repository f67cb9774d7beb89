/// Transport boundaries for the client core. Real connectors (websocket, sse,
/// http) are implemented outside this crate; the local-process one lives here
/// for testing purposes.
pub mod local_process;

use async_trait::async_trait;
use prism_proto::{ClientMessage, EntityId, EntityName, FetchRequest, FieldName, Record, UpdateMessage};
use std::sync::Arc;

use crate::error::RetrievalError;

/// Callback receiving server-pushed updates. The transport delivers to a
/// single registered callback and must preserve per-(entity, id, field)
/// ordering.
pub type UpdateCallback = Arc<dyn Fn(UpdateMessage) + Send + Sync>;

/// Subscription channel. Sends are fire-and-forget from the multiplexer's
/// side: delivery failures are the transport's problem, and after a reconnect
/// the transport replays intents rebuilt from the multiplexer's
/// `subscribed_fields` snapshot.
pub trait SubscriptionSender: Send + Sync {
    fn send_message(&self, message: ClientMessage);

    /// Register the single callback that receives incoming updates.
    fn connect_updates(&self, callback: UpdateCallback);
}

/// Request/response channel. Values come back already decoded from the wire
/// format.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, entity: &EntityName, id: &EntityId, fields: Option<&[FieldName]>)
        -> Result<Option<Record>, RetrievalError>;

    async fn fetch_list(&self, entity: &EntityName, options: &serde_json::Value) -> Result<Vec<Record>, RetrievalError>;

    /// Whether this transport advertises a bulk fetch primitive.
    fn supports_batch(&self) -> bool { false }

    /// Bulk fetch; returns per-request `None` for misses. Only called when
    /// `supports_batch` returns true.
    async fn fetch_batch(&self, requests: &[FetchRequest]) -> Result<Vec<Option<Record>>, RetrievalError> {
        let _ = requests;
        Err(RetrievalError::Internal("bulk fetch not supported by this transport".to_string()))
    }

    /// Dispatch a mutation with validated args. The server returns the
    /// updated entity record (delete mutations need no body) or an
    /// application error.
    async fn mutate(
        &self,
        entity: &EntityName,
        operation: &str,
        args: &serde_json::Value,
    ) -> Result<Option<Record>, prism_proto::ErrorValue>;
}
