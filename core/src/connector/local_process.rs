//! In-process connector used by the test suites: one struct plays both the
//! subscription channel and the request/response channel against an in-memory
//! record store.

use async_trait::async_trait;
use prism_proto::{ClientMessage, EntityId, EntityName, FetchRequest, FieldName, FieldSelection, FieldUpdate, Record, UpdateMessage};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

use super::{Fetcher, SubscriptionSender, UpdateCallback};
use crate::error::RetrievalError;

#[derive(Default)]
struct FieldSubscription {
    all: bool,
    fields: HashSet<FieldName>,
}

struct Inner {
    records: Mutex<HashMap<(EntityName, EntityId), Record>>,
    subscriptions: Mutex<HashMap<(EntityName, EntityId), FieldSubscription>>,
    update_callback: RwLock<Option<UpdateCallback>>,
    sent_messages: Mutex<Vec<ClientMessage>>,
    fetch_calls: AtomicUsize,
    fetch_list_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    latency: Mutex<Duration>,
    fail_next_fetch: Mutex<Option<RetrievalError>>,
    fail_next_mutation: Mutex<Option<prism_proto::ErrorValue>>,
    batching: bool,
}

/// An in-memory "server" for a single client. Seed records, then hand clones
/// of this to the client as both transports. Subscription bookkeeping mirrors
/// what a real server does: pushes for unsubscribed fields are refused.
#[derive(Clone)]
pub struct LocalProcessConnector(Arc<Inner>);

impl LocalProcessConnector {
    pub fn new() -> Self { Self::with_batching(false) }

    /// A connector that advertises the bulk fetch primitive.
    pub fn with_batching(batching: bool) -> Self {
        Self(Arc::new(Inner {
            records: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            update_callback: RwLock::new(None),
            sent_messages: Mutex::new(Vec::new()),
            fetch_calls: AtomicUsize::new(0),
            fetch_list_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            latency: Mutex::new(Duration::ZERO),
            fail_next_fetch: Mutex::new(None),
            fail_next_mutation: Mutex::new(None),
            batching,
        }))
    }

    pub fn seed(&self, entity: impl Into<EntityName>, id: impl Into<EntityId>, record: Record) {
        self.0.records.lock().unwrap().insert((entity.into(), id.into()), record);
    }

    /// Artificial latency applied to every fetch, for dedup tests.
    pub fn set_latency(&self, latency: Duration) { *self.0.latency.lock().unwrap() = latency; }

    pub fn fail_next_fetch(&self, error: RetrievalError) { *self.0.fail_next_fetch.lock().unwrap() = Some(error); }

    pub fn fail_next_mutation(&self, error: prism_proto::ErrorValue) {
        *self.0.fail_next_mutation.lock().unwrap() = Some(error);
    }

    pub fn fetch_calls(&self) -> usize { self.0.fetch_calls.load(Ordering::SeqCst) }
    pub fn fetch_list_calls(&self) -> usize { self.0.fetch_list_calls.load(Ordering::SeqCst) }
    pub fn batch_calls(&self) -> usize { self.0.batch_calls.load(Ordering::SeqCst) }

    pub fn sent_messages(&self) -> Vec<ClientMessage> { self.0.sent_messages.lock().unwrap().clone() }
    pub fn clear_sent_messages(&self) { self.0.sent_messages.lock().unwrap().clear(); }

    pub fn subscribe_message_count(&self) -> usize {
        self.0.sent_messages.lock().unwrap().iter().filter(|m| matches!(m, ClientMessage::Subscribe { .. })).count()
    }
    pub fn unsubscribe_message_count(&self) -> usize {
        self.0.sent_messages.lock().unwrap().iter().filter(|m| matches!(m, ClientMessage::Unsubscribe { .. })).count()
    }

    /// Whether the server currently holds a subscription for the field.
    pub fn is_subscribed(&self, entity: &EntityName, id: &EntityId, field: &str) -> bool {
        let subscriptions = self.0.subscriptions.lock().unwrap();
        match subscriptions.get(&(entity.clone(), id.clone())) {
            Some(sub) => sub.all || sub.fields.contains(field),
            None => false,
        }
    }

    /// Push an update toward the client, honoring subscription state: updates
    /// for fields the client never subscribed to are refused, like a real
    /// server would.
    pub fn push_update(&self, entity: impl Into<EntityName>, id: impl Into<EntityId>, field: &str, update: FieldUpdate) {
        let entity = entity.into();
        let id = id.into();

        if !self.is_subscribed(&entity, &id, field) {
            debug!("local_process: refusing update for unsubscribed field {entity}/{id}.{field}");
            return;
        }

        // Keep the stored record current so later fetches see it
        {
            let mut records = self.0.records.lock().unwrap();
            if let Some(record) = records.get_mut(&(entity.clone(), id.clone())) {
                if let FieldUpdate::Value { data } = &update {
                    record.insert(field.to_owned(), data.clone());
                }
            }
        }

        let callback = self.0.update_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(UpdateMessage::Update { entity, id, field: field.to_owned(), update });
        }
    }

    fn filtered(record: &Record, fields: Option<&[FieldName]>) -> Record {
        match fields {
            Some(fields) => record.iter().filter(|(k, _)| fields.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => record.clone(),
        }
    }
}

impl Default for LocalProcessConnector {
    fn default() -> Self { Self::new() }
}

impl SubscriptionSender for LocalProcessConnector {
    fn send_message(&self, message: ClientMessage) {
        {
            let mut subscriptions = self.0.subscriptions.lock().unwrap();
            match &message {
                ClientMessage::Subscribe { entity, id, fields } => {
                    let sub = subscriptions.entry((entity.clone(), id.clone())).or_default();
                    match fields {
                        FieldSelection::All => sub.all = true,
                        FieldSelection::Fields(fields) => sub.fields.extend(fields.iter().cloned()),
                    }
                }
                ClientMessage::Unsubscribe { entity, id, fields } => {
                    if let Some(sub) = subscriptions.get_mut(&(entity.clone(), id.clone())) {
                        match fields {
                            FieldSelection::All => {
                                sub.all = false;
                                sub.fields.clear();
                            }
                            FieldSelection::Fields(fields) => {
                                for field in fields {
                                    sub.fields.remove(field);
                                }
                            }
                        }
                        if !sub.all && sub.fields.is_empty() {
                            subscriptions.remove(&(entity.clone(), id.clone()));
                        }
                    }
                }
            }
        }
        self.0.sent_messages.lock().unwrap().push(message);
    }

    fn connect_updates(&self, callback: UpdateCallback) { *self.0.update_callback.write().unwrap() = Some(callback); }
}

#[async_trait]
impl Fetcher for LocalProcessConnector {
    async fn fetch(
        &self,
        entity: &EntityName,
        id: &EntityId,
        fields: Option<&[FieldName]>,
    ) -> Result<Option<Record>, RetrievalError> {
        self.0.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.0.latency.lock().unwrap();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.0.fail_next_fetch.lock().unwrap().take() {
            return Err(error);
        }

        let records = self.0.records.lock().unwrap();
        Ok(records.get(&(entity.clone(), id.clone())).map(|record| Self::filtered(record, fields)))
    }

    async fn fetch_list(&self, entity: &EntityName, options: &serde_json::Value) -> Result<Vec<Record>, RetrievalError> {
        self.0.fetch_list_calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.0.latency.lock().unwrap();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.0.fail_next_fetch.lock().unwrap().take() {
            return Err(error);
        }

        let limit = options.get("limit").and_then(|v| v.as_u64()).unwrap_or(u64::MAX);

        let records = self.0.records.lock().unwrap();
        let mut items: Vec<Record> = records
            .iter()
            .filter(|((name, _), _)| name == entity)
            .map(|((_, id), record)| {
                let mut record = record.clone();
                record.entry("id".to_string()).or_insert_with(|| serde_json::Value::String(id.to_string()));
                record
            })
            .collect();
        items.sort_by(|a, b| a.get("id").map(|v| v.to_string()).cmp(&b.get("id").map(|v| v.to_string())));
        items.truncate(limit as usize);
        Ok(items)
    }

    fn supports_batch(&self) -> bool { self.0.batching }

    async fn fetch_batch(&self, requests: &[FetchRequest]) -> Result<Vec<Option<Record>>, RetrievalError> {
        self.0.batch_calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.0.latency.lock().unwrap();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        let records = self.0.records.lock().unwrap();
        Ok(requests
            .iter()
            .map(|request| {
                records
                    .get(&(request.entity.clone(), request.id.clone()))
                    .map(|record| Self::filtered(record, request.fields.as_deref()))
            })
            .collect())
    }

    /// Mutation semantics for tests: `create` installs `args.data` as the
    /// record, `update` merges it, `delete` removes the record. Returns the
    /// record after the mutation (no body for deletes).
    async fn mutate(
        &self,
        entity: &EntityName,
        operation: &str,
        args: &serde_json::Value,
    ) -> Result<Option<Record>, prism_proto::ErrorValue> {
        let latency = *self.0.latency.lock().unwrap();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.0.fail_next_mutation.lock().unwrap().take() {
            return Err(error);
        }

        let id: EntityId = args
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| prism_proto::ErrorValue::validation("mutation args missing id"))?
            .into();
        let data: Record = args
            .get("data")
            .cloned()
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default();

        let mut records = self.0.records.lock().unwrap();
        match operation {
            "create" => {
                records.insert((entity.clone(), id.clone()), data.clone());
                Ok(Some(data))
            }
            "update" => match records.get_mut(&(entity.clone(), id.clone())) {
                Some(record) => {
                    record.extend(data);
                    Ok(Some(record.clone()))
                }
                None => Err(prism_proto::ErrorValue::application(format!("no such {entity}: {id}"))),
            },
            "delete" => {
                records.remove(&(entity.clone(), id.clone()));
                Ok(None)
            }
            other => Err(prism_proto::ErrorValue::application(format!("unknown mutation {other}"))),
        }
    }
}
