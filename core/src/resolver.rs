use futures::future::{BoxFuture, FutureExt, Shared};
use prism_proto::{EntityId, EntityName, FetchRequest, FieldName, OperationKind, QueryKey, Record};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connector::Fetcher;
use crate::entity::{DerivedEntity, EntityCell};
use crate::error::RetrievalError;
use crate::executor::{LinkChain, OperationContext, OperationResult};
use crate::muxer::SubscriptionMultiplexer;
use prism_signals::{Calculated, Get};

/// Width of the window that gathers [`QueryResolver::queue_fetch`] calls into
/// one bulk request.
pub const BATCH_WINDOW: Duration = Duration::from_millis(10);

type SharedFetch = Shared<BoxFuture<'static, Result<EntityCell, RetrievalError>>>;
type SharedListFetch = Shared<BoxFuture<'static, Result<Vec<EntityCell>, RetrievalError>>>;

struct QueryRef {
    count: usize,
    targets: Vec<(EntityName, EntityId)>,
    fields: Option<Vec<FieldName>>,
}

struct QueuedFetch {
    entity: EntityName,
    id: EntityId,
    fields: Option<Vec<FieldName>>,
    responder: oneshot::Sender<Result<EntityHandle, RetrievalError>>,
}

struct Inner {
    muxer: SubscriptionMultiplexer,
    chain: LinkChain,
    /// Capability probe only; actual calls go through the link chain
    fetcher: Arc<dyn Fetcher>,
    inflight: Mutex<HashMap<QueryKey, SharedFetch>>,
    inflight_lists: Mutex<HashMap<QueryKey, SharedListFetch>>,
    /// Per-query ref table; the subscription behind a key is made once, on the
    /// first holder, and released once, on the last
    queries: Mutex<HashMap<QueryKey, QueryRef>>,
    pending: Mutex<Vec<QueuedFetch>>,
    batch_scheduled: AtomicBool,
}

/// Resolves entity and list queries by deriving from existing subscriptions
/// where possible, deduplicating in-flight fetches by canonical key, and
/// batching queued fetches into bulk requests.
#[derive(Clone)]
pub struct QueryResolver(Arc<Inner>);

/// What a resolve returns: either the live entity cell itself, or a derived
/// view that reads through one without its own subscription.
#[derive(Clone, Debug)]
pub enum EntityHandle {
    Direct { cell: EntityCell, key: QueryKey },
    Derived(DerivedEntity),
}

impl EntityHandle {
    pub fn derived(&self) -> bool { matches!(self, EntityHandle::Derived(_)) }

    pub fn read(&self, field: &str) -> Option<Value> {
        match self {
            EntityHandle::Direct { cell, .. } => cell.read(field),
            EntityHandle::Derived(view) => view.read(field),
        }
    }

    pub fn value(&self) -> Record {
        match self {
            EntityHandle::Direct { cell, .. } => cell.value(),
            EntityHandle::Derived(view) => view.value(),
        }
    }

    /// The backing cell (the source cell, for a derived view).
    pub fn cell(&self) -> &EntityCell {
        match self {
            EntityHandle::Direct { cell, .. } => cell,
            EntityHandle::Derived(view) => view.source(),
        }
    }

    /// The canonical key to pass to [`QueryResolver::release_query`]. Derived
    /// views hold no subscription and have nothing to release.
    pub fn key(&self) -> Option<&QueryKey> {
        match self {
            EntityHandle::Direct { key, .. } => Some(key),
            EntityHandle::Derived(_) => None,
        }
    }
}

/// A resolved list query: the installed item cells plus a computed list value.
pub struct ListHandle {
    key: QueryKey,
    items: Vec<EntityCell>,
    aggregate: Calculated<Vec<Record>>,
}

impl ListHandle {
    fn new(key: QueryKey, items: Vec<EntityCell>) -> Self {
        let aggregate = Calculated::new({
            let items = items.clone();
            move || items.iter().map(|cell| cell.value()).collect()
        });
        Self { key, items, aggregate }
    }

    pub fn key(&self) -> &QueryKey { &self.key }
    pub fn items(&self) -> &[EntityCell] { &self.items }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// The array of item aggregate values, tracked as one dependency.
    pub fn value(&self) -> Vec<Record> { self.aggregate.get() }
}

impl QueryResolver {
    pub fn new(muxer: SubscriptionMultiplexer, chain: LinkChain, fetcher: Arc<dyn Fetcher>) -> Self {
        Self(Arc::new(Inner {
            muxer,
            chain,
            fetcher,
            inflight: Mutex::new(HashMap::new()),
            inflight_lists: Mutex::new(HashMap::new()),
            queries: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            batch_scheduled: AtomicBool::new(false),
        }))
    }

    /// Resolve one entity.
    ///
    /// 1. With a field list whose every field (or the whole entity) is already
    ///    subscribed, returns a derived view: no fetch, no new subscription.
    /// 2. With no field list and a cached cell, reuses it and acquires the
    ///    full-entity subscription for the query key.
    /// 3. Otherwise performs a deduplicated fetch keyed by the canonical
    ///    query key, installs the result, and subscribes.
    pub async fn resolve_entity(
        &self,
        entity: &EntityName,
        id: &EntityId,
        fields: Option<&[FieldName]>,
    ) -> Result<EntityHandle, RetrievalError> {
        let key = QueryKey::entity(entity, id, fields);

        if let Some(fields) = fields {
            if self.0.muxer.can_derive(entity, id, fields) {
                let cell = self
                    .0
                    .muxer
                    .cell(entity, id)
                    .ok_or_else(|| RetrievalError::Internal("derivable entity without a cell".to_string()))?;
                debug!("resolver: {key} derived from existing subscription");
                return Ok(EntityHandle::Derived(cell.derive(fields.to_vec())));
            }
        }

        if fields.is_none() {
            if let Some(cell) = self.0.muxer.cell(entity, id) {
                debug!("resolver: {key} served from cached cell");
                self.acquire_query(&key, vec![(entity.clone(), id.clone())], None);
                return Ok(EntityHandle::Direct { cell, key });
            }
        }

        let fetch = self.inflight_fetch(&key, entity, id, fields);
        let cell = fetch.await?;
        self.acquire_query(&key, vec![(entity.clone(), id.clone())], fields.map(|f| f.to_vec()));
        Ok(EntityHandle::Direct { cell, key })
    }

    /// Enqueue a fetch for the next batching tick. When the transport
    /// advertises a bulk primitive the queued items go out as one request;
    /// otherwise each falls back to a deduplicated single fetch.
    pub fn queue_fetch(
        &self,
        entity: EntityName,
        id: EntityId,
        fields: Option<Vec<FieldName>>,
    ) -> impl std::future::Future<Output = Result<EntityHandle, RetrievalError>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.0.pending.lock().expect("pending lock poisoned");
            pending.push(QueuedFetch { entity, id, fields, responder: tx });
        }
        self.schedule_batch();

        async move {
            rx.await.unwrap_or_else(|_| Err(RetrievalError::Internal("queued fetch dropped".to_string())))
        }
    }

    /// Resolve a list query. Lists fetch unconditionally (no derivation
    /// heuristic), install each item, and subscribe per item only after the
    /// whole fetch succeeded, so a failure leaves no partial subscriptions.
    /// The requested per-item fields ride in `options.fields`.
    pub async fn resolve_list(&self, entity: &EntityName, options: Value) -> Result<ListHandle, RetrievalError> {
        let key = QueryKey::list(entity, &options);
        let fields: Option<Vec<FieldName>> =
            options.get("fields").and_then(|v| serde_json::from_value(v.clone()).ok());

        let fetch = self.inflight_list_fetch(&key, entity, options);
        let items = fetch.await?;

        let targets: Vec<(EntityName, EntityId)> =
            items.iter().map(|cell| (cell.entity().clone(), cell.id().clone())).collect();
        self.acquire_query(&key, targets, fields);

        Ok(ListHandle::new(key, items))
    }

    /// Decrement the ref table for a query key; on the last release the
    /// matching fields (or the full entity) are unsubscribed for every target.
    pub fn release_query(&self, key: &QueryKey) {
        let released = {
            let mut queries = self.0.queries.lock().expect("queries lock poisoned");
            match queries.get_mut(key) {
                Some(entry) => {
                    entry.count -= 1;
                    if entry.count == 0 { queries.remove(key) } else { None }
                }
                None => {
                    warn!("resolver: release of unknown query {key}");
                    None
                }
            }
        };

        if let Some(entry) = released {
            debug!("resolver: last holder released {key}");
            for (entity, id) in &entry.targets {
                match &entry.fields {
                    Some(fields) => {
                        for field in fields {
                            self.0.muxer.unsubscribe_field(entity, id, field);
                        }
                    }
                    None => self.0.muxer.unsubscribe_entity(entity, id),
                }
            }
        }
    }

    /// Number of distinct query keys currently held (diagnostics/tests).
    pub fn active_queries(&self) -> usize { self.0.queries.lock().expect("queries lock poisoned").len() }

    pub fn inflight_count(&self) -> usize { self.0.inflight.lock().expect("inflight lock poisoned").len() }

    fn acquire_query(&self, key: &QueryKey, targets: Vec<(EntityName, EntityId)>, fields: Option<Vec<FieldName>>) {
        let subscribe = {
            let mut queries = self.0.queries.lock().expect("queries lock poisoned");
            match queries.get_mut(key) {
                Some(entry) => {
                    entry.count += 1;
                    None
                }
                None => {
                    queries.insert(key.clone(), QueryRef { count: 1, targets: targets.clone(), fields: fields.clone() });
                    Some((targets, fields))
                }
            }
        };

        // First holder of the key: make the subscription (outside the lock)
        if let Some((targets, fields)) = subscribe {
            for (entity, id) in &targets {
                match &fields {
                    Some(fields) => {
                        for field in fields {
                            self.0.muxer.subscribe_field(entity, id, field);
                        }
                    }
                    None => self.0.muxer.subscribe_entity(entity, id),
                }
            }
        }
    }

    /// At most one concurrent fetch per canonical key; later callers attach
    /// to the same future, and errors propagate to every attached caller.
    /// The entry is removed on settlement regardless of outcome.
    fn inflight_fetch(
        &self,
        key: &QueryKey,
        entity: &EntityName,
        id: &EntityId,
        fields: Option<&[FieldName]>,
    ) -> SharedFetch {
        let mut inflight = self.0.inflight.lock().expect("inflight lock poisoned");
        if let Some(fetch) = inflight.get(key) {
            debug!("resolver: joining in-flight fetch {key}");
            return fetch.clone();
        }

        let inner = Arc::clone(&self.0);
        let key_for_removal = key.clone();
        let entity = entity.clone();
        let id = id.clone();
        let fields: Option<Vec<FieldName>> = fields.map(|f| f.to_vec());

        let fetch: SharedFetch = async move {
            let result = fetch_and_install(&inner, &entity, &id, fields.as_deref()).await;
            inner.inflight.lock().expect("inflight lock poisoned").remove(&key_for_removal);
            result
        }
        .boxed()
        .shared();

        inflight.insert(key.clone(), fetch.clone());
        fetch
    }

    fn inflight_list_fetch(&self, key: &QueryKey, entity: &EntityName, options: Value) -> SharedListFetch {
        let mut inflight = self.0.inflight_lists.lock().expect("inflight lock poisoned");
        if let Some(fetch) = inflight.get(key) {
            debug!("resolver: joining in-flight list fetch {key}");
            return fetch.clone();
        }

        let inner = Arc::clone(&self.0);
        let key_for_removal = key.clone();
        let entity = entity.clone();

        let fetch: SharedListFetch = async move {
            let result = fetch_and_install_list(&inner, &entity, options).await;
            inner.inflight_lists.lock().expect("inflight lock poisoned").remove(&key_for_removal);
            result
        }
        .boxed()
        .shared();

        inflight.insert(key.clone(), fetch.clone());
        fetch
    }

    fn schedule_batch(&self) {
        if self.0.batch_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let resolver = self.clone();
        crate::task::spawn(async move {
            tokio::time::sleep(BATCH_WINDOW).await;
            resolver.0.batch_scheduled.store(false, Ordering::Release);
            resolver.drain_batch().await;
        });
    }

    async fn drain_batch(&self) {
        let drained: Vec<QueuedFetch> = {
            let mut pending = self.0.pending.lock().expect("pending lock poisoned");
            pending.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }

        if self.0.fetcher.supports_batch() {
            debug!("resolver: bulk fetch of {} queued items", drained.len());
            self.drain_batch_bulk(drained).await;
        } else {
            // No bulk primitive: per-item deduplicated fetches
            for item in drained {
                let resolver = self.clone();
                crate::task::spawn(async move {
                    let result = resolver.resolve_entity(&item.entity, &item.id, item.fields.as_deref()).await;
                    let _ = item.responder.send(result);
                });
            }
        }
    }

    async fn drain_batch_bulk(&self, drained: Vec<QueuedFetch>) {
        let requests: Vec<FetchRequest> = drained
            .iter()
            .map(|item| FetchRequest { entity: item.entity.clone(), id: item.id.clone(), fields: item.fields.clone() })
            .collect();

        let ctx = OperationContext::new(
            OperationKind::Query,
            drained[0].entity.clone(),
            "batch",
            json!({ "requests": requests }),
        );
        let result = self.0.chain.dispatch(ctx).await;

        let records: Vec<Option<Record>> = match decode_result(result) {
            Ok(value) => match serde_json::from_value(value) {
                Ok(records) => records,
                Err(e) => {
                    let error = RetrievalError::Internal(format!("bulk fetch returned malformed records: {e}"));
                    for item in drained {
                        let _ = item.responder.send(Err(error.clone()));
                    }
                    return;
                }
            },
            Err(error) => {
                for item in drained {
                    let _ = item.responder.send(Err(error.clone()));
                }
                return;
            }
        };

        if records.len() != drained.len() {
            let error = RetrievalError::Internal("bulk fetch result count mismatch".to_string());
            for item in drained {
                let _ = item.responder.send(Err(error.clone()));
            }
            return;
        }

        // Demultiplex by index
        for (item, record) in drained.into_iter().zip(records) {
            let result = match record {
                Some(record) => {
                    let cell = install(&self.0, &item.entity, &item.id, record);
                    let key = QueryKey::entity(&item.entity, &item.id, item.fields.as_deref());
                    self.acquire_query(&key, vec![(item.entity.clone(), item.id.clone())], item.fields.clone());
                    Ok(EntityHandle::Direct { cell, key })
                }
                None => Err(RetrievalError::NotFound),
            };
            let _ = item.responder.send(result);
        }
    }
}

fn decode_result(result: OperationResult) -> Result<Value, RetrievalError> {
    if let Some(error) = result.error {
        return Err(error.into());
    }
    result.data.ok_or_else(|| RetrievalError::Internal("operation result carried no data".to_string()))
}

fn install(inner: &Arc<Inner>, entity: &EntityName, id: &EntityId, record: Record) -> EntityCell {
    let cell = match inner.muxer.cell(entity, id) {
        Some(cell) => {
            cell.set_fields(record);
            cell
        }
        None => inner.muxer.get_or_create(entity, id, record),
    };
    cell.set_loading(false);
    cell.set_error(None);
    cell
}

async fn fetch_and_install(
    inner: &Arc<Inner>,
    entity: &EntityName,
    id: &EntityId,
    fields: Option<&[FieldName]>,
) -> Result<EntityCell, RetrievalError> {
    // A refetch over an existing cell shows as loading while in flight
    if let Some(cell) = inner.muxer.cell(entity, id) {
        cell.set_loading(true);
    }

    let ctx = OperationContext::new(
        OperationKind::Query,
        entity.clone(),
        "get",
        json!({ "id": id, "fields": fields }),
    );
    let result = inner.chain.dispatch(ctx).await;

    let data = match decode_result(result) {
        Ok(data) => data,
        Err(error) => {
            if let Some(cell) = inner.muxer.cell(entity, id) {
                cell.set_loading(false);
                cell.set_error(Some((&error).into()));
            }
            return Err(error);
        }
    };
    if data.is_null() {
        if let Some(cell) = inner.muxer.cell(entity, id) {
            cell.set_loading(false);
        }
        return Err(RetrievalError::NotFound);
    }
    let record: Record = serde_json::from_value(data)
        .map_err(|e| RetrievalError::Internal(format!("fetch returned a non-record payload: {e}")))?;

    Ok(install(inner, entity, id, record))
}

async fn fetch_and_install_list(
    inner: &Arc<Inner>,
    entity: &EntityName,
    options: Value,
) -> Result<Vec<EntityCell>, RetrievalError> {
    let ctx = OperationContext::new(OperationKind::Query, entity.clone(), "list", json!({ "options": options }));
    let result = inner.chain.dispatch(ctx).await;

    let data = decode_result(result)?;
    let records: Vec<Record> = serde_json::from_value(data)
        .map_err(|e| RetrievalError::Internal(format!("list fetch returned a non-array payload: {e}")))?;

    let mut items = Vec::with_capacity(records.len());
    for record in records {
        let Some(id) = record.get("id").and_then(|v| v.as_str()).map(|s| s.to_owned()) else {
            warn!("resolver: skipping list item without an id field for {entity}");
            continue;
        };
        items.push(install(inner, entity, &id.into(), record));
    }
    Ok(items)
}
