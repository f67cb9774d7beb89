use prism_proto::{ClientMessage, EntityId, EntityName, FieldName, FieldSelection, Record, UpdateMessage};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::connector::SubscriptionSender;
use crate::entity::EntityCell;

/// Nominal width of the batching window that coalesces subscribe and
/// unsubscribe intents into one message per (entity, id).
pub const FLUSH_WINDOW: Duration = Duration::from_millis(10);

struct EntityEntry {
    cell: EntityCell,
    /// How many local subscribers want pushes for each field
    field_refs: HashMap<FieldName, usize>,
    /// Subscribers requesting all fields
    entity_refs: usize,
    pending_subscribe: BTreeSet<FieldName>,
    pending_unsubscribe: BTreeSet<FieldName>,
    pending_subscribe_all: bool,
    pending_unsubscribe_all: bool,
}

impl EntityEntry {
    fn new(cell: EntityCell) -> Self {
        Self {
            cell,
            field_refs: HashMap::new(),
            entity_refs: 0,
            pending_subscribe: BTreeSet::new(),
            pending_unsubscribe: BTreeSet::new(),
            pending_subscribe_all: false,
            pending_unsubscribe_all: false,
        }
    }

    fn has_pending(&self) -> bool {
        !self.pending_subscribe.is_empty()
            || !self.pending_unsubscribe.is_empty()
            || self.pending_subscribe_all
            || self.pending_unsubscribe_all
    }
}

struct Inner {
    entries: Mutex<HashMap<(EntityName, EntityId), EntityEntry>>,
    transport: RwLock<Option<Arc<dyn SubscriptionSender>>>,
    flush_scheduled: AtomicBool,
    destroyed: AtomicBool,
}

/// Coalesces many local subscribers into one stream per (entity, field)
/// toward the server: field interest is ref-counted, intents are batched on a
/// short tick, and opposing intents inside one window cancel without any
/// message. Incoming updates are routed to the owning entity cell.
#[derive(Clone)]
pub struct SubscriptionMultiplexer(Arc<Inner>);

impl SubscriptionMultiplexer {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            entries: Mutex::new(HashMap::new()),
            transport: RwLock::new(None),
            flush_scheduled: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Idempotent: returns the existing cell for the pair if any, else
    /// constructs one whose first-field-access callback feeds
    /// [`subscribe_field`](Self::subscribe_field) (lazy subscription).
    pub fn get_or_create(&self, entity: &EntityName, id: &EntityId, initial: Record) -> EntityCell {
        let mut entries = self.0.entries.lock().expect("entries lock poisoned");
        if let Some(entry) = entries.get(&(entity.clone(), id.clone())) {
            return entry.cell.clone();
        }

        let weak = Arc::downgrade(&self.0);
        let cell = EntityCell::new(
            entity.clone(),
            id.clone(),
            initial,
            {
                let weak = weak.clone();
                let entity = entity.clone();
                let id = id.clone();
                Arc::new(move |field: &FieldName| {
                    if let Some(inner) = weak.upgrade() {
                        SubscriptionMultiplexer(inner).subscribe_field(&entity, &id, field);
                    }
                })
            },
            {
                let entity = entity.clone();
                let id = id.clone();
                Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        SubscriptionMultiplexer(inner).remove_local(&entity, &id);
                    }
                })
            },
        );

        entries.insert((entity.clone(), id.clone()), EntityEntry::new(cell.clone()));
        cell
    }

    /// The entity cell for the pair, if one exists.
    pub fn cell(&self, entity: &EntityName, id: &EntityId) -> Option<EntityCell> {
        let entries = self.0.entries.lock().expect("entries lock poisoned");
        entries.get(&(entity.clone(), id.clone())).map(|entry| entry.cell.clone())
    }

    /// Increment the field's ref-count; a 0→1 transition enqueues a subscribe
    /// intent (unless an unsubscribe was still pending in this window, which
    /// it cancels instead).
    pub fn subscribe_field(&self, entity: &EntityName, id: &EntityId, field: &FieldName) {
        if self.0.destroyed.load(Ordering::Acquire) {
            return;
        }
        let schedule = {
            let mut entries = self.0.entries.lock().expect("entries lock poisoned");
            let Some(entry) = entries.get_mut(&(entity.clone(), id.clone())) else {
                warn!("muxer: subscribe_field for unknown entity {entity}/{id}");
                return;
            };

            let refs = entry.field_refs.entry(field.clone()).or_insert(0);
            *refs += 1;
            if *refs == 1 {
                if entry.pending_unsubscribe.remove(field) {
                    // Cancelled within the window: no message
                    false
                } else {
                    entry.pending_subscribe.insert(field.clone());
                    true
                }
            } else {
                false
            }
        };
        if schedule {
            self.schedule_flush();
        }
    }

    /// Decrement the field's ref-count; a 1→0 transition enqueues an
    /// unsubscribe intent (or cancels a pending subscribe).
    pub fn unsubscribe_field(&self, entity: &EntityName, id: &EntityId, field: &FieldName) {
        let schedule = {
            let mut entries = self.0.entries.lock().expect("entries lock poisoned");
            let Some(entry) = entries.get_mut(&(entity.clone(), id.clone())) else {
                return;
            };
            let Some(refs) = entry.field_refs.get_mut(field) else {
                warn!("muxer: unsubscribe_field without subscription {entity}/{id}.{field}");
                return;
            };
            if *refs == 0 {
                warn!("muxer: unsubscribe_field underflow {entity}/{id}.{field}");
                return;
            }
            *refs -= 1;
            if *refs == 0 {
                entry.field_refs.remove(field);
                if entry.pending_subscribe.remove(field) {
                    false
                } else {
                    entry.pending_unsubscribe.insert(field.clone());
                    true
                }
            } else {
                false
            }
        };
        if schedule {
            self.schedule_flush();
        }
    }

    /// Increment the full-entity ref-count; 0→1 sends an immediate `"*"`
    /// subscribe intent.
    pub fn subscribe_entity(&self, entity: &EntityName, id: &EntityId) {
        if self.0.destroyed.load(Ordering::Acquire) {
            return;
        }
        let send_now = {
            let mut entries = self.0.entries.lock().expect("entries lock poisoned");
            let Some(entry) = entries.get_mut(&(entity.clone(), id.clone())) else {
                warn!("muxer: subscribe_entity for unknown entity {entity}/{id}");
                return;
            };
            entry.entity_refs += 1;
            if entry.entity_refs == 1 {
                if entry.pending_unsubscribe_all {
                    entry.pending_unsubscribe_all = false;
                    false
                } else {
                    true
                }
            } else {
                false
            }
        };
        if send_now {
            match self.transport() {
                Some(transport) => transport
                    .send_message(ClientMessage::Subscribe { entity: entity.clone(), id: id.clone(), fields: FieldSelection::All }),
                None => {
                    let mut entries = self.0.entries.lock().expect("entries lock poisoned");
                    if let Some(entry) = entries.get_mut(&(entity.clone(), id.clone())) {
                        entry.pending_subscribe_all = true;
                    }
                }
            }
        }
    }

    /// Decrement the full-entity ref-count; 1→0 sends an immediate `"*"`
    /// unsubscribe.
    pub fn unsubscribe_entity(&self, entity: &EntityName, id: &EntityId) {
        let send_now = {
            let mut entries = self.0.entries.lock().expect("entries lock poisoned");
            let Some(entry) = entries.get_mut(&(entity.clone(), id.clone())) else {
                return;
            };
            if entry.entity_refs == 0 {
                warn!("muxer: unsubscribe_entity underflow {entity}/{id}");
                return;
            }
            entry.entity_refs -= 1;
            if entry.entity_refs == 0 {
                if entry.pending_subscribe_all {
                    entry.pending_subscribe_all = false;
                    false
                } else {
                    true
                }
            } else {
                false
            }
        };
        if send_now {
            if let Some(transport) = self.transport() {
                transport
                    .send_message(ClientMessage::Unsubscribe { entity: entity.clone(), id: id.clone(), fields: FieldSelection::All });
            }
        }
    }

    /// True iff the full-entity ref-count is positive, or every listed field
    /// has a positive ref-count.
    pub fn can_derive(&self, entity: &EntityName, id: &EntityId, fields: &[FieldName]) -> bool {
        let entries = self.0.entries.lock().expect("entries lock poisoned");
        let Some(entry) = entries.get(&(entity.clone(), id.clone())) else {
            return false;
        };
        if entry.entity_refs > 0 {
            return true;
        }
        fields.iter().all(|field| entry.field_refs.get(field).is_some_and(|refs| *refs > 0))
    }

    /// Route a server update to its entity cell. Unknown targets are silently
    /// dropped.
    pub fn apply_update(&self, message: UpdateMessage) {
        let UpdateMessage::Update { entity, id, field, update } = message;
        let cell = {
            let entries = self.0.entries.lock().expect("entries lock poisoned");
            entries.get(&(entity.clone(), id.clone())).map(|entry| entry.cell.clone())
        };
        match cell {
            Some(cell) => cell.update_field(&field, update),
            None => debug!("muxer: dropping update for unknown entity {entity}/{id}"),
        }
    }

    /// Tear down the pair entirely: sends `unsubscribe *` and removes the
    /// local entry. Further updates for the pair are dropped until a new
    /// `get_or_create`.
    pub fn unsubscribe_all(&self, entity: &EntityName, id: &EntityId) {
        let removed = {
            let mut entries = self.0.entries.lock().expect("entries lock poisoned");
            entries.remove(&(entity.clone(), id.clone()))
        };
        if let Some(entry) = removed {
            if let Some(transport) = self.transport() {
                transport
                    .send_message(ClientMessage::Unsubscribe { entity: entity.clone(), id: id.clone(), fields: FieldSelection::All });
            }
            entry.cell.dispose();
        }
    }

    /// Remove the local entry without any transport traffic. Used when
    /// rolling back an optimistic create that the server never saw.
    pub fn remove_local(&self, entity: &EntityName, id: &EntityId) {
        let removed = {
            let mut entries = self.0.entries.lock().expect("entries lock poisoned");
            entries.remove(&(entity.clone(), id.clone()))
        };
        if let Some(entry) = removed {
            entry.cell.dispose();
        }
    }

    /// Snapshot of the currently subscribed fields for the pair. Transports
    /// use this to replay subscribe intents after a reconnect.
    pub fn subscribed_fields(&self, entity: &EntityName, id: &EntityId) -> Option<FieldSelection> {
        let entries = self.0.entries.lock().expect("entries lock poisoned");
        let entry = entries.get(&(entity.clone(), id.clone()))?;
        if entry.entity_refs > 0 {
            Some(FieldSelection::All)
        } else {
            let fields: Vec<FieldName> =
                entry.field_refs.iter().filter(|(_, refs)| **refs > 0).map(|(field, _)| field.clone()).collect();
            if fields.is_empty() { None } else { Some(FieldSelection::Fields(fields)) }
        }
    }

    /// Current ref-count for one field, for diagnostics and tests.
    pub fn field_ref_count(&self, entity: &EntityName, id: &EntityId, field: &str) -> usize {
        let entries = self.0.entries.lock().expect("entries lock poisoned");
        entries
            .get(&(entity.clone(), id.clone()))
            .and_then(|entry| entry.field_refs.get(field).copied())
            .unwrap_or(0)
    }

    pub fn entity_ref_count(&self, entity: &EntityName, id: &EntityId) -> usize {
        let entries = self.0.entries.lock().expect("entries lock poisoned");
        entries.get(&(entity.clone(), id.clone())).map(|entry| entry.entity_refs).unwrap_or(0)
    }

    pub fn has_pending_intents(&self, entity: &EntityName, id: &EntityId) -> bool {
        let entries = self.0.entries.lock().expect("entries lock poisoned");
        entries.get(&(entity.clone(), id.clone())).map(|entry| entry.has_pending()).unwrap_or(false)
    }

    /// Install the transport and flush any intents that accumulated while
    /// there was none.
    pub fn set_transport(&self, transport: Arc<dyn SubscriptionSender>) {
        *self.0.transport.write().expect("transport lock poisoned") = Some(transport);
        self.flush();
    }

    fn transport(&self) -> Option<Arc<dyn SubscriptionSender>> {
        self.0.transport.read().expect("transport lock poisoned").clone()
    }

    /// Dispose every entity cell and stop sending. Idempotent.
    pub fn destroy(&self) {
        if self.0.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries: Vec<EntityEntry> = {
            let mut map = self.0.entries.lock().expect("entries lock poisoned");
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.cell.dispose();
        }
        *self.0.transport.write().expect("transport lock poisoned") = None;
    }

    fn schedule_flush(&self) {
        if self.0.destroyed.load(Ordering::Acquire) {
            return;
        }
        if self.0.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.0);
        crate::task::spawn(async move {
            tokio::time::sleep(FLUSH_WINDOW).await;
            if let Some(inner) = weak.upgrade() {
                SubscriptionMultiplexer(inner).flush();
            }
        });
    }

    /// Drain pending intents into at most one subscribe and one unsubscribe
    /// message per (entity, id). With no transport, intents stay queued.
    fn flush(&self) {
        self.0.flush_scheduled.store(false, Ordering::Release);

        let Some(transport) = self.transport() else {
            return;
        };

        let messages: Vec<ClientMessage> = {
            let mut entries = self.0.entries.lock().expect("entries lock poisoned");
            let mut messages = Vec::new();
            for ((entity, id), entry) in entries.iter_mut() {
                if !entry.has_pending() {
                    continue;
                }
                if entry.pending_subscribe_all {
                    entry.pending_subscribe_all = false;
                    messages.push(ClientMessage::Subscribe { entity: entity.clone(), id: id.clone(), fields: FieldSelection::All });
                }
                if !entry.pending_subscribe.is_empty() {
                    let fields: Vec<FieldName> = std::mem::take(&mut entry.pending_subscribe).into_iter().collect();
                    messages.push(ClientMessage::Subscribe {
                        entity: entity.clone(),
                        id: id.clone(),
                        fields: FieldSelection::Fields(fields),
                    });
                }
                if entry.pending_unsubscribe_all {
                    entry.pending_unsubscribe_all = false;
                    messages
                        .push(ClientMessage::Unsubscribe { entity: entity.clone(), id: id.clone(), fields: FieldSelection::All });
                }
                if !entry.pending_unsubscribe.is_empty() {
                    let fields: Vec<FieldName> = std::mem::take(&mut entry.pending_unsubscribe).into_iter().collect();
                    messages.push(ClientMessage::Unsubscribe {
                        entity: entity.clone(),
                        id: id.clone(),
                        fields: FieldSelection::Fields(fields),
                    });
                }
            }
            messages
        };
        // Lock released before touching the transport

        for message in messages {
            debug!("muxer: {message}");
            transport.send_message(message);
        }
    }
}

impl Default for SubscriptionMultiplexer {
    fn default() -> Self { Self::new() }
}
