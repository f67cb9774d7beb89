use prism_proto::{EntityId, EntityName, Record};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::muxer::SubscriptionMultiplexer;

/// Field installed as a tombstone by optimistic deletes.
pub const DELETED_FIELD: &str = "__deleted";

/// Configuration for the optimistic engine.
#[derive(Debug, Clone)]
pub struct OptimisticConfig {
    pub enabled: bool,
    /// Entries the server never answers are rolled back after this long.
    pub timeout: Duration,
}

impl Default for OptimisticConfig {
    fn default() -> Self { Self { enabled: true, timeout: Duration::from_secs(30) } }
}

/// Opaque identifier of one speculative write; monotonic per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptimisticId(u64);

impl std::fmt::Display for OptimisticId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "opt{}", self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn operation(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

struct Entry {
    entity: EntityName,
    id: EntityId,
    kind: MutationKind,
    /// Aggregate value at apply time; `None` when the entity did not exist.
    /// A rollback restores exactly this, nothing newer.
    snapshot: Option<Record>,
}

struct Inner {
    muxer: SubscriptionMultiplexer,
    entries: Mutex<HashMap<OptimisticId, Entry>>,
    /// Secondary index answering "has pending update?" per (entity, id)
    by_target: Mutex<HashMap<(EntityName, EntityId), HashSet<OptimisticId>>>,
    next_id: AtomicU64,
    config: OptimisticConfig,
}

/// Applies, confirms, or rolls back speculative writes against the entity
/// cells owned by the multiplexer.
///
/// Entries move `pending → confirmed` or `pending → rolled-back` and nothing
/// else; a terminal entry is removed from the map, so repeating either
/// transition is a no-op.
///
/// When several entries stack on one entity, each snapshot reflects the state
/// at its own apply time: a rollback restores up to its own snapshot only,
/// and later confirmed effects persist. Callers needing strict ordering
/// across overlapping updates serialize their mutations.
#[derive(Clone)]
pub struct OptimisticEngine(Arc<Inner>);

impl OptimisticEngine {
    pub fn new(muxer: SubscriptionMultiplexer, config: OptimisticConfig) -> Self {
        Self(Arc::new(Inner {
            muxer,
            entries: Mutex::new(HashMap::new()),
            by_target: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }))
    }

    pub fn enabled(&self) -> bool { self.0.config.enabled }

    /// Install `data` speculatively and record enough to undo it. Returns
    /// `None` when optimistic updates are disabled.
    pub fn apply(&self, entity: &EntityName, id: &EntityId, kind: MutationKind, data: Record) -> Option<OptimisticId> {
        if !self.0.config.enabled {
            return None;
        }

        let opt_id = OptimisticId(self.0.next_id.fetch_add(1, Ordering::Relaxed));
        let snapshot = self.0.muxer.cell(entity, id).map(|cell| cell.peek_value());

        let cell = self.0.muxer.get_or_create(entity, id, Record::new());
        match kind {
            // Update merges over the snapshot so untouched fields remain
            MutationKind::Create | MutationKind::Update => cell.set_fields(data),
            MutationKind::Delete => cell.set_field(DELETED_FIELD, Value::Bool(true)),
        }

        debug!("optimistic: {opt_id} {} on {entity}/{id}", kind.operation());
        self.0.entries.lock().expect("entries lock poisoned").insert(
            opt_id,
            Entry { entity: entity.clone(), id: id.clone(), kind, snapshot },
        );
        self.0
            .by_target
            .lock()
            .expect("index lock poisoned")
            .entry((entity.clone(), id.clone()))
            .or_default()
            .insert(opt_id);

        self.arm_timeout(opt_id);
        Some(opt_id)
    }

    /// Server accepted the mutation. With server data for a non-delete, the
    /// authoritative values are installed. No-op for terminal entries.
    pub fn confirm(&self, opt_id: OptimisticId, server_data: Option<Record>) {
        let Some(entry) = self.take(opt_id) else {
            return;
        };

        if entry.kind != MutationKind::Delete {
            if let Some(data) = server_data {
                if let Some(cell) = self.0.muxer.cell(&entry.entity, &entry.id) {
                    cell.set_fields(data);
                } else {
                    error!("optimistic: pending entry {opt_id} lost its cell before confirm");
                }
            }
        }
        debug!("optimistic: {opt_id} confirmed");
    }

    /// Server rejected the mutation (or it timed out): restore the snapshot
    /// taken at apply time. No-op for terminal entries.
    pub fn rollback(&self, opt_id: OptimisticId) {
        let Some(entry) = self.take(opt_id) else {
            return;
        };

        match entry.snapshot {
            Some(snapshot) => match self.0.muxer.cell(&entry.entity, &entry.id) {
                Some(cell) => cell.replace_fields(snapshot),
                None => error!("optimistic: pending entry {opt_id} lost its cell before rollback"),
            },
            // The entity did not exist before this entry; remove it again
            None => self.0.muxer.remove_local(&entry.entity, &entry.id),
        }
        debug!("optimistic: {opt_id} rolled back");
    }

    /// Whether any speculative write is pending for the pair.
    pub fn has_pending(&self, entity: &EntityName, id: &EntityId) -> bool {
        self.0
            .by_target
            .lock()
            .expect("index lock poisoned")
            .get(&(entity.clone(), id.clone()))
            .is_some_and(|set| !set.is_empty())
    }

    pub fn pending_count(&self) -> usize { self.0.entries.lock().expect("entries lock poisoned").len() }

    fn take(&self, opt_id: OptimisticId) -> Option<Entry> {
        let entry = self.0.entries.lock().expect("entries lock poisoned").remove(&opt_id)?;
        let mut by_target = self.0.by_target.lock().expect("index lock poisoned");
        if let Some(set) = by_target.get_mut(&(entry.entity.clone(), entry.id.clone())) {
            set.remove(&opt_id);
            if set.is_empty() {
                by_target.remove(&(entry.entity.clone(), entry.id.clone()));
            }
        }
        Some(entry)
    }

    fn arm_timeout(&self, opt_id: OptimisticId) {
        let weak: Weak<Inner> = Arc::downgrade(&self.0);
        let timeout = self.0.config.timeout;
        crate::task::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                let engine = OptimisticEngine(inner);
                let still_pending = engine.0.entries.lock().expect("entries lock poisoned").contains_key(&opt_id);
                if still_pending {
                    warn!("optimistic: {opt_id} unresolved after {timeout:?}, rolling back");
                    engine.rollback(opt_id);
                }
            }
        });
    }
}
