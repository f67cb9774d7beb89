use prism_proto::{EntityId, EntityName, ErrorValue, FieldName, FieldUpdate, Record};
use prism_signals::{batch, Calculated, Get, Mut, Peek};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use tracing::{debug, error, warn};

use crate::delta::apply_delta;

/// Called on the first read of each field, once per field per entity lifetime.
/// This is what makes lazy per-field subscription possible.
pub type FieldAccessCallback = Arc<dyn Fn(&FieldName) + Send + Sync>;
pub type DisposeCallback = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    entity: EntityName,
    id: EntityId,
    /// One reactive cell per field; reads of a field depend only on its cell
    fields: RwLock<BTreeMap<FieldName, Mut<Option<Value>>>>,
    /// Advances whenever the field set changes, forcing the aggregate to
    /// recompute its keyset
    structure: Mut<u64>,
    /// Plain-record view over the present fields
    aggregate: OnceLock<Calculated<Record>>,
    loading: Mut<bool>,
    error: Mut<Option<ErrorValue>>,
    /// Fields whose first access has already been reported
    accessed: Mutex<HashSet<FieldName>>,
    disposed: AtomicBool,
    on_field_access: FieldAccessCallback,
    on_dispose: DisposeCallback,
}

/// A reactive record keyed by `(entity name, entity id)`. Every field is an
/// independent signal; the aggregate value is a computed signal over the
/// structural version and all present fields.
///
/// Writes go through the narrow API here — the multiplexer applying server
/// updates and the optimistic engine applying speculative ones both mutate
/// entities only through these methods.
#[derive(Clone)]
pub struct EntityCell(Arc<Inner>);

impl EntityCell {
    pub fn new(
        entity: EntityName,
        id: EntityId,
        initial: Record,
        on_field_access: FieldAccessCallback,
        on_dispose: DisposeCallback,
    ) -> Self {
        let fields = initial.into_iter().map(|(name, value)| (name, Mut::new(Some(value)))).collect();

        let cell = Self(Arc::new(Inner {
            entity,
            id,
            fields: RwLock::new(fields),
            structure: Mut::new(0),
            aggregate: OnceLock::new(),
            loading: Mut::new(false),
            error: Mut::new(None),
            accessed: Mutex::new(HashSet::new()),
            disposed: AtomicBool::new(false),
            on_field_access,
            on_dispose,
        }));

        let weak = Arc::downgrade(&cell.0);
        let aggregate = Calculated::new(move || aggregate_snapshot(&weak));
        cell.0.aggregate.set(aggregate).unwrap_or_else(|_| unreachable!("aggregate initialized twice"));

        cell
    }

    pub fn entity(&self) -> &EntityName { &self.0.entity }
    pub fn id(&self) -> &EntityId { &self.0.id }

    /// Whether two handles share the same underlying cell.
    pub fn ptr_eq(&self, other: &EntityCell) -> bool { Arc::ptr_eq(&self.0, &other.0) }

    pub fn is_disposed(&self) -> bool { self.0.disposed.load(Ordering::Acquire) }

    /// Current structural version (untracked).
    pub fn structural_version(&self) -> u64 { self.0.structure.peek() }

    /// Read one field, recording a dependency on its cell for the current
    /// observer frame. The first read of each known field fires the
    /// field-access callback exactly once per entity lifetime.
    pub fn read(&self, field: &str) -> Option<Value> { self.read_inner(field, true) }

    /// Read without firing the access callback. Derived views read through
    /// their source with this, so deriving never creates new subscriptions.
    pub(crate) fn read_quiet(&self, field: &str) -> Option<Value> { self.read_inner(field, false) }

    fn read_inner(&self, field: &str, notify_access: bool) -> Option<Value> {
        let cell = {
            let fields = self.0.fields.read().expect("fields lock poisoned");
            fields.get(field).cloned()
        };

        match cell {
            Some(cell) => {
                if notify_access {
                    self.note_access(field);
                }
                cell.read().get()
            }
            None => {
                // Track the structural version so a dependent re-runs if the
                // field appears later
                let _ = self.0.structure.read().get();
                None
            }
        }
    }

    /// Read one field without recording any dependency.
    pub fn peek_field(&self, field: &str) -> Option<Value> {
        let fields = self.0.fields.read().expect("fields lock poisoned");
        fields.get(field).and_then(|cell| cell.peek())
    }

    fn note_access(&self, field: &str) {
        if self.is_disposed() {
            return;
        }
        let first = self.0.accessed.lock().expect("accessed lock poisoned").insert(field.to_owned());
        if first {
            (self.0.on_field_access)(&field.to_owned());
        }
    }

    /// Set one field, creating it if absent (a structural change).
    pub fn set_field(&self, field: &str, value: Value) {
        if self.is_disposed() {
            debug!("entity {}/{}: dropping write to {field} after dispose", self.0.entity, self.0.id);
            return;
        }

        let (cell, created) = {
            let mut fields = self.0.fields.write().expect("fields lock poisoned");
            match fields.get(field) {
                Some(cell) => (cell.clone(), false),
                None => {
                    let cell = Mut::new(None);
                    fields.insert(field.to_owned(), cell.clone());
                    (cell, true)
                }
            }
        };
        // Lock released before notifying: listeners may read other fields

        batch(|| {
            cell.set_if_changed(Some(value));
            if created {
                self.bump_structure();
            }
        });
    }

    /// Set several fields at once; dependents are notified once per batch.
    pub fn set_fields(&self, partial: Record) {
        if self.is_disposed() {
            return;
        }
        batch(|| {
            for (field, value) in partial {
                self.set_field(&field, value);
            }
        });
    }

    /// Make the entity's fields exactly `snapshot`: fields not present in the
    /// snapshot are removed. This is the restore path for optimistic rollback.
    pub fn replace_fields(&self, snapshot: Record) {
        if self.is_disposed() {
            return;
        }
        let extra: Vec<FieldName> = {
            let fields = self.0.fields.read().expect("fields lock poisoned");
            fields.keys().filter(|name| !snapshot.contains_key(*name)).cloned().collect()
        };
        batch(|| {
            for field in extra {
                self.remove_field(&field);
            }
            self.set_fields(snapshot);
        });
    }

    /// Apply a per-field update from the wire. Delta updates only apply to
    /// string-typed fields; anything else is a logged error that leaves the
    /// field unchanged — the transport input loop must never be interrupted.
    pub fn update_field(&self, field: &str, update: FieldUpdate) {
        match update {
            FieldUpdate::Value { data } => self.set_field(field, data),
            FieldUpdate::Delta { data: ops } => {
                let current = self.peek_field(field);
                match current {
                    Some(Value::String(text)) => {
                        let updated = apply_delta(&text, &ops);
                        self.set_field(field, Value::String(updated));
                    }
                    Some(_) => {
                        error!("entity {}/{}: delta update on non-string field {field}", self.0.entity, self.0.id);
                    }
                    None => {
                        // Delta against an absent field starts from empty
                        let updated = apply_delta("", &ops);
                        self.set_field(field, Value::String(updated));
                    }
                }
            }
        }
    }

    /// Add a field explicitly (structural change). No-op if present.
    pub fn add_field(&self, field: &str, value: Value) {
        if self.is_disposed() {
            return;
        }
        let exists = self.0.fields.read().expect("fields lock poisoned").contains_key(field);
        if exists {
            warn!("entity {}/{}: add_field on existing field {field}", self.0.entity, self.0.id);
            return;
        }
        self.set_field(field, value);
    }

    /// Remove a field (structural change). No-op if absent.
    pub fn remove_field(&self, field: &str) {
        if self.is_disposed() {
            return;
        }
        let removed = {
            let mut fields = self.0.fields.write().expect("fields lock poisoned");
            fields.remove(field)
        };
        if let Some(cell) = removed {
            batch(|| {
                // Notify readers of the removed field, then the keyset change
                cell.set(None);
                self.bump_structure();
            });
        }
    }

    fn bump_structure(&self) {
        let next = self.0.structure.peek() + 1;
        self.0.structure.set(next);
    }

    /// The aggregate record of all present fields, tracked as one dependency.
    pub fn value(&self) -> Record { self.aggregate().get() }

    /// The aggregate record without recording a dependency.
    pub fn peek_value(&self) -> Record { self.aggregate().peek() }

    pub(crate) fn aggregate(&self) -> &Calculated<Record> {
        self.0.aggregate.get().expect("aggregate initialized in new")
    }

    /// Names of all currently present fields.
    pub fn field_names(&self) -> Vec<FieldName> {
        self.0.fields.read().expect("fields lock poisoned").keys().cloned().collect()
    }

    pub fn loading(&self) -> bool { self.0.loading.read().get() }
    pub fn set_loading(&self, loading: bool) {
        if !self.is_disposed() {
            self.0.loading.set_if_changed(loading);
        }
    }

    pub fn error(&self) -> Option<ErrorValue> { self.0.error.read().get() }
    pub fn set_error(&self, error: Option<ErrorValue>) {
        if !self.is_disposed() {
            self.0.error.set(error);
        }
    }

    /// Idempotent. Later writes are silent no-ops; the aggregate keeps its
    /// last committed snapshot.
    pub fn dispose(&self) {
        if self.0.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("entity {}/{}: disposed", self.0.entity, self.0.id);
        (self.0.on_dispose)();
    }

    /// A derived view restricted to `fields`, reading through this cell
    /// without creating subscriptions.
    pub fn derive(&self, fields: Vec<FieldName>) -> DerivedEntity { DerivedEntity::new(self.clone(), fields) }
}

fn aggregate_snapshot(weak: &Weak<Inner>) -> Record {
    let Some(inner) = weak.upgrade() else {
        return Record::new();
    };

    // Depend on the keyset via the structural version, then on each field
    let _ = inner.structure.read().get();
    let field_cells: Vec<(FieldName, Mut<Option<Value>>)> = {
        let fields = inner.fields.read().expect("fields lock poisoned");
        fields.iter().map(|(name, cell)| (name.clone(), cell.clone())).collect()
    };

    let mut record = Record::new();
    for (name, cell) in field_cells {
        if let Some(value) = cell.read().get() {
            record.insert(name, value);
        }
    }
    record
}

impl std::fmt::Debug for EntityCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntityCell({}/{})", self.0.entity, self.0.id)
    }
}

struct DerivedInner {
    source: EntityCell,
    fields: Vec<FieldName>,
    aggregate: OnceLock<Calculated<Record>>,
}

/// A secondary entity view whose fields read through another cell, created
/// without a new fetch or subscription.
#[derive(Clone)]
pub struct DerivedEntity(Arc<DerivedInner>);

impl DerivedEntity {
    fn new(source: EntityCell, fields: Vec<FieldName>) -> Self {
        let view = Self(Arc::new(DerivedInner { source, fields, aggregate: OnceLock::new() }));

        let weak = Arc::downgrade(&view.0);
        let aggregate = Calculated::new(move || {
            let Some(inner) = weak.upgrade() else {
                return Record::new();
            };
            let mut record = Record::new();
            for field in &inner.fields {
                if let Some(value) = inner.source.read_quiet(field) {
                    record.insert(field.clone(), value);
                }
            }
            record
        });
        view.0.aggregate.set(aggregate).unwrap_or_else(|_| unreachable!("aggregate initialized twice"));

        view
    }

    pub fn entity(&self) -> &EntityName { self.0.source.entity() }
    pub fn id(&self) -> &EntityId { self.0.source.id() }
    pub fn source(&self) -> &EntityCell { &self.0.source }
    pub fn fields(&self) -> &[FieldName] { &self.0.fields }

    /// Read one selected field through the source. Fields outside the
    /// selection read as absent.
    pub fn read(&self, field: &str) -> Option<Value> {
        if !self.0.fields.iter().any(|f| f == field) {
            return None;
        }
        self.0.source.read_quiet(field)
    }

    pub fn value(&self) -> Record { self.0.aggregate.get().expect("aggregate initialized in new").get() }
}

impl std::fmt::Debug for DerivedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DerivedEntity({}/{} {:?})", self.0.source.0.entity, self.0.source.0.id, self.0.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn test_cell(initial: Record) -> (EntityCell, Arc<Mutex<Vec<FieldName>>>) {
        let accesses = Arc::new(Mutex::new(Vec::new()));
        let cell = EntityCell::new(
            "User".into(),
            "u1".into(),
            initial,
            {
                let accesses = accesses.clone();
                Arc::new(move |field: &FieldName| accesses.lock().unwrap().push(field.clone()))
            },
            Arc::new(|| {}),
        );
        (cell, accesses)
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn field_access_fires_once_per_field() {
        let (cell, accesses) = test_cell(record(&[("name", json!("J")), ("bio", json!("H"))]));

        assert_eq!(cell.read("name"), Some(json!("J")));
        assert_eq!(cell.read("name"), Some(json!("J")));
        assert_eq!(cell.read("bio"), Some(json!("H")));

        assert_eq!(accesses.lock().unwrap().as_slice(), &["name".to_string(), "bio".to_string()]);
    }

    #[test]
    fn aggregate_tracks_structural_changes() {
        let (cell, _) = test_cell(record(&[("name", json!("J"))]));
        assert_eq!(cell.value(), record(&[("name", json!("J"))]));
        let v0 = cell.structural_version();

        cell.set_field("email", json!("j@e"));
        assert_eq!(cell.structural_version(), v0 + 1);
        assert_eq!(cell.value(), record(&[("name", json!("J")), ("email", json!("j@e"))]));

        cell.remove_field("name");
        assert_eq!(cell.structural_version(), v0 + 2);
        assert_eq!(cell.value(), record(&[("email", json!("j@e"))]));
    }

    #[test]
    fn aggregate_recomputes_on_field_write() {
        let (cell, _) = test_cell(record(&[("name", json!("A"))]));
        let computed = Arc::new(AtomicUsize::new(0));

        let watched = Calculated::new({
            let cell = cell.clone();
            let computed = computed.clone();
            move || {
                computed.fetch_add(1, Ordering::SeqCst);
                cell.value()
            }
        });

        assert_eq!(watched.get().get("name"), Some(&json!("A")));
        cell.set_field("name", json!("B"));
        assert_eq!(watched.get().get("name"), Some(&json!("B")));
    }

    #[test]
    fn equal_writes_are_elided() {
        let (cell, _) = test_cell(record(&[("name", json!("A"))]));
        let runs = Arc::new(AtomicUsize::new(0));

        let _effect = prism_signals::Effect::new({
            let cell = cell.clone();
            let runs = runs.clone();
            move || {
                let _ = cell.read("name");
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        cell.set_field("name", json!("A")); // deep-equal: elided
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        cell.set_field("name", json!("B"));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn delta_updates_splice_strings() {
        let (cell, _) = test_cell(record(&[("content", json!("Hello"))]));

        cell.update_field(
            "content",
            FieldUpdate::Delta { data: vec![prism_proto::DeltaOp { position: 5, insert: Some(" World".into()), delete: 0 }] },
        );
        assert_eq!(cell.peek_field("content"), Some(json!("Hello World")));

        cell.update_field(
            "content",
            FieldUpdate::Delta { data: vec![prism_proto::DeltaOp { position: 11, insert: Some("!".into()), delete: 0 }] },
        );
        assert_eq!(cell.peek_field("content"), Some(json!("Hello World!")));
    }

    #[test]
    fn delta_on_non_string_field_is_ignored() {
        let (cell, _) = test_cell(record(&[("count", json!(5))]));
        cell.update_field(
            "count",
            FieldUpdate::Delta { data: vec![prism_proto::DeltaOp { position: 0, insert: Some("x".into()), delete: 0 }] },
        );
        assert_eq!(cell.peek_field("count"), Some(json!(5)));
    }

    #[test]
    fn dispose_drops_writes_and_is_idempotent() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let cell = EntityCell::new("User".into(), "u1".into(), record(&[("name", json!("A"))]), Arc::new(|_: &FieldName| {}), {
            let disposed = disposed.clone();
            Arc::new(move || {
                disposed.fetch_add(1, Ordering::SeqCst);
            })
        });

        cell.dispose();
        cell.dispose();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);

        cell.set_field("name", json!("B"));
        assert_eq!(cell.peek_field("name"), Some(json!("A")));
        assert_eq!(cell.peek_value(), record(&[("name", json!("A"))]));
    }

    #[test]
    fn replace_fields_removes_extras() {
        let (cell, _) = test_cell(record(&[("name", json!("A"))]));
        cell.set_fields(record(&[("name", json!("B")), ("extra", json!(1))]));

        cell.replace_fields(record(&[("name", json!("A"))]));
        assert_eq!(cell.peek_value(), record(&[("name", json!("A"))]));
    }

    #[test]
    fn derived_view_reads_through_without_access_callbacks() {
        let (cell, accesses) = test_cell(record(&[("name", json!("J")), ("bio", json!("H"))]));
        let view = cell.derive(vec!["name".to_string()]);

        assert_eq!(view.read("name"), Some(json!("J")));
        assert_eq!(view.read("bio"), None); // outside the selection
        assert_eq!(view.value(), record(&[("name", json!("J"))]));
        assert!(accesses.lock().unwrap().is_empty());

        cell.set_field("name", json!("K"));
        assert_eq!(view.value(), record(&[("name", json!("K"))]));
    }
}
