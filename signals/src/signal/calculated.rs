use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::{
    broadcast::{Broadcast, BroadcastId},
    context::CurrentObserver,
    observer::Observer,
    porcelain::{IntoSubscribeListener, Subscribe, SubscriptionGuard},
    signal::{Get, Listener, ListenerGuard, Peek, Signal, With},
    value::ValueCell,
};

struct SubscriptionEntry {
    _guard: ListenerGuard,
    marked_for_removal: bool,
}

struct Inner<T> {
    /// The compute function
    compute: Box<dyn Fn() -> T + Send + Sync>,
    /// Cached computed value
    value: ValueCell<Option<T>>,
    /// Set when an upstream dependency changed; cleared by recompute
    dirty: AtomicBool,
    /// Guards against re-entrant recomputation (dependency cycles)
    computing: AtomicBool,
    revision: AtomicU64,
    /// Broadcast for notifying downstream observers
    broadcast: Broadcast,
    /// Subscriptions to upstream signals, mapped by broadcast id for
    /// mark-and-sweep
    entries: RwLock<HashMap<BroadcastId, SubscriptionEntry>>,
}

/// A calculated signal that derives its value from other signals.
///
/// The signals accessed during computation are tracked automatically. When any
/// of them changes, the cached value is marked stale and downstream observers
/// are notified; the recomputation itself happens lazily on the next read, so
/// a burst of upstream writes costs one recompute.
///
/// Cloning shares the same cached value and upstream subscriptions.
pub struct Calculated<T>(Arc<Inner<T>>);

impl<T> Clone for Calculated<T> {
    fn clone(&self) -> Self { Self(Arc::clone(&self.0)) }
}

impl<T: Send + Sync + 'static> Calculated<T> {
    /// Create a calculated signal. The compute function runs immediately to
    /// establish subscriptions and the initial value.
    pub fn new<F>(compute: F) -> Self
    where F: Fn() -> T + Send + Sync + 'static {
        let inner = Arc::new(Inner {
            compute: Box::new(compute),
            value: ValueCell::new(None),
            dirty: AtomicBool::new(false),
            computing: AtomicBool::new(false),
            revision: AtomicU64::new(0),
            broadcast: Broadcast::new(),
            entries: RwLock::new(HashMap::new()),
        });

        recompute(&inner);

        Self(inner)
    }

    /// Monotonic recompute counter.
    pub fn revision(&self) -> u64 { self.0.revision.load(Ordering::Relaxed) }

    fn refresh(&self) {
        if self.0.dirty.load(Ordering::Acquire) {
            recompute(&self.0);
        }
    }
}

/// Recompute with dependency tracking. Runs under the cell's own observer
/// frame; does not broadcast (invalidation already did).
fn recompute<T: Send + Sync + 'static>(inner: &Arc<Inner<T>>) {
    if inner.computing.swap(true, Ordering::AcqRel) {
        panic!("cyclic dependency: calculated signal read during its own computation");
    }

    // Mark-and-sweep: mark all existing subscriptions for removal
    {
        let mut entries = inner.entries.write().expect("entries lock poisoned");
        for entry in entries.values_mut() {
            entry.marked_for_removal = true;
        }
    }

    CurrentObserver::set(Arc::clone(inner));
    let new_value = (inner.compute)();
    inner.value.set(Some(new_value));
    CurrentObserver::remove(inner);

    // Sweep away any subscriptions that weren't accessed during compute
    {
        let mut entries = inner.entries.write().expect("entries lock poisoned");
        entries.retain(|_, entry| !entry.marked_for_removal);
    }

    inner.revision.fetch_add(1, Ordering::Relaxed);
    inner.dirty.store(false, Ordering::Release);
    inner.computing.store(false, Ordering::Release);
}

/// Mark stale and notify downstream, once per dirtying.
fn invalidate<T: Send + Sync + 'static>(inner: &Arc<Inner<T>>) {
    if !inner.dirty.swap(true, Ordering::AcqRel) {
        inner.broadcast.send(());
    }
}

impl<T: Clone + Send + Sync + 'static> Get<T> for Calculated<T> {
    fn get(&self) -> T {
        CurrentObserver::track(self);
        self.refresh();
        self.0.value.with(|opt| opt.as_ref().expect("calculated value not initialized").clone())
    }
}

impl<T: Clone + Send + Sync + 'static> Peek<T> for Calculated<T> {
    fn peek(&self) -> T {
        self.refresh();
        self.0.value.with(|opt| opt.as_ref().expect("calculated value not initialized").clone())
    }
}

impl<T: Send + Sync + 'static> With<T> for Calculated<T> {
    fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        CurrentObserver::track(self);
        self.refresh();
        self.0.value.with(|opt| f(opt.as_ref().expect("calculated value not initialized")))
    }
}

impl<T> Signal for Calculated<T> {
    fn listen(&self, listener: Listener) -> ListenerGuard {
        ListenerGuard::new(self.0.broadcast.reference().listen(move |_| listener(())))
    }

    fn broadcast_id(&self) -> BroadcastId { self.0.broadcast.id() }
}

impl<T: Send + Sync + 'static> Observer for Arc<Inner<T>> {
    fn observe(&self, signal: &dyn Signal) {
        let broadcast_id = signal.broadcast_id();

        // Already subscribed to this signal: just unmark it
        {
            let mut entries = self.entries.write().expect("entries lock poisoned");
            if let Some(entry) = entries.get_mut(&broadcast_id) {
                entry.marked_for_removal = false;
                return;
            }
        }
        // Lock released before calling listen() to avoid recursive locking

        let weak = Arc::downgrade(self);
        let guard = signal.listen(Arc::new(move |_| {
            if let Some(inner) = weak.upgrade() {
                invalidate(&inner);
            }
        }));

        let mut entries = self.entries.write().expect("entries lock poisoned");
        entries.insert(broadcast_id, SubscriptionEntry { _guard: guard, marked_for_removal: false });
    }

    fn observer_id(&self) -> usize { Arc::as_ptr(self) as usize }
}

impl<T> Subscribe<T> for Calculated<T>
where T: Clone + Send + Sync + 'static
{
    fn subscribe<F>(&self, listener: F) -> SubscriptionGuard
    where F: IntoSubscribeListener<T> {
        let listener = listener.into_subscribe_listener();
        // Weak so the listener stored on our own broadcast doesn't keep the
        // cell alive.
        let weak = Arc::downgrade(&self.0);
        let guard = Signal::listen(
            self,
            Arc::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    if inner.dirty.load(Ordering::Acquire) {
                        recompute(&inner);
                    }
                    let current = inner.value.with(|opt| opt.as_ref().expect("calculated value not initialized").clone());
                    listener(current);
                }
            }),
        );
        SubscriptionGuard::new(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Mut;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn basic_calculated() {
        let a = Mut::new(1);
        let b = Mut::new(2);

        let sum = Calculated::new({
            let a = a.read();
            let b = b.read();
            move || a.get() + b.get()
        });

        assert_eq!(sum.get(), 3);

        a.set(10);
        assert_eq!(sum.get(), 12);

        b.set(5);
        assert_eq!(sum.get(), 15);
    }

    #[test]
    fn recompute_is_lazy() {
        let source = Mut::new(1);
        let count = Arc::new(AtomicUsize::new(0));

        let doubled = Calculated::new({
            let source = source.read();
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
                source.get() * 2
            }
        });

        assert_eq!(count.load(Ordering::SeqCst), 1); // initial compute

        // Three writes, no reads: no recompute yet
        source.set(2);
        source.set(3);
        source.set(4);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert_eq!(doubled.get(), 8);
        assert_eq!(count.load(Ordering::SeqCst), 2); // one recompute for the burst
    }

    #[test]
    fn chained_calculated() {
        let base = Mut::new(2);

        let doubled = Calculated::new({
            let base = base.read();
            move || base.get() * 2
        });

        let quadrupled = Calculated::new(move || doubled.get() * 2);

        assert_eq!(quadrupled.get(), 8);

        base.set(5);
        assert_eq!(quadrupled.get(), 20);
    }

    #[test]
    fn downstream_subscription_sees_fresh_value() {
        let source = Mut::new(5);
        let doubled = Calculated::new({
            let source = source.read();
            move || source.get() * 2
        });

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let _guard = doubled.subscribe({
            let seen = seen.clone();
            move |value: i32| seen.lock().unwrap().push(value)
        });

        source.set(10);
        assert_eq!(seen.lock().unwrap().as_slice(), &[20]);
    }

    #[test]
    fn dependency_sweep_drops_unread_signals() {
        let gate = Mut::new(true);
        let a = Mut::new(1);
        let b = Mut::new(100);
        let count = Arc::new(AtomicUsize::new(0));

        let picked = Calculated::new({
            let gate = gate.read();
            let a = a.read();
            let b = b.read();
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
                if gate.get() { a.get() } else { b.get() }
            }
        });

        assert_eq!(picked.get(), 1);
        gate.set(false);
        assert_eq!(picked.get(), 100);
        let computes = count.load(Ordering::SeqCst);

        // `a` is no longer a dependency; writing it must not dirty the cell
        a.set(2);
        assert_eq!(picked.get(), 100);
        assert_eq!(count.load(Ordering::SeqCst), computes);

        b.set(200);
        assert_eq!(picked.get(), 200);
    }

    #[test]
    #[should_panic(expected = "cyclic dependency")]
    fn cycle_detection() {
        let trigger = Mut::new(0);
        let cell: Arc<std::sync::Mutex<Option<Calculated<i32>>>> = Arc::new(std::sync::Mutex::new(None));

        let cycle = Calculated::new({
            let trigger = trigger.read();
            let cell = cell.clone();
            move || {
                let upstream = trigger.get();
                // On the second compute, read ourselves
                if let Some(me) = cell.lock().unwrap().as_ref() { upstream + me.get() } else { upstream }
            }
        });
        *cell.lock().unwrap() = Some(cycle.clone());

        trigger.set(1);
        let _ = cycle.get(); // re-entrant read panics
    }
}
