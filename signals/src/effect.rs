use crate::{
    CurrentObserver,
    broadcast::BroadcastId,
    observer::Observer,
    signal::{ListenerGuard, Signal},
};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock, Weak};

struct SubscriptionEntry {
    _guard: ListenerGuard,
    marked_for_removal: bool,
}

struct Inner {
    callback: Box<dyn Fn() + Send + Sync>,
    // Subscriptions mapped by broadcast id for mark-and-sweep
    entries: RwLock<HashMap<BroadcastId, SubscriptionEntry>>,
}

struct WeakEffect(Weak<Inner>);

impl WeakEffect {
    fn upgrade(&self) -> Option<Effect> { self.0.upgrade().map(Effect) }
}

/// An effect runs its closure immediately, tracking every signal it reads, and
/// re-runs whenever one of them changes. Dropping the last handle (or calling
/// [`Effect::dispose`]) removes it from every dependency set; subsequent
/// signal changes no longer schedule it.
///
/// A panic inside the closure is caught and logged; the effect stays
/// subscribed and later runs are attempted again.
#[derive(Clone)]
pub struct Effect(Arc<Inner>);

impl Effect {
    pub fn new<F: Fn() + Send + Sync + 'static>(callback: F) -> Self {
        let effect = Self(Arc::new(Inner { callback: Box::new(callback), entries: RwLock::new(HashMap::new()) }));
        effect.trigger();
        effect
    }

    /// Run the callback under this effect's observer frame.
    pub fn trigger(&self) {
        // Mark all existing listeners for removal; the run re-marks the ones
        // still read
        {
            let mut entries = self.0.entries.write().expect("entries lock poisoned");
            for entry in entries.values_mut() {
                entry.marked_for_removal = true;
            }
        }

        CurrentObserver::set(self.clone());
        let result = catch_unwind(AssertUnwindSafe(|| (self.0.callback)()));
        CurrentObserver::remove(self);

        if let Err(payload) = result {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!("effect: callback panicked: {message}");
        }

        let mut entries = self.0.entries.write().expect("entries lock poisoned");
        entries.retain(|_, entry| !entry.marked_for_removal);
    }

    /// Drop all dependency subscriptions. Idempotent; safe to call on an
    /// already-disposed effect.
    pub fn dispose(&self) { self.0.entries.write().expect("entries lock poisoned").clear(); }
}

impl Observer for Effect {
    fn observe(&self, signal: &dyn Signal) {
        let broadcast_id = signal.broadcast_id();

        let mut entries = self.0.entries.write().expect("entries lock poisoned");

        if let Some(entry) = entries.get_mut(&broadcast_id) {
            entry.marked_for_removal = false;
            return;
        }

        let weak = WeakEffect(Arc::downgrade(&self.0));
        entries.insert(
            broadcast_id,
            SubscriptionEntry {
                _guard: signal.listen(Arc::new(move |_| {
                    if let Some(effect) = weak.upgrade() {
                        // One run per batch even when several dependencies
                        // were written
                        let id = effect.observer_id();
                        crate::batch::run_or_defer(id, Box::new(move || effect.trigger()));
                    }
                })),
                marked_for_removal: false,
            },
        );
    }

    fn observer_id(&self) -> usize { Arc::as_ptr(&self.0) as usize }
}
