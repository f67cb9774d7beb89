use crate::{
    batch,
    broadcast::{Broadcast, BroadcastId},
    context::CurrentObserver,
    signal::{Get, Listener, ListenerGuard, Peek, Signal, With},
    value::ValueCell,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct Shared<T> {
    value: ValueCell<T>,
    revision: AtomicU64,
    broadcast: Broadcast,
}

/// Mutable (stateful) signal. Writers and readers are different types; hand
/// out [`Read`] handles to consumers that should only observe.
pub struct Mut<T>(Arc<Shared<T>>);

/// Read-only signal downstream of a [`Mut`].
pub struct Read<T>(Arc<Shared<T>>);

impl<T> Clone for Mut<T> {
    fn clone(&self) -> Self { Self(Arc::clone(&self.0)) }
}
impl<T> Clone for Read<T> {
    fn clone(&self) -> Self { Self(Arc::clone(&self.0)) }
}

impl<T> Mut<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(Shared { value: ValueCell::new(value), revision: AtomicU64::new(0), broadcast: Broadcast::new() }))
    }

    /// Replace the value, advance the revision, and notify dependents (or
    /// defer to the end of the current batch).
    pub fn set(&self, value: T) {
        self.0.value.set(value);
        self.0.revision.fetch_add(1, Ordering::Relaxed);
        if !batch::defer(&self.0.broadcast) {
            self.0.broadcast.send(());
        }
    }

    /// Monotonic write counter; advances on every `set`.
    pub fn revision(&self) -> u64 { self.0.revision.load(Ordering::Relaxed) }

    /// Readonly handle sharing this signal's storage and broadcast.
    pub fn read(&self) -> Read<T> { Read(Arc::clone(&self.0)) }
}

impl<T: PartialEq> Mut<T> {
    /// Write that elides the notification when the new value equals the
    /// current one. Returns whether a write happened.
    pub fn set_if_changed(&self, value: T) -> bool {
        let changed = self.0.value.with(|current| *current != value);
        if changed {
            self.set(value);
        }
        changed
    }
}

impl<T: Clone + 'static> Peek<T> for Mut<T> {
    fn peek(&self) -> T { self.0.value.value() }
}

impl<T: 'static> Mut<T> {
    /// Borrow the current value without recording a dependency.
    pub fn with_untracked<R>(&self, f: impl FnOnce(&T) -> R) -> R { self.0.value.with(f) }
}

impl<T> Signal for Mut<T> {
    fn listen(&self, listener: Listener) -> ListenerGuard {
        ListenerGuard::new(self.0.broadcast.reference().listen(move |_| listener(())))
    }
    fn broadcast_id(&self) -> BroadcastId { self.0.broadcast.id() }
}

impl<T> Read<T> {
    pub fn revision(&self) -> u64 { self.0.revision.load(Ordering::Relaxed) }
}

impl<T> Signal for Read<T> {
    fn listen(&self, listener: Listener) -> ListenerGuard {
        ListenerGuard::new(self.0.broadcast.reference().listen(move |_| listener(())))
    }
    fn broadcast_id(&self) -> BroadcastId { self.0.broadcast.id() }
}

impl<T: Clone + 'static> Get<T> for Read<T> {
    fn get(&self) -> T {
        CurrentObserver::track(self);
        self.0.value.value()
    }
}

impl<T: 'static> With<T> for Read<T> {
    fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        CurrentObserver::track(self);
        self.0.value.with(f)
    }
}

impl<T: Clone + 'static> Peek<T> for Read<T> {
    fn peek(&self) -> T { self.0.value.value() }
}

impl<T> crate::porcelain::Subscribe<T> for Read<T>
where T: Clone + Send + Sync + 'static
{
    fn subscribe<F>(&self, listener: F) -> crate::porcelain::SubscriptionGuard
    where F: crate::porcelain::IntoSubscribeListener<T> {
        let listener = listener.into_subscribe_listener();
        let value = self.0.value.read_cell();
        let guard = Signal::listen(
            self,
            std::sync::Arc::new(move |_| {
                listener(value.value());
            }),
        );
        crate::porcelain::SubscriptionGuard::new(guard)
    }
}
