use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Identifies a broadcast for deduplication purposes. Ids are allocated from a
/// process-wide counter and are never reused, so they stay valid as map keys
/// even after the broadcast itself is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BroadcastId(usize);

impl std::fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "B{}", self.0) }
}

static NEXT_BROADCAST_ID: AtomicUsize = AtomicUsize::new(0);

/// A listener that is called when broadcast notifications are sent.
pub type BroadcastListener<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

/// Trait for types that can be converted into broadcast listeners.
pub trait IntoBroadcastListener<T> {
    fn into_broadcast_listener(self) -> BroadcastListener<T>;
}

/// A broadcast sender that notifies multiple listeners synchronously.
/// Cloning shares the same listener set.
pub struct Broadcast<T = ()>(Arc<Inner<T>>);

struct Inner<T> {
    id: BroadcastId,
    listeners: RwLock<HashMap<usize, BroadcastListener<T>>>,
    next_listener: AtomicUsize,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self { Self(Arc::clone(&self.0)) }
}

impl<T> Default for Broadcast<T> {
    fn default() -> Self { Self::new() }
}

/// A listen-only reference to a broadcast.
pub struct Ref<'a, T>(&'a Broadcast<T>);

/// A subscription handle; dropping it unsubscribes.
pub struct ListenerGuard<T> {
    inner: Weak<Inner<T>>,
    id: BroadcastId,
    listener_id: usize,
}

impl<T> Broadcast<T> {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            id: BroadcastId(NEXT_BROADCAST_ID.fetch_add(1, Ordering::Relaxed)),
            listeners: RwLock::new(HashMap::new()),
            next_listener: AtomicUsize::new(0),
        }))
    }

    pub fn id(&self) -> BroadcastId { self.0.id }

    /// Get a read-only reference that can only listen, not send.
    pub fn reference(&self) -> Ref<'_, T> { Ref(self) }
}

impl<T: Clone> Broadcast<T> {
    /// Send a notification to all active listeners.
    pub fn send(&self, value: T) {
        // Clone the listeners out so no lock is held during callback execution;
        // listeners may subscribe or unsubscribe re-entrantly.
        let listeners = {
            let listeners = self.0.listeners.read().expect("listeners lock poisoned");
            listeners.values().cloned().collect::<Vec<_>>()
        };
        for listener in listeners {
            listener(value.clone());
        }
    }
}

impl<'a, T> Ref<'a, T> {
    /// Subscribe to notifications from the associated sender.
    pub fn listen<L>(&self, listener: L) -> ListenerGuard<T>
    where L: IntoBroadcastListener<T> {
        let listener_id = self.0.0.next_listener.fetch_add(1, Ordering::Relaxed);
        self.0.0.listeners.write().expect("listeners lock poisoned").insert(listener_id, listener.into_broadcast_listener());
        ListenerGuard { inner: Arc::downgrade(&self.0.0), id: self.0.0.id, listener_id }
    }
}

impl<T> ListenerGuard<T> {
    /// The broadcast this guard is subscribed to.
    pub fn broadcast_id(&self) -> BroadcastId { self.id }
}

impl<T> Drop for ListenerGuard<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.write().expect("listeners lock poisoned").remove(&self.listener_id);
        }
    }
}

impl<F, T> IntoBroadcastListener<T> for F
where F: Fn(T) + Send + Sync + 'static
{
    fn into_broadcast_listener(self) -> BroadcastListener<T> { Arc::new(self) }
}

impl<T: Send + 'static> IntoBroadcastListener<T> for std::sync::mpsc::Sender<T> {
    fn into_broadcast_listener(self) -> BroadcastListener<T> {
        Arc::new(move |value| {
            let _ = self.send(value); // receiver may be gone
        })
    }
}

#[cfg(feature = "tokio")]
impl<T: Send + 'static> IntoBroadcastListener<T> for tokio::sync::mpsc::UnboundedSender<T> {
    fn into_broadcast_listener(self) -> BroadcastListener<T> {
        Arc::new(move |value| {
            let _ = self.send(value);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn multiple_listeners() {
        let sender = Broadcast::<()>::new();
        let counter = Arc::new(Mutex::new(0));

        let _guard1 = {
            let counter = counter.clone();
            sender.reference().listen(move |_| *counter.lock().unwrap() += 1)
        };
        let guard2 = {
            let counter = counter.clone();
            sender.reference().listen(move |_| *counter.lock().unwrap() += 10)
        };

        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 11);

        drop(guard2);
        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 12);
    }

    #[test]
    fn reentrant_listen_during_send() {
        let sender = Broadcast::<()>::new();
        let counter = Arc::new(Mutex::new(0));

        let sender_clone = sender.clone();
        let counter_clone = counter.clone();
        let _guard = sender.reference().listen(move |_| {
            *counter_clone.lock().unwrap() += 1;
            // Subscribing during a callback must not deadlock
            let _temp = sender_clone.reference().listen(|_| {});
        });

        sender.send(());
        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 2);
    }

    #[test]
    fn ids_are_distinct() {
        let a = Broadcast::<()>::new();
        let b = Broadcast::<()>::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }
}
