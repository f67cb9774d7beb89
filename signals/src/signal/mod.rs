pub mod calculated;
pub mod mutable;

pub use calculated::*;
pub use mutable::*;

use crate::broadcast::BroadcastId;
use std::sync::Arc;

/// Listener invoked when a signal changes. Wrap your closure with
/// `Arc::new(|_| { ... })`.
pub type Listener = Arc<dyn Fn(()) + Send + Sync + 'static>;

/// Type-erased guard for a listener on any signal; dropping it unsubscribes.
pub struct ListenerGuard(Box<dyn ErasedGuard + Send + Sync + 'static>);

trait ErasedGuard {
    fn broadcast_id(&self) -> BroadcastId;
}

impl<T: 'static> ErasedGuard for crate::broadcast::ListenerGuard<T> {
    fn broadcast_id(&self) -> BroadcastId { crate::broadcast::ListenerGuard::broadcast_id(self) }
}

impl ListenerGuard {
    pub fn new<T: Send + Sync + 'static>(guard: crate::broadcast::ListenerGuard<T>) -> Self { Self(Box::new(guard)) }

    /// The broadcast this guard is subscribed to.
    pub fn broadcast_id(&self) -> BroadcastId { self.0.broadcast_id() }
}

/// Core trait for signals: observation without regard to a payload value.
///
/// Multiple signals may share one broadcast (and thus one broadcast id); that
/// is intentional and lets observers deduplicate subscriptions.
pub trait Signal {
    /// Listen to changes to this signal.
    fn listen(&self, listener: Listener) -> ListenerGuard;

    /// The broadcast identifier for this signal.
    fn broadcast_id(&self) -> BroadcastId;
}

impl<T> Signal for &T
where T: Signal
{
    fn listen(&self, listener: Listener) -> ListenerGuard { Signal::listen(*self, listener) }
    fn broadcast_id(&self) -> BroadcastId { Signal::broadcast_id(*self) }
}

/// Get the current value, tracked by the current observer frame.
pub trait Get<T: 'static>: Signal {
    fn get(&self) -> T;
}

/// Access the current value with a closure, tracked by the current observer
/// frame.
pub trait With<T: 'static> {
    fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R;
}

/// Get the current value without recording a dependency.
pub trait Peek<T: 'static> {
    fn peek(&self) -> T;
}
