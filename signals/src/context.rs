use crate::{Observer, Signal};
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static OBSERVER_STACK: RefCell<Vec<Arc<dyn Observer>>> = RefCell::new(Vec::new());
}

/// Manages the current observer stack and subscribes the top observer to each
/// signal read while it is current.
///
/// The stack is thread local: the core runs cooperatively on one thread, and a
/// frame pushed on one thread never observes reads happening on another.
pub struct CurrentObserver {}

impl CurrentObserver {
    /// Record a signal read against the current frame, if any.
    pub fn track<S>(signal: &S)
    where S: Signal {
        OBSERVER_STACK.with(|stack| {
            if let Some(observer) = stack.borrow().last() {
                observer.observe(signal);
            }
        });
    }

    /// Push an observer frame.
    pub fn set<O: Observer + 'static>(observer: O) {
        OBSERVER_STACK.with(|stack| {
            stack.borrow_mut().push(Arc::new(observer));
        });
    }

    /// Remove a specific observer from the stack. The common case is the top
    /// frame; out-of-order removal is tolerated for disposers.
    pub fn remove(observer: &dyn Observer) {
        let target_id = observer.observer_id();
        OBSERVER_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(last) = stack.last()
                && last.observer_id() == target_id
            {
                stack.pop();
                return;
            }
            stack.retain(|o| o.observer_id() != target_id);
        });
    }

    /// The current top frame, if any.
    pub fn current() -> Option<Arc<dyn Observer>> { OBSERVER_STACK.with(|stack| stack.borrow().last().cloned()) }
}
