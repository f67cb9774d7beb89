use std::sync::{Arc, RwLock};

/// Shared interior storage for a signal's present value.
pub struct ValueCell<T>(Arc<RwLock<T>>);

/// A read-only view sharing storage with a [`ValueCell`].
pub struct ReadValueCell<T>(Arc<RwLock<T>>);

impl<T> Clone for ValueCell<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> Clone for ReadValueCell<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> ValueCell<T> {
    pub fn new(value: T) -> Self { Self(Arc::new(RwLock::new(value))) }

    pub fn set(&self, value: T) { *self.0.write().expect("value lock poisoned") = value; }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.0.read().expect("value lock poisoned");
        f(&guard)
    }

    /// Create a read-only view of this value.
    pub fn read_cell(&self) -> ReadValueCell<T> { ReadValueCell(self.0.clone()) }
}

impl<T: Clone> ValueCell<T> {
    pub fn value(&self) -> T { self.0.read().expect("value lock poisoned").clone() }
}

impl<T> ReadValueCell<T> {
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.0.read().expect("value lock poisoned");
        f(&guard)
    }
}

impl<T: Clone> ReadValueCell<T> {
    pub fn value(&self) -> T { self.0.read().expect("value lock poisoned").clone() }
}
