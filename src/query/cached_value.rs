//! A memoized value that owns its own [`Dependency`].

use std::sync::{Arc, Mutex};

use crate::query::dependency::{Dependency, DependencyTracker};
use crate::sync::lock;

struct Slot<T> {
    value: Option<T>,
    /// Keeps the subscriptions of the current value alive.
    tracker: Option<DependencyTracker>,
}

/// Caches `T` until anything it read is invalidated.
///
/// Consumers register [`CachedValue::dependency`] into their own trackers;
/// when the cached value clears itself it invalidates that dependency in
/// turn, so invalidation chains through.
pub struct CachedValue<T> {
    dependency: Arc<Dependency>,
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T: Clone + Send + 'static> CachedValue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            dependency: Dependency::new(name),
            slot: Arc::new(Mutex::new(Slot {
                value: None,
                tracker: None,
            })),
        }
    }

    pub fn dependency(&self) -> &Arc<Dependency> {
        &self.dependency
    }

    pub fn is_cached(&self) -> bool {
        lock(&self.slot).value.is_some()
    }

    /// Cached value, or compute one with a fresh tracker.
    pub fn get_or_compute(&self, compute: impl FnOnce(&DependencyTracker) -> T) -> T {
        if let Some(value) = lock(&self.slot).value.clone() {
            return value;
        }

        let tracker = DependencyTracker::new(format!("{}.tracker", self.dependency.name()));
        let value = compute(&tracker);

        {
            let mut slot = lock(&self.slot);
            slot.value = Some(value.clone());
            slot.tracker = Some(tracker.clone());
        }

        let slot = Arc::downgrade(&self.slot);
        let dependency = Arc::downgrade(&self.dependency);
        // Runs right away if something was invalidated while computing.
        tracker.set_on_invalidated(move || {
            if let Some(slot) = slot.upgrade() {
                let mut slot = lock(&slot);
                slot.value = None;
                slot.tracker = None;
            }
            if let Some(dependency) = dependency.upgrade() {
                dependency.invalidate();
            }
        });
        value
    }

    /// Drop the value and notify dependents.
    pub fn invalidate(&self) {
        {
            let mut slot = lock(&self.slot);
            slot.value = None;
            slot.tracker = None;
        }
        self.dependency.invalidate();
    }
}

impl<T> std::fmt::Debug for CachedValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedValue")
            .field("dependency", &self.dependency.name())
            .finish()
    }
}
