//! Dependencies, trackers and invalidation scopes.
//!
//! A [`Dependency`] is a unit of ground truth. Evaluations record what they
//! read into a [`DependencyTracker`]; invalidating a dependency fires every
//! tracker whose recorded region overlaps, exactly once per tracker.
//! Inside an [`InvalidationScope`] the firing is deferred and batched until
//! the outermost scope closes.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::math::Aabb;
use crate::sync::lock;

static NEXT_DEPENDENCY_ID: AtomicU64 = AtomicU64::new(1);

/// Part of a dependency that was read or changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DependencyRegion {
    Everything,
    Bounds(Aabb),
}

impl DependencyRegion {
    /// Conservative: anything involving `Everything` overlaps.
    pub fn overlaps(&self, other: &DependencyRegion) -> bool {
        match (self, other) {
            (DependencyRegion::Bounds(a), DependencyRegion::Bounds(b)) => a.intersects(b),
            _ => true,
        }
    }

    /// Smallest region covering both.
    pub fn merge(&self, other: &DependencyRegion) -> DependencyRegion {
        match (self, other) {
            (DependencyRegion::Bounds(a), DependencyRegion::Bounds(b)) => DependencyRegion::Bounds(a.union(b)),
            _ => DependencyRegion::Everything,
        }
    }
}

/// Dead subscriptions are swept once the list reaches this length, then
/// again whenever it doubles past the live count.
const SUBSCRIBER_SWEEP_MIN: usize = 64;

struct Subscription {
    tracker: Weak<TrackerShared>,
    region: DependencyRegion,
}

struct Subscribers {
    list: Vec<Subscription>,
    sweep_at: usize,
}

impl Subscribers {
    fn retain_live(&mut self) {
        self.list.retain(|s| s.tracker.strong_count() > 0);
        self.sweep_at = (self.list.len() * 2).max(SUBSCRIBER_SWEEP_MIN);
    }
}

pub struct Dependency {
    id: u64,
    name: String,
    subscribers: Mutex<Subscribers>,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_DEPENDENCY_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            subscribers: Mutex::new(Subscribers {
                list: Vec::new(),
                sweep_at: SUBSCRIBER_SWEEP_MIN,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live, not yet fired subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = lock(&self.subscribers);
        subs.retain_live();
        subs.list.len()
    }

    pub fn invalidate(&self) {
        self.invalidate_region(DependencyRegion::Everything);
    }

    /// Fire every tracker whose recorded region overlaps `region`.
    pub fn invalidate_region(&self, region: DependencyRegion) {
        let fired: Vec<Arc<TrackerShared>> = {
            let mut subs = lock(&self.subscribers);
            let mut fired = Vec::new();
            subs.list.retain(|s| {
                let Some(tracker) = s.tracker.upgrade() else {
                    return false;
                };
                if s.region.overlaps(&region) {
                    fired.push(tracker);
                    false
                } else {
                    true
                }
            });
            fired
        };

        if !fired.is_empty() {
            tracing::trace!("Dependency '{}' invalidated {} tracker(s)", self.name, fired.len());
        }
        for tracker in fired {
            InvalidationScope::dispatch(tracker);
        }
    }

    /// One subscription per tracker; a repeated read widens its region.
    fn subscribe(&self, tracker: &Arc<TrackerShared>, region: DependencyRegion) {
        let mut subs = lock(&self.subscribers);
        if let Some(existing) = subs
            .list
            .iter_mut()
            .find(|s| std::ptr::eq(s.tracker.as_ptr(), Arc::as_ptr(tracker)))
        {
            existing.region = existing.region.merge(&region);
            return;
        }
        if subs.list.len() >= subs.sweep_at {
            subs.retain_live();
        }
        subs.list.push(Subscription {
            tracker: Arc::downgrade(tracker),
            region,
        });
    }
}

// ── DependencyTracker ──

type InvalidationCallback = Box<dyn FnOnce() + Send>;

struct TrackerShared {
    name: String,
    invalidated: AtomicBool,
    on_invalidated: Mutex<Option<InvalidationCallback>>,
    recorded: Mutex<Vec<(Weak<Dependency>, DependencyRegion)>>,
}

impl TrackerShared {
    fn fire(&self) {
        if self.invalidated.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = lock(&self.on_invalidated).take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Records the dependencies read by one evaluation.
///
/// Cloning shares the same tracker. Once fired a tracker stays invalidated;
/// recompute with a new tracker.
#[derive(Clone)]
pub struct DependencyTracker {
    shared: Arc<TrackerShared>,
}

impl fmt::Debug for DependencyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyTracker")
            .field("name", &self.shared.name)
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

impl DependencyTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                name: name.into(),
                invalidated: AtomicBool::new(false),
                on_invalidated: Mutex::new(None),
                recorded: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn add_dependency(&self, dependency: &Arc<Dependency>) {
        self.add_dependency_region(dependency, DependencyRegion::Everything);
    }

    pub fn add_dependency_region(&self, dependency: &Arc<Dependency>, region: DependencyRegion) {
        if self.is_invalidated() {
            return;
        }
        dependency.subscribe(&self.shared, region);
        let mut recorded = lock(&self.shared.recorded);
        match recorded.iter_mut().find(|(d, _)| std::ptr::eq(d.as_ptr(), Arc::as_ptr(dependency))) {
            Some((_, existing)) => *existing = existing.merge(&region),
            None => recorded.push((Arc::downgrade(dependency), region)),
        }
    }

    /// Set the callback run on invalidation. Runs immediately if the
    /// tracker was already invalidated.
    pub fn set_on_invalidated(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_invalidated() {
            f();
            return;
        }
        *lock(&self.shared.on_invalidated) = Some(Box::new(f));
        // Fired between the check and the store.
        if self.is_invalidated() {
            if let Some(f) = lock(&self.shared.on_invalidated).take() {
                f();
            }
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.shared.invalidated.load(Ordering::Acquire)
    }

    pub fn num_dependencies(&self) -> usize {
        lock(&self.shared.recorded).len()
    }

    /// Names of the recorded dependencies that are still alive.
    pub fn dependency_names(&self) -> Vec<String> {
        lock(&self.shared.recorded)
            .iter()
            .filter_map(|(d, _)| d.upgrade().map(|d| d.name.clone()))
            .collect()
    }
}

// ── InvalidationScope ──

#[derive(Default)]
struct ScopeState {
    depth: usize,
    queued: Vec<Arc<TrackerShared>>,
}

thread_local! {
    static SCOPE: RefCell<ScopeState> = RefCell::new(ScopeState::default());
}

/// Batches invalidations raised on this thread until the outermost scope
/// is dropped.
pub struct InvalidationScope {
    _not_send: PhantomData<*const ()>,
}

impl InvalidationScope {
    pub fn new() -> Self {
        SCOPE.with(|s| s.borrow_mut().depth += 1);
        Self { _not_send: PhantomData }
    }

    pub fn is_active() -> bool {
        SCOPE.with(|s| s.borrow().depth > 0)
    }

    /// Trackers waiting for the outermost scope to close.
    pub fn pending() -> usize {
        SCOPE.with(|s| s.borrow().queued.len())
    }

    fn dispatch(tracker: Arc<TrackerShared>) {
        let tracker = SCOPE.with(|s| {
            let mut s = s.borrow_mut();
            if s.depth > 0 {
                if !s.queued.iter().any(|t| Arc::ptr_eq(t, &tracker)) {
                    s.queued.push(tracker);
                }
                None
            } else {
                Some(tracker)
            }
        });
        if let Some(tracker) = tracker {
            tracker.fire();
        }
    }
}

impl Default for InvalidationScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InvalidationScope {
    fn drop(&mut self) {
        let queued = SCOPE.with(|s| {
            let mut s = s.borrow_mut();
            s.depth -= 1;
            if s.depth == 0 {
                std::mem::take(&mut s.queued)
            } else {
                Vec::new()
            }
        });
        if !queued.is_empty() {
            tracing::trace!("Invalidation scope closed, firing {} tracker(s)", queued.len());
        }
        for tracker in queued {
            tracker.fire();
        }
    }
}
