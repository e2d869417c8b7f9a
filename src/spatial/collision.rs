//! Per-instance collision enablement driven by invoker channels.
//!
//! Each channel holds the components listening to it. When the channel's
//! invoker changes (or a component's instances do), every component is
//! diffed off-thread against the invoker and the resulting enable/disable
//! sets are applied on the privileged thread through a [`CollisionSink`].
//! Results computed against a component that changed in the meantime are
//! discarded and the channel is queued again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::math::Aabb;
use crate::query::{TaskScheduler, TaskThread};
use crate::spatial::aabb_tree::{AabbElement, AabbTree};
use crate::spatial::invoker::Invoker;
use crate::spatial::invoker_manager::InvokerManager;
use crate::spatial::WorldId;
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollisionComponentId(pub u64);

static NEXT_COMPONENT_ID: AtomicU64 = AtomicU64::new(1);

/// Physics collaborator receiving enable/disable requests.
#[cfg_attr(test, mockall::automock)]
pub trait CollisionSink: Send + Sync {
    fn enable_instances(&self, component: CollisionComponentId, indices: &[usize]);
    fn disable_instances(&self, component: CollisionComponentId, indices: &[usize]);
}

/// World-space instance bounds with a tree over them.
#[derive(Debug)]
pub struct InstanceSet {
    bounds: Vec<Aabb>,
    tree: AabbTree,
}

impl InstanceSet {
    pub fn new(bounds: Vec<Aabb>) -> Arc<Self> {
        let elements = bounds
            .iter()
            .enumerate()
            .map(|(index, b)| AabbElement { bounds: *b, index })
            .collect();
        Arc::new(Self {
            tree: AabbTree::new(elements),
            bounds,
        })
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }
}

type EnabledSet = Arc<FxHashSet<usize>>;

struct ComponentState {
    channel: String,
    instances: Arc<InstanceSet>,
    /// Every instance has collision, as right after creation.
    all_enabled: bool,
    enabled: Option<EnabledSet>,
}

#[derive(Default)]
struct ChannelState {
    update_queued: bool,
    update_processing: bool,
    invoker: Option<Arc<Invoker>>,
}

#[derive(Default)]
struct CollisionState {
    components: FxHashMap<CollisionComponentId, ComponentState>,
    channels: FxHashMap<String, ChannelState>,
}

/// Snapshot of a component taken when an update starts.
struct ComponentUpdater {
    id: CollisionComponentId,
    channel: String,
    instances: Arc<InstanceSet>,
    all_enabled: bool,
    old_enabled: Option<EnabledSet>,
    new_enabled: FxHashSet<usize>,
    to_enable: Vec<usize>,
    to_disable: Vec<usize>,
}

impl ComponentUpdater {
    fn update(&mut self, invoker: &Invoker) {
        let mut enabled = FxHashSet::default();
        self.instances
            .tree
            .traverse(|bounds| invoker.intersects(bounds), |index| {
                enabled.insert(index);
            });

        let (to_enable, to_disable) = diff_enabled(
            &enabled,
            if self.all_enabled { None } else { self.old_enabled.as_deref() },
            self.all_enabled,
            self.instances.len(),
        );
        self.new_enabled = enabled;
        self.to_enable = to_enable;
        self.to_disable = to_disable;
    }

    fn is_stale(&self, current: &ComponentState) -> bool {
        !Arc::ptr_eq(&current.instances, &self.instances)
            || current.channel != self.channel
            || current.all_enabled != self.all_enabled
            || match (&current.enabled, &self.old_enabled) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                (None, None) => false,
                _ => true,
            }
    }
}

/// `new - old` and `old - new`, sorted. With `all_enabled` the old set is
/// every index below `len`.
pub fn diff_enabled(
    new: &FxHashSet<usize>,
    old: Option<&FxHashSet<usize>>,
    all_enabled: bool,
    len: usize,
) -> (Vec<usize>, Vec<usize>) {
    let mut to_enable: Vec<usize> = if all_enabled {
        Vec::new()
    } else {
        new.iter().copied().filter(|i| !old.is_some_and(|o| o.contains(i))).collect()
    };
    let mut to_disable: Vec<usize> = if all_enabled {
        (0..len).filter(|i| !new.contains(i)).collect()
    } else {
        old.map(|o| o.iter().copied().filter(|i| !new.contains(i)).collect())
            .unwrap_or_default()
    };
    to_enable.sort_unstable();
    to_disable.sort_unstable();
    (to_enable, to_disable)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollisionTickStats {
    pub channels_updated: usize,
    pub channels_removed: usize,
}

pub struct CollisionManager {
    world: WorldId,
    invokers: Arc<InvokerManager>,
    scheduler: TaskScheduler,
    sink: Arc<dyn CollisionSink>,
    state: Arc<Mutex<CollisionState>>,
}

impl std::fmt::Debug for CollisionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("CollisionManager")
            .field("world", &self.world)
            .field("components", &state.components.len())
            .field("channels", &state.channels.len())
            .finish()
    }
}

impl CollisionManager {
    pub fn new(
        world: WorldId,
        invokers: Arc<InvokerManager>,
        scheduler: TaskScheduler,
        sink: Arc<dyn CollisionSink>,
    ) -> Self {
        Self {
            world,
            invokers,
            scheduler,
            sink,
            state: Arc::new(Mutex::new(CollisionState::default())),
        }
    }

    /// Registers a component whose instances all start with collision.
    pub fn add_component(&self, channel: impl Into<String>, instances: Arc<InstanceSet>) -> CollisionComponentId {
        let id = CollisionComponentId(NEXT_COMPONENT_ID.fetch_add(1, Ordering::Relaxed));
        let channel = channel.into();
        let mut state = lock(&self.state);
        state.channels.entry(channel.clone()).or_default().update_queued = true;
        state.components.insert(
            id,
            ComponentState {
                channel,
                instances,
                all_enabled: true,
                enabled: None,
            },
        );
        id
    }

    pub fn remove_component(&self, id: CollisionComponentId) -> bool {
        lock(&self.state).components.remove(&id).is_some()
    }

    /// Replaces the instances of a component; the next tick rediffs it from
    /// the all-enabled state.
    pub fn set_instances(&self, id: CollisionComponentId, instances: Arc<InstanceSet>) -> bool {
        let mut state = lock(&self.state);
        let Some(component) = state.components.get_mut(&id) else {
            return false;
        };
        component.instances = instances;
        component.all_enabled = true;
        component.enabled = None;
        let channel = component.channel.clone();
        state.channels.entry(channel).or_default().update_queued = true;
        true
    }

    pub fn set_channel(&self, id: CollisionComponentId, channel: impl Into<String>) -> bool {
        let channel = channel.into();
        let mut state = lock(&self.state);
        let Some(component) = state.components.get_mut(&id) else {
            return false;
        };
        if component.channel == channel {
            return false;
        }
        component.channel = channel.clone();
        state.channels.entry(channel).or_default().update_queued = true;
        true
    }

    pub fn enabled_instances(&self, id: CollisionComponentId) -> Option<Vec<usize>> {
        let state = lock(&self.state);
        let component = state.components.get(&id)?;
        let mut enabled: Vec<usize> = if component.all_enabled {
            (0..component.instances.len()).collect()
        } else {
            component
                .enabled
                .as_ref()
                .map(|e| e.iter().copied().collect())
                .unwrap_or_default()
        };
        enabled.sort_unstable();
        Some(enabled)
    }

    /// Privileged-thread tick.
    pub fn tick(&self) -> CollisionTickStats {
        let mut stats = CollisionTickStats::default();
        let mut state = lock(&self.state);

        let live: FxHashSet<String> = state.components.values().map(|c| c.channel.clone()).collect();
        let before = state.channels.len();
        state.channels.retain(|name, channel| live.contains(name) || channel.update_processing);
        stats.channels_removed = before - state.channels.len();

        let names: Vec<String> = state.channels.keys().cloned().collect();
        for name in names {
            let invoker = self.invokers.get_invoker(self.world, &name);
            let Some(channel) = state.channels.get_mut(&name) else {
                continue;
            };
            if !channel.invoker.as_ref().is_some_and(|i| Arc::ptr_eq(i, &invoker)) {
                channel.invoker = Some(invoker.clone());
                channel.update_queued = true;
            }
            if !channel.update_queued || channel.update_processing {
                continue;
            }
            channel.update_queued = false;
            channel.update_processing = true;

            let updaters: Vec<ComponentUpdater> = state
                .components
                .iter()
                .filter(|(_, c)| c.channel == name)
                .map(|(id, c)| ComponentUpdater {
                    id: *id,
                    channel: name.clone(),
                    instances: c.instances.clone(),
                    all_enabled: c.all_enabled,
                    old_enabled: c.enabled.clone(),
                    new_enabled: FxHashSet::default(),
                    to_enable: Vec::new(),
                    to_disable: Vec::new(),
                })
                .collect();
            stats.channels_updated += 1;
            self.dispatch_update(name, invoker, updaters);
        }
        stats
    }

    fn dispatch_update(&self, channel: String, invoker: Arc<Invoker>, mut updaters: Vec<ComponentUpdater>) {
        let scheduler = self.scheduler.clone();
        let shared = self.state.clone();
        let sink = self.sink.clone();

        self.scheduler.dispatch(TaskThread::Worker, move || {
            for updater in &mut updaters {
                updater.update(&invoker);
            }
            scheduler.dispatch(TaskThread::Privileged, move || {
                finalize(&shared, sink.as_ref(), &channel, updaters);
            });
        });
    }
}

fn finalize(shared: &Mutex<CollisionState>, sink: &dyn CollisionSink, channel: &str, updaters: Vec<ComponentUpdater>) {
    let mut applied = Vec::new();
    {
        let mut state = lock(shared);
        let mut stale = false;
        for updater in updaters {
            let Some(component) = state.components.get_mut(&updater.id) else {
                continue;
            };
            if updater.is_stale(component) {
                stale = true;
                continue;
            }
            component.enabled = Some(Arc::new(updater.new_enabled));
            component.all_enabled = false;
            applied.push((updater.id, updater.to_enable, updater.to_disable));
        }

        if let Some(c) = state.channels.get_mut(channel) {
            c.update_processing = false;
            if stale {
                c.update_queued = true;
            }
        }
        if stale {
            tracing::debug!("Collision channel '{}' had stale results, requeued", channel);
        }
    }

    for (id, to_enable, to_disable) in applied {
        if !to_enable.is_empty() {
            sink.enable_instances(id, &to_enable);
        }
        if !to_disable.is_empty() {
            sink.disable_instances(id, &to_disable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec3;
    use crate::spatial::invoker_manager::{ComponentTransform, InvokerComponent, InvokerTolerances};
    use mockall::predicate::*;

    const WORLD: WorldId = WorldId(3);

    fn instances_along_x(n: usize) -> Arc<InstanceSet> {
        InstanceSet::new(
            (0..n)
                .map(|i| Aabb::from_center_extent(Vec3::new(i as f64 * 100.0, 0.0, 0.0), Vec3::splat(1.0)))
                .collect(),
        )
    }

    fn set(items: &[usize]) -> FxHashSet<usize> {
        items.iter().copied().collect()
    }

    #[test]
    fn test_diff_enabled() {
        let (enable, disable) = diff_enabled(&set(&[1, 2, 3]), Some(&set(&[3, 4])), false, 5);
        assert_eq!(enable, vec![1, 2]);
        assert_eq!(disable, vec![4]);

        let (enable, disable) = diff_enabled(&set(&[0]), None, true, 3);
        assert!(enable.is_empty());
        assert_eq!(disable, vec![1, 2]);

        let (enable, disable) = diff_enabled(&set(&[2]), None, false, 3);
        assert_eq!(enable, vec![2]);
        assert!(disable.is_empty());
    }

    #[test]
    fn test_first_update_disables_far_instances() {
        let invokers = InvokerManager::new(InvokerTolerances::default());
        let scheduler = TaskScheduler::new(1).unwrap();
        let _handle = invokers.add_invoker(InvokerComponent::sphere(WORLD, 150.0));
        invokers.tick();

        let mut sink = MockCollisionSink::new();
        sink.expect_disable_instances()
            .with(always(), eq(vec![2usize, 3, 4]))
            .times(1)
            .return_const(());
        sink.expect_enable_instances().never();

        let manager = CollisionManager::new(WORLD, invokers, scheduler.clone(), Arc::new(sink));
        let id = manager.add_component(crate::spatial::DEFAULT_CHANNEL, instances_along_x(5));
        scheduler.run_synchronously(|| manager.tick()).unwrap();

        assert_eq!(manager.enabled_instances(id), Some(vec![0, 1]));
    }

    #[test]
    fn test_moving_invoker_swaps_instances() {
        let invokers = InvokerManager::new(InvokerTolerances::default());
        let scheduler = TaskScheduler::new(1).unwrap();
        let handle = invokers.add_invoker(InvokerComponent::sphere(WORLD, 50.0));
        invokers.tick();

        let mut sink = MockCollisionSink::new();
        sink.expect_disable_instances().times(2).return_const(());
        sink.expect_enable_instances()
            .with(always(), eq(vec![3usize]))
            .times(1)
            .return_const(());

        let manager = CollisionManager::new(WORLD, invokers.clone(), scheduler.clone(), Arc::new(sink));
        let id = manager.add_component(crate::spatial::DEFAULT_CHANNEL, instances_along_x(4));
        scheduler.run_synchronously(|| manager.tick()).unwrap();
        assert_eq!(manager.enabled_instances(id), Some(vec![0]));

        handle.set_transform(ComponentTransform::from_translation(Vec3::new(300.0, 0.0, 0.0)));
        invokers.tick();
        scheduler.run_synchronously(|| manager.tick()).unwrap();
        assert_eq!(manager.enabled_instances(id), Some(vec![3]));
    }

    #[test]
    fn test_unchanged_invoker_does_not_update() {
        let invokers = InvokerManager::new(InvokerTolerances::default());
        let scheduler = TaskScheduler::new(1).unwrap();
        let mut sink = MockCollisionSink::new();
        sink.expect_disable_instances().times(1).return_const(());
        let manager = CollisionManager::new(WORLD, invokers, scheduler.clone(), Arc::new(sink));
        manager.add_component(crate::spatial::DEFAULT_CHANNEL, instances_along_x(2));

        let first = scheduler.run_synchronously(|| manager.tick()).unwrap();
        assert_eq!(first.channels_updated, 1);
        let second = scheduler.run_synchronously(|| manager.tick()).unwrap();
        assert_eq!(second.channels_updated, 0);
    }

    #[test]
    fn test_stale_result_is_requeued() {
        let invokers = InvokerManager::new(InvokerTolerances::default());
        let scheduler = TaskScheduler::new(1).unwrap();
        let sink = Arc::new(MockCollisionSink::new());
        let manager = CollisionManager::new(WORLD, invokers, scheduler.clone(), sink.clone());
        let id = manager.add_component(crate::spatial::DEFAULT_CHANNEL, instances_along_x(2));

        // Snapshot taken, then the component changes before finalize.
        let updater = ComponentUpdater {
            id,
            channel: crate::spatial::DEFAULT_CHANNEL.to_string(),
            instances: instances_along_x(2),
            all_enabled: true,
            old_enabled: None,
            new_enabled: FxHashSet::default(),
            to_enable: Vec::new(),
            to_disable: vec![0, 1],
        };
        finalize(&manager.state, sink.as_ref(), crate::spatial::DEFAULT_CHANNEL, vec![updater]);

        let state = lock(&manager.state);
        assert!(state.channels[crate::spatial::DEFAULT_CHANNEL].update_queued);
        assert!(state.components[&id].all_enabled);
    }

    #[test]
    fn test_empty_channels_are_dropped() {
        let invokers = InvokerManager::new(InvokerTolerances::default());
        let scheduler = TaskScheduler::new(1).unwrap();
        let mut sink = MockCollisionSink::new();
        sink.expect_disable_instances().return_const(());
        let manager = CollisionManager::new(WORLD, invokers, scheduler.clone(), Arc::new(sink));
        let id = manager.add_component("Physics", instances_along_x(1));
        scheduler.run_synchronously(|| manager.tick()).unwrap();

        assert!(manager.remove_component(id));
        let stats = scheduler.run_synchronously(|| manager.tick()).unwrap();
        assert_eq!(stats.channels_removed, 1);
    }
}
