//! Registry of invoker components and the per-(world, channel) unions built
//! from them.
//!
//! Components register through [`InvokerManager::add_invoker`] and stay
//! registered for as long as the returned [`InvokerHandle`] lives. Any
//! registration change only queues a rebuild; the channel map is swapped in
//! by [`InvokerManager::tick`], so readers never observe a half-built map.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};

use crate::math::{Quat, Transform, Vec3};
use crate::spatial::invoker::Invoker;
use crate::spatial::WorldId;
use crate::sync::{lock, read, write};

new_key_type! {
    pub struct InvokerKey;
}

/// Movement below these thresholds does not rebuild the invoker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerTolerances {
    pub translation: f64,
    /// Radians.
    pub rotation: f64,
    pub scale: f64,
}

impl Default for InvokerTolerances {
    fn default() -> Self {
        Self {
            translation: 1.0,
            rotation: 0.001,
            scale: 0.0,
        }
    }
}

/// Component transform kept decomposed so tolerances can be checked per
/// channel of motion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentTransform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl ComponentTransform {
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }

    pub fn to_transform(&self) -> Transform {
        Transform::from_trs(self.translation, self.rotation, self.scale)
    }

    /// True when `other` moved, rotated or scaled past the tolerances.
    pub fn differs(&self, other: &ComponentTransform, tolerances: &InvokerTolerances) -> bool {
        (self.translation - other.translation).length() > tolerances.translation
            || self.rotation.angle_to(other.rotation) > tolerances.rotation
            || (self.scale - other.scale).abs().max_element() > tolerances.scale
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InvokerShape {
    Sphere { radius: f64 },
    Box { extent: Vec3 },
}

impl InvokerShape {
    fn build(&self, transform: &ComponentTransform) -> Invoker {
        let local_to_world = transform.to_transform();
        match *self {
            InvokerShape::Sphere { radius } => Invoker::sphere(&local_to_world, radius),
            InvokerShape::Box { extent } => Invoker::oriented_box(&local_to_world, extent),
        }
    }
}

/// Everything a component contributes.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokerComponent {
    pub world: WorldId,
    pub channels: BTreeSet<String>,
    pub shape: InvokerShape,
    pub transform: ComponentTransform,
    pub tolerances: InvokerTolerances,
}

impl InvokerComponent {
    pub fn sphere(world: WorldId, radius: f64) -> Self {
        Self::new(world, InvokerShape::Sphere { radius })
    }

    pub fn cube(world: WorldId, extent: Vec3) -> Self {
        Self::new(world, InvokerShape::Box { extent })
    }

    fn new(world: WorldId, shape: InvokerShape) -> Self {
        Self {
            world,
            channels: BTreeSet::from([crate::spatial::DEFAULT_CHANNEL.to_string()]),
            shape,
            transform: ComponentTransform::from_translation(Vec3::ZERO),
            tolerances: InvokerTolerances::default(),
        }
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_transform(mut self, transform: ComponentTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_tolerances(mut self, tolerances: InvokerTolerances) -> Self {
        self.tolerances = tolerances;
        self
    }
}

struct Registered {
    component: InvokerComponent,
    invoker: Arc<Invoker>,
}

type ChannelMap = FxHashMap<WorldId, FxHashMap<String, Arc<Invoker>>>;

pub struct InvokerManager {
    registered: Mutex<SlotMap<InvokerKey, Registered>>,
    rebuild_queued: AtomicBool,
    channels: RwLock<ChannelMap>,
    dummy: Arc<Invoker>,
    default_tolerances: InvokerTolerances,
}

impl std::fmt::Debug for InvokerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerManager")
            .field("invokers", &self.num_invokers())
            .field("rebuild_queued", &self.is_rebuild_queued())
            .finish()
    }
}

impl InvokerManager {
    pub fn new(default_tolerances: InvokerTolerances) -> Arc<Self> {
        Arc::new(Self {
            registered: Mutex::new(SlotMap::with_key()),
            rebuild_queued: AtomicBool::new(false),
            channels: RwLock::new(ChannelMap::default()),
            dummy: Arc::new(Invoker::Dummy),
            default_tolerances,
        })
    }

    pub fn default_tolerances(&self) -> InvokerTolerances {
        self.default_tolerances
    }

    /// Current invoker for a channel, the shared dummy when there is none.
    pub fn get_invoker(&self, world: WorldId, channel: &str) -> Arc<Invoker> {
        read(&self.channels)
            .get(&world)
            .and_then(|channels| channels.get(channel))
            .cloned()
            .unwrap_or_else(|| self.dummy.clone())
    }

    pub fn add_invoker(self: &Arc<Self>, component: InvokerComponent) -> InvokerHandle {
        let invoker = Arc::new(component.shape.build(&component.transform));
        let key = lock(&self.registered).insert(Registered { component, invoker });
        self.rebuild_queued.store(true, Ordering::Release);
        InvokerHandle {
            manager: Arc::downgrade(self),
            key,
        }
    }

    pub fn num_invokers(&self) -> usize {
        lock(&self.registered).len()
    }

    pub fn is_rebuild_queued(&self) -> bool {
        self.rebuild_queued.load(Ordering::Acquire)
    }

    /// Rebuilds the channel map if anything changed. Returns whether it did.
    pub fn tick(&self) -> bool {
        if !self.rebuild_queued.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.rebuild_channel_invokers();
        true
    }

    fn rebuild_channel_invokers(&self) {
        let mut grouped: FxHashMap<WorldId, FxHashMap<String, Vec<Arc<Invoker>>>> = FxHashMap::default();
        for registered in lock(&self.registered).values() {
            let channels = grouped.entry(registered.component.world).or_default();
            for channel in &registered.component.channels {
                channels.entry(channel.clone()).or_default().push(registered.invoker.clone());
            }
        }

        let mut rebuilt = ChannelMap::default();
        for (world, channels) in grouped {
            let map = rebuilt.entry(world).or_default();
            for (channel, invokers) in channels {
                map.insert(channel, Invoker::union(invokers));
            }
        }

        let num_channels: usize = rebuilt.values().map(|c| c.len()).sum();
        *write(&self.channels) = rebuilt;
        tracing::debug!("Invoker channels rebuilt: {} channels", num_channels);
    }

    pub fn log_all_invokers(&self) {
        let registered = lock(&self.registered);
        for (key, r) in registered.iter() {
            tracing::info!(
                "{:?} world {} channels {:?}: {} {:?}",
                key,
                r.component.world.0,
                r.component.channels,
                r.invoker.kind(),
                r.component.shape
            );
        }
    }

    fn remove(&self, key: InvokerKey) {
        if lock(&self.registered).remove(key).is_some() {
            self.rebuild_queued.store(true, Ordering::Release);
        }
    }

    fn update(&self, key: InvokerKey, f: impl FnOnce(&mut InvokerComponent) -> bool) -> bool {
        let mut registered = lock(&self.registered);
        let Some(entry) = registered.get_mut(key) else {
            return false;
        };
        if !f(&mut entry.component) {
            return false;
        }
        entry.invoker = Arc::new(entry.component.shape.build(&entry.component.transform));
        self.rebuild_queued.store(true, Ordering::Release);
        true
    }
}

/// Keeps a component registered. Dropping it unregisters the component
/// and queues a rebuild.
#[derive(Debug)]
pub struct InvokerHandle {
    manager: Weak<InvokerManager>,
    key: InvokerKey,
}

impl InvokerHandle {
    pub fn key(&self) -> InvokerKey {
        self.key
    }

    /// Moves the component. Returns `false` when the change is within the
    /// component's tolerances and nothing was rebuilt.
    pub fn set_transform(&self, transform: ComponentTransform) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        manager.update(self.key, |component| {
            if !component.transform.differs(&transform, &component.tolerances) {
                return false;
            }
            component.transform = transform;
            true
        })
    }

    pub fn set_shape(&self, shape: InvokerShape) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        manager.update(self.key, |component| {
            if component.shape == shape {
                return false;
            }
            component.shape = shape;
            true
        })
    }

    pub fn set_channels<I, S>(&self, channels: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: BTreeSet<String> = channels.into_iter().map(Into::into).collect();
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        manager.update(self.key, |component| {
            if component.channels == channels {
                return false;
            }
            component.channels = channels;
            true
        })
    }
}

impl Drop for InvokerHandle {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Aabb;
    use crate::spatial::DEFAULT_CHANNEL;

    const WORLD: WorldId = WorldId(1);

    fn probe(x: f64) -> Aabb {
        Aabb::from_center_extent(Vec3::new(x, 0.0, 0.0), Vec3::splat(1.0))
    }

    #[test]
    fn test_missing_channel_is_dummy() {
        let manager = InvokerManager::new(InvokerTolerances::default());
        assert!(manager.get_invoker(WORLD, DEFAULT_CHANNEL).is_dummy());
    }

    #[test]
    fn test_rebuild_only_on_tick() {
        let manager = InvokerManager::new(InvokerTolerances::default());
        let _handle = manager.add_invoker(InvokerComponent::sphere(WORLD, 10.0));
        assert!(manager.get_invoker(WORLD, DEFAULT_CHANNEL).is_dummy());

        assert!(manager.tick());
        assert!(manager.get_invoker(WORLD, DEFAULT_CHANNEL).intersects(&probe(0.0)));
        assert!(!manager.tick());
    }

    #[test]
    fn test_drop_handle_queues_rebuild() {
        let manager = InvokerManager::new(InvokerTolerances::default());
        let handle = manager.add_invoker(InvokerComponent::sphere(WORLD, 10.0));
        manager.tick();

        drop(handle);
        assert!(manager.is_rebuild_queued());
        manager.tick();
        assert_eq!(manager.num_invokers(), 0);
        assert!(manager.get_invoker(WORLD, DEFAULT_CHANNEL).is_dummy());
    }

    #[test]
    fn test_transform_tolerance() {
        let manager = InvokerManager::new(InvokerTolerances::default());
        let handle = manager.add_invoker(InvokerComponent::sphere(WORLD, 10.0));
        manager.tick();
        let before = manager.get_invoker(WORLD, DEFAULT_CHANNEL);

        assert!(!handle.set_transform(ComponentTransform::from_translation(Vec3::new(0.5, 0.0, 0.0))));
        assert!(!manager.tick());

        assert!(handle.set_transform(ComponentTransform::from_translation(Vec3::new(100.0, 0.0, 0.0))));
        assert!(manager.tick());
        let after = manager.get_invoker(WORLD, DEFAULT_CHANNEL);
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.intersects(&probe(100.0)));
        assert!(!after.intersects(&probe(0.0)));
    }

    #[test]
    fn test_channels_and_worlds_are_separate() {
        let manager = InvokerManager::new(InvokerTolerances::default());
        let _a = manager.add_invoker(InvokerComponent::sphere(WORLD, 10.0).with_channels(["Collision"]));
        let _b = manager.add_invoker(InvokerComponent::sphere(WorldId(2), 10.0));
        manager.tick();

        assert!(manager.get_invoker(WORLD, DEFAULT_CHANNEL).is_dummy());
        assert!(!manager.get_invoker(WORLD, "Collision").is_dummy());
        assert!(!manager.get_invoker(WorldId(2), DEFAULT_CHANNEL).is_dummy());
    }

    #[test]
    fn test_multiple_invokers_form_union() {
        let manager = InvokerManager::new(InvokerTolerances::default());
        let _a = manager.add_invoker(InvokerComponent::sphere(WORLD, 10.0));
        let _b = manager.add_invoker(
            InvokerComponent::cube(WORLD, Vec3::splat(5.0))
                .with_transform(ComponentTransform::from_translation(Vec3::new(200.0, 0.0, 0.0))),
        );
        manager.tick();

        let invoker = manager.get_invoker(WORLD, DEFAULT_CHANNEL);
        assert_eq!(invoker.kind(), "union");
        assert!(invoker.intersects(&probe(0.0)));
        assert!(invoker.intersects(&probe(200.0)));
        assert!(!invoker.intersects(&probe(100.0)));
    }
}
