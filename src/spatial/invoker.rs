//! Immutable spatial predicates deciding which regions deserve evaluation.
//!
//! Invokers are shared as `Arc<Invoker>`; consumers detect changes by
//! pointer identity, never by value.

use std::fmt;
use std::sync::Arc;

use crate::math::{Aabb, Transform, Vec3};
use crate::spatial::aabb_tree::{AabbElement, AabbTree};

/// Sphere around the component origin. The radius is in world space and
/// ignores the component scale.
#[derive(Debug, Clone, PartialEq)]
pub struct SphereInvoker {
    pub center: Vec3,
    pub radius: f64,
    bounds: Aabb,
}

impl SphereInvoker {
    pub fn new(local_to_world: &Transform, radius: f64) -> Self {
        let radius = radius.max(0.0);
        let center = local_to_world.transform_point(Vec3::ZERO);
        Self {
            center,
            radius,
            bounds: Aabb::from_center_extent(center, Vec3::splat(radius)),
        }
    }

    fn intersects(&self, query: &Aabb) -> bool {
        self.bounds.intersects(query) && query.squared_distance_to_point(self.center) < self.radius * self.radius
    }
}

/// Oriented box: a local-space box seen through the component transform.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxInvoker {
    pub local_box: Aabb,
    world_to_local: Transform,
    bounds: Aabb,
}

impl BoxInvoker {
    /// `None` when the transform cannot be inverted.
    pub fn new(local_to_world: &Transform, extent: Vec3) -> Option<Self> {
        let world_to_local = local_to_world.inverse()?;
        let local_box = Aabb::from_center_extent(Vec3::ZERO, extent);
        Some(Self {
            local_box,
            world_to_local,
            bounds: local_box.transform(local_to_world),
        })
    }

    fn intersects(&self, query: &Aabb) -> bool {
        self.bounds.intersects(query) && query.transform(&self.world_to_local).intersects(&self.local_box)
    }
}

/// Several invokers behind a bounding-box tree.
pub struct InvokerUnion {
    members: Vec<Arc<Invoker>>,
    tree: AabbTree,
    bounds: Aabb,
}

impl InvokerUnion {
    pub fn members(&self) -> &[Arc<Invoker>] {
        &self.members
    }
}

impl fmt::Debug for InvokerUnion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokerUnion")
            .field("members", &self.members.len())
            .field("bounds", &self.bounds)
            .finish()
    }
}

#[derive(Debug)]
pub enum Invoker {
    /// Intersects nothing. Returned for channels without invokers.
    Dummy,
    Sphere(SphereInvoker),
    Box(BoxInvoker),
    Union(InvokerUnion),
}

impl Invoker {
    pub fn sphere(local_to_world: &Transform, radius: f64) -> Self {
        Invoker::Sphere(SphereInvoker::new(local_to_world, radius))
    }

    /// Singular transforms degrade to [`Invoker::Dummy`].
    pub fn oriented_box(local_to_world: &Transform, extent: Vec3) -> Self {
        match BoxInvoker::new(local_to_world, extent) {
            Some(b) => Invoker::Box(b),
            None => {
                tracing::warn!("Box invoker with a singular transform ignored");
                Invoker::Dummy
            }
        }
    }

    /// Zero members give a dummy, one member is passed through unchanged.
    pub fn union(mut members: Vec<Arc<Invoker>>) -> Arc<Invoker> {
        members.retain(|m| !matches!(**m, Invoker::Dummy));
        match members.len() {
            0 => Arc::new(Invoker::Dummy),
            1 => members.remove(0),
            _ => {
                let elements = members
                    .iter()
                    .enumerate()
                    .map(|(index, m)| AabbElement {
                        bounds: m.bounds(),
                        index,
                    })
                    .collect();
                let bounds = members.iter().fold(Aabb::EMPTY, |acc, m| acc.union(&m.bounds()));
                Arc::new(Invoker::Union(InvokerUnion {
                    members,
                    tree: AabbTree::new(elements),
                    bounds,
                }))
            }
        }
    }

    /// World-space bounds. Nothing outside them can intersect.
    pub fn bounds(&self) -> Aabb {
        match self {
            Invoker::Dummy => Aabb::EMPTY,
            Invoker::Sphere(s) => s.bounds,
            Invoker::Box(b) => b.bounds,
            Invoker::Union(u) => u.bounds,
        }
    }

    pub fn intersects(&self, query: &Aabb) -> bool {
        match self {
            Invoker::Dummy => false,
            Invoker::Sphere(s) => s.intersects(query),
            Invoker::Box(b) => b.intersects(query),
            Invoker::Union(u) => {
                u.bounds.intersects(query) && u.tree.overlap(query, |i| u.members[i].intersects(query))
            }
        }
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self, Invoker::Dummy)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Invoker::Dummy => "dummy",
            Invoker::Sphere(_) => "sphere",
            Invoker::Box(_) => "box",
            Invoker::Union(_) => "union",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Quat;

    fn at(x: f64, y: f64, z: f64) -> Transform {
        Transform::from_translation(Vec3::new(x, y, z))
    }

    #[test]
    fn test_dummy_never_intersects() {
        assert!(!Invoker::Dummy.intersects(&Aabb::INFINITE));
    }

    #[test]
    fn test_sphere_uses_distance_not_bounds() {
        let s = Invoker::sphere(&Transform::IDENTITY, 10.0);
        // Inside the bounding cube corner but outside the sphere.
        let corner = Aabb::from_center_extent(Vec3::splat(9.0), Vec3::splat(0.1));
        assert!(!s.intersects(&corner));
        let near = Aabb::from_center_extent(Vec3::new(9.0, 0.0, 0.0), Vec3::splat(0.1));
        assert!(s.intersects(&near));
    }

    #[test]
    fn test_sphere_radius_ignores_scale() {
        let t = Transform::from_trs(Vec3::new(5.0, 0.0, 0.0), Quat::IDENTITY, Vec3::splat(4.0));
        let s = Invoker::sphere(&t, 1.0);
        let far = Aabb::from_center_extent(Vec3::new(8.0, 0.0, 0.0), Vec3::splat(0.1));
        assert!(!s.intersects(&far));
    }

    #[test]
    fn test_rotated_box() {
        let t = Transform::from_trs(
            Vec3::ZERO,
            Quat::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), std::f64::consts::FRAC_PI_4),
            Vec3::ONE,
        );
        let b = Invoker::oriented_box(&t, Vec3::new(10.0, 1.0, 1.0));
        let along_diagonal = Aabb::from_center_extent(Vec3::new(6.0, 6.0, 0.0), Vec3::splat(0.1));
        let along_x = Aabb::from_center_extent(Vec3::new(9.0, 0.0, 0.0), Vec3::splat(0.1));
        assert!(b.intersects(&along_diagonal));
        assert!(!b.intersects(&along_x));
    }

    #[test]
    fn test_singular_box_is_dummy() {
        let t = Transform::from_trs(Vec3::ZERO, Quat::IDENTITY, Vec3::new(0.0, 1.0, 1.0));
        assert!(Invoker::oriented_box(&t, Vec3::ONE).is_dummy());
    }

    #[test]
    fn test_union_of_one_passes_through() {
        let s = Arc::new(Invoker::sphere(&Transform::IDENTITY, 1.0));
        let u = Invoker::union(vec![s.clone(), Arc::new(Invoker::Dummy)]);
        assert!(Arc::ptr_eq(&s, &u));
    }

    #[test]
    fn test_sphere_and_box_union() {
        let sphere = Arc::new(Invoker::sphere(&Transform::IDENTITY, 500.0));
        let boxed = Arc::new(Invoker::oriented_box(&at(1000.0, 0.0, 0.0), Vec3::splat(100.0)));
        let union = Invoker::union(vec![sphere.clone(), boxed.clone()]);

        let query = Aabb::new(Vec3::new(900.0, 0.0, 0.0), Vec3::new(1100.0, 0.0, 0.0));
        assert!(!sphere.intersects(&query));
        assert!(boxed.intersects(&query));
        assert!(union.intersects(&query));

        let between = Aabb::new(Vec3::new(600.0, 0.0, 0.0), Vec3::new(800.0, 0.0, 0.0));
        assert!(!union.intersects(&between));
        assert_eq!(union.kind(), "union");
    }
}
