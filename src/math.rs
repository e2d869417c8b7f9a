//! Small linear-algebra toolkit shared by the spatial engine and the
//! dependency regions.
//!
//! Everything is `f64` and `Copy`. Boxes are closed intervals so that
//! degenerate (flat) query boxes still intersect what they touch.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Neg, Sub};

// ── Vec3 ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::splat(0.0);
    pub const ONE: Vec3 = Vec3::splat(1.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub const fn splat(v: f64) -> Self {
        Self { x: v, y: v, z: v }
    }

    pub fn dot(self, o: Vec3) -> f64 {
        self.x * o.x + self.y * o.y + self.z * o.z
    }

    pub fn cross(self, o: Vec3) -> Vec3 {
        Vec3::new(
            self.y * o.z - self.z * o.y,
            self.z * o.x - self.x * o.z,
            self.x * o.y - self.y * o.x,
        )
    }

    pub fn length_squared(self) -> f64 {
        self.dot(self)
    }

    pub fn length(self) -> f64 {
        self.length_squared().sqrt()
    }

    pub fn normalize_or_zero(self) -> Vec3 {
        let len = self.length();
        if len < 1e-12 {
            Vec3::ZERO
        } else {
            self / len
        }
    }

    pub fn min(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x.min(o.x), self.y.min(o.y), self.z.min(o.z))
    }

    pub fn max(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x.max(o.x), self.y.max(o.y), self.z.max(o.z))
    }

    pub fn abs(self) -> Vec3 {
        Vec3::new(self.x.abs(), self.y.abs(), self.z.abs())
    }

    pub fn max_element(self) -> f64 {
        self.x.max(self.y).max(self.z)
    }

    pub fn component(self, axis: usize) -> f64 {
        match axis {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, s: f64) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }
}

impl Mul<Vec3> for Vec3 {
    type Output = Vec3;
    fn mul(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x * o.x, self.y * o.y, self.z * o.z)
    }
}

impl Div<f64> for Vec3 {
    type Output = Vec3;
    fn div(self, s: f64) -> Vec3 {
        Vec3::new(self.x / s, self.y / s, self.z / s)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;
    fn neg(self) -> Vec3 {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

// ── Quat ─────────────────────────────────────────────────────────────

/// Unit quaternion rotation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub fn from_axis_angle(axis: Vec3, radians: f64) -> Self {
        let axis = axis.normalize_or_zero();
        let (s, c) = (radians * 0.5).sin_cos();
        Self {
            x: axis.x * s,
            y: axis.y * s,
            z: axis.z * s,
            w: c,
        }
    }

    pub fn rotate(self, v: Vec3) -> Vec3 {
        let q = Vec3::new(self.x, self.y, self.z);
        let t = q.cross(v) * 2.0;
        v + t * self.w + q.cross(t)
    }

    /// Angle in radians between two rotations.
    pub fn angle_to(self, o: Quat) -> f64 {
        let d = (self.x * o.x + self.y * o.y + self.z * o.z + self.w * o.w)
            .abs()
            .min(1.0);
        2.0 * d.acos()
    }
}

// ── Transform ────────────────────────────────────────────────────────

/// Affine transform stored as a 3x3 linear part plus a translation.
///
/// `transform_point(p) = linear * p + translation`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Row-major 3x3 linear part.
    pub linear: [[f64; 3]; 3],
    pub translation: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        linear: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        translation: Vec3::ZERO,
    };

    pub fn from_translation(t: Vec3) -> Self {
        Self {
            translation: t,
            ..Self::IDENTITY
        }
    }

    /// Scale, then rotate, then translate.
    pub fn from_trs(translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        let cols = [
            rotation.rotate(Vec3::new(scale.x, 0.0, 0.0)),
            rotation.rotate(Vec3::new(0.0, scale.y, 0.0)),
            rotation.rotate(Vec3::new(0.0, 0.0, scale.z)),
        ];
        let mut linear = [[0.0; 3]; 3];
        for (c, col) in cols.iter().enumerate() {
            linear[0][c] = col.x;
            linear[1][c] = col.y;
            linear[2][c] = col.z;
        }
        Self {
            linear,
            translation,
        }
    }

    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        let m = &self.linear;
        Vec3::new(
            m[0][0] * v.x + m[0][1] * v.y + m[0][2] * v.z,
            m[1][0] * v.x + m[1][1] * v.y + m[1][2] * v.z,
            m[2][0] * v.x + m[2][1] * v.y + m[2][2] * v.z,
        )
    }

    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.transform_vector(p) + self.translation
    }

    pub fn determinant(&self) -> f64 {
        let m = &self.linear;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Inverse transform, `None` when the linear part is singular.
    pub fn inverse(&self) -> Option<Transform> {
        let det = self.determinant();
        if det.abs() < 1e-12 || !det.is_finite() {
            return None;
        }
        let m = &self.linear;
        let inv_det = 1.0 / det;
        let linear = [
            [
                (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
                (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
                (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
            ],
            [
                (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
                (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
                (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
            ],
            [
                (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
                (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
                (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
            ],
        ];
        let partial = Transform {
            linear,
            translation: Vec3::ZERO,
        };
        let translation = -partial.transform_vector(self.translation);
        Some(Transform {
            linear,
            translation,
        })
    }

    /// `self` applied after `first`.
    pub fn then(&self, first: &Transform) -> Transform {
        let mut linear = [[0.0; 3]; 3];
        for (r, row) in linear.iter_mut().enumerate() {
            for (c, out) in row.iter_mut().enumerate() {
                *out = (0..3).map(|k| self.linear[r][k] * first.linear[k][c]).sum();
            }
        }
        Transform {
            linear,
            translation: self.transform_point(first.translation),
        }
    }
}

// ── Aabb ─────────────────────────────────────────────────────────────

/// Axis-aligned box with inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const INFINITE: Aabb = Aabb {
        min: Vec3::splat(f64::NEG_INFINITY),
        max: Vec3::splat(f64::INFINITY),
    };

    /// Empty box, the identity of [`Aabb::union`].
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f64::INFINITY),
        max: Vec3::splat(f64::NEG_INFINITY),
    };

    pub fn new(a: Vec3, b: Vec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn from_center_extent(center: Vec3, extent: Vec3) -> Self {
        let extent = extent.abs();
        Self {
            min: center - extent,
            max: center + extent,
        }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        points
            .into_iter()
            .fold(Aabb::EMPTY, |acc, p| acc.extend_point(p))
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    pub fn is_infinite(&self) -> bool {
        !self.min.is_finite() || !self.max.is_finite()
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn extent(&self) -> Vec3 {
        self.size() * 0.5
    }

    pub fn intersects(&self, o: &Aabb) -> bool {
        self.min.x <= o.max.x
            && o.min.x <= self.max.x
            && self.min.y <= o.max.y
            && o.min.y <= self.max.y
            && self.min.z <= o.max.z
            && o.min.z <= self.max.z
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        self.min.x <= p.x
            && p.x <= self.max.x
            && self.min.y <= p.y
            && p.y <= self.max.y
            && self.min.z <= p.z
            && p.z <= self.max.z
    }

    pub fn contains(&self, o: &Aabb) -> bool {
        self.contains_point(o.min) && self.contains_point(o.max)
    }

    pub fn union(&self, o: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(o.min),
            max: self.max.max(o.max),
        }
    }

    pub fn extend_point(&self, p: Vec3) -> Aabb {
        Aabb {
            min: self.min.min(p),
            max: self.max.max(p),
        }
    }

    pub fn expand(&self, amount: f64) -> Aabb {
        Aabb {
            min: self.min - Vec3::splat(amount),
            max: self.max + Vec3::splat(amount),
        }
    }

    pub fn squared_distance_to_point(&self, p: Vec3) -> f64 {
        let d = (self.min - p).max(Vec3::ZERO).max(p - self.max);
        d.length_squared()
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Bounding box of the transformed corners. Infinite boxes stay infinite.
    pub fn transform(&self, t: &Transform) -> Aabb {
        if self.is_infinite() {
            return Aabb::INFINITE;
        }
        if !self.is_valid() {
            return *self;
        }
        Aabb::from_points(self.corners().into_iter().map(|c| t.transform_point(c)))
    }
}

/// Smallest `n` with `1 << n >= value`.
pub fn ceil_log2(value: u64) -> u32 {
    if value <= 1 {
        0
    } else {
        64 - (value - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-9
    }

    #[test]
    fn test_transform_inverse_round_trip() {
        let t = Transform::from_trs(
            Vec3::new(10.0, -4.0, 2.0),
            Quat::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), 0.7),
            Vec3::new(2.0, 3.0, 0.5),
        );
        let inv = t.inverse().unwrap();
        let p = Vec3::new(1.0, 2.0, 3.0);
        assert!(approx(inv.transform_point(t.transform_point(p)), p));
    }

    #[test]
    fn test_singular_transform_has_no_inverse() {
        let t = Transform::from_trs(Vec3::ZERO, Quat::IDENTITY, Vec3::new(1.0, 0.0, 1.0));
        assert!(t.inverse().is_none());
    }

    #[test]
    fn test_flat_boxes_intersect() {
        let flat = Aabb::new(Vec3::new(900.0, 0.0, 0.0), Vec3::new(1100.0, 0.0, 0.0));
        let cube = Aabb::from_center_extent(Vec3::new(1000.0, 0.0, 0.0), Vec3::splat(100.0));
        assert!(flat.intersects(&cube));
    }

    #[test]
    fn test_squared_distance() {
        let b = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert_eq!(b.squared_distance_to_point(Vec3::new(0.5, 0.5, 0.5)), 0.0);
        assert_eq!(b.squared_distance_to_point(Vec3::new(3.0, 0.5, 0.5)), 4.0);
    }

    #[test]
    fn test_rotated_box_contains_rotated_corners() {
        let b = Aabb::from_center_extent(Vec3::ZERO, Vec3::new(1.0, 2.0, 3.0));
        let t = Transform::from_trs(
            Vec3::ZERO,
            Quat::from_axis_angle(Vec3::new(1.0, 1.0, 0.0), 1.1),
            Vec3::ONE,
        );
        let tb = b.transform(&t);
        for c in b.corners() {
            assert!(tb.expand(1e-9).contains_point(t.transform_point(c)));
        }
    }

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(1024), 10);
        assert_eq!(ceil_log2(1025), 11);
    }
}
