//! Typed query parameters.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::buffer::value::Value;
use crate::buffer::{Buffer, TypedBuffer};
use crate::math::{Aabb, Vec3};
use crate::query::error::QueryError;

/// Marker for values that can be stored in [`QueryParameters`].
pub trait QueryParameter: Any + Send + Sync + fmt::Debug {}

/// Parameter set keyed by type. Cloning is cheap.
#[derive(Clone, Default)]
pub struct QueryParameters {
    values: FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    names: FxHashMap<TypeId, &'static str>,
}

impl QueryParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<P: QueryParameter>(mut self, parameter: P) -> Self {
        self.insert(parameter);
        self
    }

    pub fn insert<P: QueryParameter>(&mut self, parameter: P) {
        self.values.insert(TypeId::of::<P>(), Arc::new(parameter));
        self.names.insert(TypeId::of::<P>(), std::any::type_name::<P>());
    }

    pub fn get<P: QueryParameter>(&self) -> Option<&P> {
        self.values.get(&TypeId::of::<P>()).and_then(|v| v.downcast_ref::<P>())
    }

    pub fn contains<P: QueryParameter>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<P>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for QueryParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names.values().collect();
        names.sort();
        f.debug_struct("QueryParameters").field("types", &names).finish()
    }
}

// ==================== Positions ====================

/// Where a query is evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionQuery {
    /// `size[0] * size[1]` positions on the plane `z = start.z`, x-major.
    Grid2D { start: Vec3, step: f64, size: [u32; 2] },
    /// `size[0] * size[1] * size[2]` positions, x-major then y then z.
    Grid3D { start: Vec3, step: f64, size: [u32; 3] },
    Sparse {
        /// Positions are gradient samples, not voxels.
        is_gradient: bool,
        bounds: Aabb,
        positions: Arc<Vec<Vec3>>,
    },
}

impl QueryParameter for PositionQuery {}

impl PositionQuery {
    pub fn sparse(positions: Vec<Vec3>) -> Self {
        let bounds = Aabb::from_points(positions.iter().copied());
        PositionQuery::Sparse {
            is_gradient: false,
            bounds,
            positions: Arc::new(positions),
        }
    }

    pub fn num_positions(&self) -> u64 {
        match self {
            PositionQuery::Grid2D { size, .. } => size[0] as u64 * size[1] as u64,
            PositionQuery::Grid3D { size, .. } => size.iter().map(|&s| s as u64).product(),
            PositionQuery::Sparse { positions, .. } => positions.len() as u64,
        }
    }

    pub fn bounds(&self) -> Aabb {
        match self {
            PositionQuery::Grid2D { start, step, size } => {
                let extent = Vec3::new(size[0] as f64 * step, size[1] as f64 * step, 0.0);
                Aabb::new(*start, *start + extent)
            }
            PositionQuery::Grid3D { start, step, size } => {
                let extent = Vec3::new(size[0] as f64, size[1] as f64, size[2] as f64) * *step;
                Aabb::new(*start, *start + extent)
            }
            PositionQuery::Sparse { bounds, .. } => *bounds,
        }
    }

    pub fn step(&self) -> Option<f64> {
        match self {
            PositionQuery::Grid2D { step, .. } | PositionQuery::Grid3D { step, .. } => Some(*step),
            PositionQuery::Sparse { .. } => None,
        }
    }

    /// Materialize the positions, refusing queries above `max_voxels`.
    pub fn positions(&self, max_voxels: u64) -> Result<Buffer, QueryError> {
        let requested = self.num_positions();
        if requested > max_voxels {
            return Err(QueryError::TooManyVoxels {
                requested,
                max: max_voxels,
            });
        }
        if let Some(step) = self.step() {
            if !(step.is_finite() && step > 0.0) {
                return Err(QueryError::InvalidStep(step));
            }
        }

        let positions = match self {
            PositionQuery::Grid2D { start, step, size } => {
                let mut out = Vec::with_capacity(requested as usize);
                for y in 0..size[1] {
                    for x in 0..size[0] {
                        out.push(*start + Vec3::new(x as f64, y as f64, 0.0) * *step);
                    }
                }
                out
            }
            PositionQuery::Grid3D { start, step, size } => {
                let mut out = Vec::with_capacity(requested as usize);
                for z in 0..size[2] {
                    for y in 0..size[1] {
                        for x in 0..size[0] {
                            out.push(*start + Vec3::new(x as f64, y as f64, z as f64) * *step);
                        }
                    }
                }
                out
            }
            PositionQuery::Sparse { positions, .. } => positions.as_ref().clone(),
        };
        Ok(Buffer::Vector(TypedBuffer::from_vec(positions)))
    }
}

// ==================== Scalars ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LodQuery {
    pub lod: i32,
}

impl QueryParameter for LodQuery {}

/// Step used by gradient sampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientStepQuery {
    pub step: f32,
}

impl QueryParameter for GradientStepQuery {}

/// Overrides for graph parameters, keyed by parameter guid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphParameterValues {
    values: FxHashMap<Arc<str>, Value>,
}

impl QueryParameter for GraphParameterValues {}

impl GraphParameterValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, guid: impl Into<Arc<str>>, value: Value) -> Self {
        self.values.insert(guid.into(), value);
        self
    }

    pub fn get(&self, guid: &str) -> Option<Value> {
        self.values.get(guid).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameters_are_keyed_by_type() {
        let params = QueryParameters::new().with(LodQuery { lod: 3 });
        assert_eq!(params.get::<LodQuery>(), Some(&LodQuery { lod: 3 }));
        assert!(params.get::<GradientStepQuery>().is_none());

        let params = params.with(LodQuery { lod: 5 });
        assert_eq!(params.len(), 1);
        assert_eq!(params.get::<LodQuery>().map(|l| l.lod), Some(5));
    }

    #[test]
    fn test_grid3d_positions_are_x_major() {
        let query = PositionQuery::Grid3D {
            start: Vec3::new(1.0, 0.0, 0.0),
            step: 2.0,
            size: [2, 2, 1],
        };
        let buffer = query.positions(100).unwrap();
        let positions = buffer.as_vector().unwrap().as_slice().to_vec();
        assert_eq!(
            positions,
            vec![
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(3.0, 0.0, 0.0),
                Vec3::new(1.0, 2.0, 0.0),
                Vec3::new(3.0, 2.0, 0.0),
            ]
        );
        assert_eq!(query.bounds().max, Vec3::new(5.0, 4.0, 2.0));
    }

    #[test]
    fn test_too_many_voxels_is_rejected() {
        let query = PositionQuery::Grid2D {
            start: Vec3::ZERO,
            step: 1.0,
            size: [1000, 1000],
        };
        assert_eq!(
            query.positions(1024),
            Err(QueryError::TooManyVoxels {
                requested: 1_000_000,
                max: 1024
            })
        );
    }

    #[test]
    fn test_zero_step_is_invalid() {
        let query = PositionQuery::Grid2D {
            start: Vec3::ZERO,
            step: 0.0,
            size: [2, 2],
        };
        assert_eq!(query.positions(16), Err(QueryError::InvalidStep(0.0)));
    }

    #[test]
    fn test_sparse_bounds_cover_points() {
        let query = PositionQuery::sparse(vec![Vec3::new(-1.0, 2.0, 0.0), Vec3::new(3.0, -4.0, 1.0)]);
        assert_eq!(query.num_positions(), 2);
        assert_eq!(query.bounds().min, Vec3::new(-1.0, -4.0, 0.0));
    }
}
