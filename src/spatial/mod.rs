//! Invoker-driven spatial engine.
//!
//! ```text
//! InvokerHandle ──► InvokerManager ──tick──► (world, channel) → Arc<Invoker>
//!                                              │
//!                        ┌─────────────────────┴──────────────────┐
//!                        ▼                                        ▼
//!                  ChunkSpawner                           CollisionManager
//!            (octree diff on a worker)            (instance diff on a worker)
//!                        │                                        │
//!                        ▼                                        ▼
//!              SpawnerEvent channel                        CollisionSink
//! ```
//!
//! # Design
//!
//! - Invokers are immutable and compared by `Arc` identity.
//! - Heavy spatial tests run on the worker pool; results are applied on
//!   the privileged thread.
//! - One rebuild in flight per spawner or collision channel, guarded by a
//!   flag instead of a lock.

pub mod aabb_tree;
pub mod chunk_spawner;
pub mod collision;
pub mod invoker;
pub mod invoker_manager;
pub mod octree;

use serde::{Deserialize, Serialize};

pub use aabb_tree::{AabbElement, AabbTree};
pub use chunk_spawner::{update_octree, ChunkDiff, ChunkId, ChunkInfo, ChunkSpawner, ChunkSpawnerSettings, SpawnerEvent, SpawnerId};
pub use collision::{CollisionComponentId, CollisionManager, CollisionSink, InstanceSet};
pub use invoker::Invoker;
pub use invoker_manager::{ComponentTransform, InvokerComponent, InvokerHandle, InvokerManager, InvokerShape, InvokerTolerances};
pub use octree::{CellBounds, Octree, OctreeNodeRef};

/// Channel used when a component or spawner does not name one.
pub const DEFAULT_CHANNEL: &str = "Default";

/// Opaque world identity; invokers in different worlds never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct WorldId(pub u64);
