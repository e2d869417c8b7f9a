//! Invoker-driven chunk spawning.
//!
//! Each tick compares the runtime transform and the channel invoker with
//! what the last rebuild used. When either changed, a worker copies the
//! current octree, updates it against the invoker and reports which leaf
//! chunks appeared or disappeared. The result is applied on the privileged
//! thread. At most one rebuild is in flight per spawner; changes arriving
//! meanwhile are picked up by the next tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_MAX_CHUNKS, MAX_LOD, MAX_OCTREE_DEPTH};
use crate::diagnostics::{Diagnostic, DiagnosticsHub};
use crate::math::{ceil_log2, Aabb, Transform};
use crate::query::{TaskScheduler, TaskThread};
use crate::spatial::invoker::Invoker;
use crate::spatial::invoker_manager::InvokerManager;
use crate::spatial::octree::{CellBounds, Octree, OctreeNodeRef};
use crate::spatial::{WorldId, DEFAULT_CHANNEL};
use crate::sync::lock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSpawnerSettings {
    pub world_size: f64,
    pub voxel_size: f64,
    pub chunk_size: i32,
    pub lod: i32,
    pub max_chunks: usize,
    pub invoker_channel: String,
}

impl Default for ChunkSpawnerSettings {
    fn default() -> Self {
        Self {
            world_size: 1.0e6,
            voxel_size: 100.0,
            chunk_size: 32,
            lod: 0,
            max_chunks: DEFAULT_MAX_CHUNKS,
            invoker_channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

impl ChunkSpawnerSettings {
    /// Chunk size rounded up to an even number in `4..=128`, LOD in
    /// `0..=MAX_LOD`.
    pub fn clamped(mut self) -> Self {
        let even = ((self.chunk_size as f64) / 2.0).ceil() as i32 * 2;
        self.chunk_size = even.clamp(4, 128);
        self.lod = self.lod.clamp(0, MAX_LOD);
        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            tracing::warn!("Invalid voxel size {}, using 1", self.voxel_size);
            self.voxel_size = 1.0;
        }
        self
    }

    /// World-space edge length of one leaf chunk.
    pub fn chunk_world_size(&self) -> f64 {
        self.voxel_size * self.chunk_size as f64 * (1u64 << self.lod) as f64
    }

    pub fn size_in_chunks(&self) -> u64 {
        let chunks = (self.world_size / self.chunk_world_size()).ceil();
        if chunks.is_finite() && chunks > 2.0 {
            chunks as u64
        } else {
            2
        }
    }

    pub fn octree_depth(&self) -> u32 {
        ceil_log2(self.size_in_chunks()).min(MAX_OCTREE_DEPTH)
    }
}

static NEXT_CHUNK_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SPAWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one chunk request. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

impl ChunkId {
    pub const INVALID: ChunkId = ChunkId(0);

    pub fn next() -> Self {
        ChunkId(NEXT_CHUNK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpawnerId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkInfo {
    pub id: ChunkId,
    pub lod: i32,
    pub chunk_size: i32,
    /// Local-space bounds.
    pub bounds: Aabb,
    pub cell: CellBounds,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpawnerEvent {
    ChunksAdded { spawner: SpawnerId, chunks: Vec<ChunkInfo> },
    ChunksRemoved { spawner: SpawnerId, chunks: Vec<ChunkInfo> },
    BudgetExceeded { spawner: SpawnerId, max_chunks: usize, num_nodes: usize },
}

/// Outcome of one octree update.
#[derive(Debug, Default)]
pub struct ChunkDiff {
    pub added: Vec<ChunkInfo>,
    pub removed: Vec<ChunkInfo>,
}

/// Updates `tree` against `invoker`, tagging new leaves with fresh ids.
///
/// A node keeps its children while its world bounds intersect the invoker
/// and the tree holds no more than `max_chunks` nodes.
pub fn update_octree(
    tree: &mut Octree<ChunkId>,
    settings: &ChunkSpawnerSettings,
    local_to_world: &Transform,
    invoker: &Invoker,
) -> ChunkDiff {
    let cell_size = settings.chunk_world_size();
    let info = |node: &OctreeNodeRef, id: ChunkId| ChunkInfo {
        id,
        lod: settings.lod,
        chunk_size: settings.chunk_size,
        bounds: node.bounds.to_aabb(cell_size),
        cell: node.bounds,
    };

    let mut added = Vec::new();
    let mut removed = Vec::new();
    tree.update(
        |node, num_nodes| {
            num_nodes <= settings.max_chunks
                && invoker.intersects(&node.bounds.to_aabb(cell_size).transform(local_to_world))
        },
        |node, id| {
            if node.height == 0 {
                *id = ChunkId::next();
                added.push(info(node, *id));
            }
        },
        |node, id| {
            if node.height == 0 && id.is_valid() {
                removed.push(info(node, *id));
            }
        },
    );
    ChunkDiff { added, removed }
}

struct SpawnerState {
    octree: Option<Arc<Octree<ChunkId>>>,
    task_in_progress: bool,
    update_queued: bool,
    recreate_queued: bool,
    last_local_to_world: Option<Transform>,
    last_invoker: Option<Arc<Invoker>>,
    chunks: FxHashMap<ChunkId, ChunkInfo>,
}

pub struct ChunkSpawner {
    id: SpawnerId,
    world: WorldId,
    settings: ChunkSpawnerSettings,
    invokers: Arc<InvokerManager>,
    scheduler: TaskScheduler,
    diagnostics: Arc<DiagnosticsHub>,
    events: Sender<SpawnerEvent>,
    state: Arc<Mutex<SpawnerState>>,
}

impl std::fmt::Debug for ChunkSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSpawner")
            .field("id", &self.id)
            .field("world", &self.world)
            .field("settings", &self.settings)
            .field("chunks", &self.num_chunks())
            .finish()
    }
}

impl ChunkSpawner {
    pub fn new(
        world: WorldId,
        settings: ChunkSpawnerSettings,
        invokers: Arc<InvokerManager>,
        scheduler: TaskScheduler,
        diagnostics: Arc<DiagnosticsHub>,
        events: Sender<SpawnerEvent>,
    ) -> Self {
        let settings = settings.clamped();
        let id = SpawnerId(NEXT_SPAWNER_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(
            "Chunk spawner {} created: depth {}, chunk world size {}",
            id.0,
            settings.octree_depth(),
            settings.chunk_world_size()
        );
        Self {
            id,
            world,
            settings,
            invokers,
            scheduler,
            diagnostics,
            events,
            state: Arc::new(Mutex::new(SpawnerState {
                octree: None,
                task_in_progress: false,
                update_queued: false,
                recreate_queued: false,
                last_local_to_world: None,
                last_invoker: None,
                chunks: FxHashMap::default(),
            })),
        }
    }

    pub fn id(&self) -> SpawnerId {
        self.id
    }

    pub fn settings(&self) -> &ChunkSpawnerSettings {
        &self.settings
    }

    pub fn num_chunks(&self) -> usize {
        lock(&self.state).chunks.len()
    }

    pub fn chunks(&self) -> Vec<ChunkInfo> {
        let mut chunks: Vec<_> = lock(&self.state).chunks.values().cloned().collect();
        chunks.sort_by_key(|c| c.id);
        chunks
    }

    pub fn is_task_in_progress(&self) -> bool {
        lock(&self.state).task_in_progress
    }

    pub fn refresh(&self) {
        lock(&self.state).update_queued = true;
    }

    /// Drops the octree and every chunk on the next update.
    pub fn recreate(&self) {
        let mut state = lock(&self.state);
        state.update_queued = true;
        state.recreate_queued = true;
    }

    /// Privileged-thread tick. Starts a rebuild when the transform or the
    /// invoker changed since the last one.
    pub fn tick(&self, local_to_world: &Transform) {
        let invoker = self.invokers.get_invoker(self.world, &self.settings.invoker_channel);
        let mut state = lock(&self.state);
        if state.task_in_progress {
            return;
        }

        let transform_changed = state.last_local_to_world.as_ref() != Some(local_to_world);
        let invoker_changed = !state
            .last_invoker
            .as_ref()
            .is_some_and(|last| Arc::ptr_eq(last, &invoker));
        if transform_changed || invoker_changed {
            state.last_local_to_world = Some(*local_to_world);
            state.last_invoker = Some(invoker);
            state.update_queued = true;
        }

        if state.update_queued {
            self.update_tree(&mut state);
        }
    }

    fn update_tree(&self, state: &mut SpawnerState) {
        let (Some(local_to_world), Some(invoker)) = (state.last_local_to_world, state.last_invoker.clone()) else {
            return;
        };
        state.update_queued = false;
        state.task_in_progress = true;

        let depth = self.settings.octree_depth();
        let depth_changed = state.octree.as_ref().is_some_and(|t| t.depth() != depth);
        if state.recreate_queued || depth_changed {
            state.recreate_queued = false;
            state.octree = None;
            let removed: Vec<_> = state.chunks.drain().map(|(_, c)| c).collect();
            if !removed.is_empty() {
                tracing::debug!("Chunk spawner {} recreated, dropping {} chunks", self.id.0, removed.len());
                let _ = self.events.send(SpawnerEvent::ChunksRemoved {
                    spawner: self.id,
                    chunks: removed,
                });
            }
        }

        let old_tree = state.octree.clone();
        let settings = self.settings.clone();
        let shared = self.state.clone();
        let scheduler = self.scheduler.clone();
        let events = self.events.clone();
        let diagnostics = self.diagnostics.clone();
        let id = self.id;

        self.scheduler.dispatch(TaskThread::Worker, move || {
            let mut tree = match old_tree {
                Some(tree) => Octree::clone(&tree),
                None => Octree::new(depth),
            };
            let diff = update_octree(&mut tree, &settings, &local_to_world, &invoker);
            let num_nodes = tree.num_nodes();
            let tree = Arc::new(tree);

            scheduler.dispatch(TaskThread::Privileged, move || {
                let mut state = lock(&shared);
                state.task_in_progress = false;
                state.octree = Some(tree);

                for chunk in &diff.removed {
                    state.chunks.remove(&chunk.id);
                }
                for chunk in &diff.added {
                    state.chunks.insert(chunk.id, chunk.clone());
                }
                let total = state.chunks.len();
                drop(state);

                tracing::trace!(
                    "Chunk spawner {}: +{} -{} ({} live)",
                    id.0,
                    diff.added.len(),
                    diff.removed.len(),
                    total
                );
                if !diff.removed.is_empty() {
                    let _ = events.send(SpawnerEvent::ChunksRemoved {
                        spawner: id,
                        chunks: diff.removed,
                    });
                }
                if !diff.added.is_empty() {
                    let _ = events.send(SpawnerEvent::ChunksAdded {
                        spawner: id,
                        chunks: diff.added,
                    });
                }
                if num_nodes >= settings.max_chunks {
                    diagnostics.report(Diagnostic::error(format!(
                        "Chunk spawner {}: max chunks reached ({} nodes, max {})",
                        id.0, num_nodes, settings.max_chunks
                    )));
                    let _ = events.send(SpawnerEvent::BudgetExceeded {
                        spawner: id,
                        max_chunks: settings.max_chunks,
                        num_nodes,
                    });
                }
            });
        });
    }
}
