//! # VoxelGraph-RS: voxel compute graphs
//!
//! A compiler and lazy evaluation engine for visual voxel compute graphs,
//! plus the invoker-driven spatial engine that decides where chunks exist
//! and which instances collide.
//!
//! ## Architecture
//!
//! - **Graph**: Declarative graphs are translated into an IR, rewritten by
//!   compile passes and built into immutable executors
//! - **Query**: Futures, dependency tracking and a worker/privileged task
//!   scheduler backed by rayon
//! - **Runtime**: Executor cache, per-operation compute rules and the
//!   service the host ticks
//! - **Spatial**: Invokers, AABB tree, octree chunk spawning and collision
//!   toggling
//! - **Communication**: Crossbeam channels between the host and runtime
//!
//! ## Configuration
//!
//! Engine settings are stored in the platform-appropriate data directory
//! under `dev.hxyulin.voxelgraph-rs`:
//!
//! - **Linux**: `~/.local/share/dev.hxyulin.voxelgraph-rs/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.voxelgraph-rs/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.voxelgraph-rs\`
//!
//! ## Example
//!
//! ```ignore
//! use voxelgraph_rs::{config::EngineConfig, runtime::VoxelRuntime};
//!
//! fn main() -> voxelgraph_rs::Result<()> {
//!     let config = EngineConfig::load_or_default(EngineConfig::default_path()?);
//!     let (mut runtime, bridge) = VoxelRuntime::init(config)?;
//!
//!     bridge.submit_graph(voxelgraph_rs::graph::CompiledGraph::load("terrain.json".as_ref())?);
//!     while runtime.is_running() {
//!         runtime.tick();
//!         for msg in bridge.drain() {
//!             println!("{:?}", msg);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod graph;
pub mod math;
pub mod query;
pub mod runtime;
pub mod spatial;

mod sync;

// Re-export commonly used types
pub use buffer::{Buffer, Value, ValueKind};
pub use config::EngineConfig;
pub use diagnostics::{Diagnostic, DiagnosticsHub, Severity};
pub use error::{Result, ResultExt, VoxelGraphError};
pub use graph::{CompiledGraph, GraphCompiler, GraphId, GraphLibrary, GraphPinRef};
pub use math::{Aabb, Quat, Transform, Vec3};
pub use query::{FutureValue, PositionQuery, Query, QueryParameters, TaskScheduler};
pub use runtime::{Executor, ExecutorManager, RuntimeBridge, RuntimeMessage, RuntimeValue, VoxelRuntime};
pub use spatial::{ChunkSpawner, Invoker, InvokerManager, WorldId};
