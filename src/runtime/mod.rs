//! Executors and the runtime service.
//!
//! ```text
//!  Host ──RuntimeCommand──► VoxelRuntime::tick (privileged thread)
//!   ▲                          │
//!   │                          ├─► GraphLibrary ──► ExecutorManager ──► Executor
//!   │                          ├─► InvokerManager ──► ChunkSpawner / CollisionManager
//!   │                          │
//!   └────RuntimeMessage────────┘  (diagnostics, executor updates, chunk events)
//! ```
//!
//! # Design
//!
//! - **One privileged thread** - compiles, command handling and spatial
//!   finalizers run on the thread that called [`VoxelRuntime::init`].
//! - **Executors are immutable** - a recompile swaps the `Arc`; queries in
//!   flight finish on the executor they started with.
//! - **Bounded bridge** - the host and runtime only share channel ends.

pub mod bridge;
pub mod compute;
pub mod executor;
pub mod manager;
pub mod service;
pub mod value;

pub use bridge::{RuntimeBridge, RuntimeCommand, RuntimeMessage};
pub use compute::ComputeContext;
pub use executor::{CompileStats, Executor, InputSource, RuntimeInput, RuntimeNode, RuntimeOutput};
pub use manager::{ExecutorManager, ExecutorPin, ExecutorUpdate, ManagerSettings, ManagerTickStats};
pub use service::{RuntimeTickStats, VoxelRuntime};
pub use value::{ExecList, ExecTrigger, NodeOutputs, RuntimeValue};
