//! Lazy evaluation substrate.
//!
//! A [`Query`] carries parameters, a call context and a dependency
//! tracker. Evaluating a pin yields a [`FutureValue`]; futures chain into
//! a task graph scheduled by the [`TaskScheduler`].
//!
//! ```text
//! Query ──► Executor::execute ──► FutureValue ──► TaskScheduler (workers / privileged)
//!   │
//!   └─► DependencyTracker ◄── Dependency::invalidate (batched by InvalidationScope)
//! ```

pub mod cached_value;
pub mod dependency;
pub mod error;
pub mod future;
pub mod parameters;
#[allow(clippy::module_inception)]
pub mod query;
pub mod task;

pub use cached_value::CachedValue;
pub use dependency::{Dependency, DependencyRegion, DependencyTracker, InvalidationScope};
pub use error::{QueryError, TaskError, TaskResult};
pub use future::{AnyFutureValue, FutureValue, Promise};
pub use parameters::{GradientStepQuery, GraphParameterValues, LodQuery, PositionQuery, QueryParameter, QueryParameters};
pub use query::{ContextInputs, EvalEnvironment, ExecutorSource, MemoKey, Query, QueryCache, QueryContext};
pub use task::{SchedulerStats, TaskScheduler, TaskThread};
