//! Scheduler and query error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Failed to process tasks synchronously. Tasks left: {0}")]
    TasksLeft(usize),

    #[error("Synchronous task processing is not allowed on a worker thread")]
    SynchronousOnWorker,

    #[error("Failed to build worker pool: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Too many voxels requested: {requested} (max {max})")]
    TooManyVoxels { requested: u64, max: u64 },

    #[error("Invalid query step: {0}")]
    InvalidStep(f64),

    #[error("Max recursion depth reached: {depth} (max {max})")]
    ContextTooDeep { depth: u32, max: u32 },
}
