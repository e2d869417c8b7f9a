//! Error handling for voxelgraph-rs
//!
//! Area errors ([`GraphError`], [`TaskError`], [`QueryError`],
//! [`BufferError`]) convert into [`VoxelGraphError`] so that service-level
//! code can use a single `Result` alias.

use thiserror::Error;

use crate::buffer::BufferError;
use crate::graph::error::GraphError;
use crate::query::error::{QueryError, TaskError};

/// Main error type for voxelgraph-rs operations
#[derive(Error, Debug)]
pub enum VoxelGraphError {
    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Graph translation or compilation errors
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Scheduler errors
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// Query construction errors
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Buffer shape errors
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<VoxelGraphError>,
    },
}

impl VoxelGraphError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        VoxelGraphError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for voxelgraph-rs operations
pub type Result<T> = std::result::Result<T, VoxelGraphError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<VoxelGraphError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}
