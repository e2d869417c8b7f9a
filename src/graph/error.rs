//! Graph compiler error types.
//!
//! User-attributable problems (bad links, wildcards, loops) are reported as
//! diagnostics first; the pass that found them then fails with
//! [`GraphError::PassFailed`] so that compilation stops.

use crate::graph::id::{GraphId, IrNodeId, IrPinId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Pass '{pass}' failed with {errors} error(s)")]
    PassFailed { pass: &'static str, errors: usize },

    #[error("Translation of graph {graph} failed with {errors} error(s)")]
    TranslationFailed { graph: GraphId, errors: usize },

    #[error("Invalid link: {0}")]
    InvalidLink(String),

    #[error("Unknown IR node {0:?}")]
    UnknownNode(IrNodeId),

    #[error("Unknown IR pin {0:?}")]
    UnknownPin(IrPinId),

    #[error("Graph {0} not found")]
    GraphNotFound(GraphId),

    #[error("Template expansion limit of {0} exceeded")]
    TemplateLimit(usize),

    #[error("Internal compiler error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Graph serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;
