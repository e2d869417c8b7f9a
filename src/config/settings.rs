//! Section types of [`EngineConfig`](super::EngineConfig).
//!
//! Every section is `#[serde(default)]`, so a config file only needs to
//! name the values it overrides.
//!
//! # Main Types
//!
//! - [`CompilerSettings`] - Template expansion and call-depth limits
//! - [`RuntimeSettings`] - Worker pool and executor cache
//! - [`CollisionSettings`] - Instanced collision manager
//! - [`LoggingSettings`] - Filter and optional log file

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    DEFAULT_EXECUTOR_IDLE_SECS, DEFAULT_MAX_TEMPLATE_EXPANSIONS, DEFAULT_PRIVILEGED_QUEUE_CAPACITY, MAX_CONTEXT_DEPTH,
};

/// Limits applied while compiling and evaluating graphs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerSettings {
    /// Template and inline-graph expansions allowed per compile
    pub max_template_expansions: usize,

    /// Nested function-call contexts allowed per query
    pub max_context_depth: u32,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            max_template_expansions: DEFAULT_MAX_TEMPLATE_EXPANSIONS,
            max_context_depth: MAX_CONTEXT_DEPTH,
        }
    }
}

/// Runtime service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Worker pool size, 0 lets the pool decide
    pub worker_threads: usize,

    /// Seconds an unused executor is kept alive
    pub executor_idle_timeout_secs: u64,

    /// Commands handled per tick before yielding
    pub privileged_queue_capacity: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            executor_idle_timeout_secs: DEFAULT_EXECUTOR_IDLE_SECS,
            privileged_queue_capacity: DEFAULT_PRIVILEGED_QUEUE_CAPACITY,
        }
    }
}

impl RuntimeSettings {
    pub fn executor_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_idle_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionSettings {
    pub enabled: bool,
}

impl Default for CollisionSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Also write a daily-rolling log file into the app data directory
    pub file: bool,

    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            file: false,
            filter: "info,voxelgraph_rs=debug".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_defaults() {
        let settings = RuntimeSettings::default();
        assert_eq!(settings.worker_threads, 0);
        assert_eq!(settings.executor_idle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_section_uses_defaults() {
        let compiler: CompilerSettings = toml::from_str("max_template_expansions = 4").unwrap();
        assert_eq!(compiler.max_template_expansions, 4);
        assert_eq!(compiler.max_context_depth, MAX_CONTEXT_DEPTH);
    }
}
