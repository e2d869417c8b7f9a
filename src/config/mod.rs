//! Configuration module for voxelgraph-rs
//!
//! This module handles engine configuration:
//! - Compiler and evaluation limits
//! - Runtime service settings (worker pool, executor cache)
//! - Default chunk spawner and invoker tolerances
//! - Logging
//!
//! # App Data Location
//!
//! Configuration and log files live in the platform-appropriate location:
//! - **Linux**: `~/.local/share/dev.hxyulin.voxelgraph-rs/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.voxelgraph-rs/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.voxelgraph-rs\`
//!
//! # Files
//!
//! - `voxelgraph.toml` - Engine configuration (a `.json` path is also accepted)
//! - `logs/` - Daily-rolling log files when `[logging] file = true`
//!
//! # Example
//!
//! ```ignore
//! use voxelgraph_rs::config::EngineConfig;
//!
//! let mut config = EngineConfig::load_or_default(EngineConfig::default_path()?);
//! config.runtime.worker_threads = 4;
//! config.save("voxelgraph.toml")?;
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{Result, VoxelGraphError};
use crate::spatial::chunk_spawner::ChunkSpawnerSettings;
use crate::spatial::invoker_manager::InvokerTolerances;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "dev.hxyulin.voxelgraph-rs";

/// Config filename
pub const CONFIG_FILE: &str = "voxelgraph.toml";

/// Log directory name inside the app data directory
pub const LOG_DIR: &str = "logs";

/// Seconds an unused executor stays cached
pub const DEFAULT_EXECUTOR_IDLE_SECS: u64 = 30;

/// Maximum nested function-call depth within one query
pub const MAX_CONTEXT_DEPTH: u32 = 8;

/// Deepest octree a chunk spawner builds
pub const MAX_OCTREE_DEPTH: u32 = 29;

/// Highest chunk spawner LOD
pub const MAX_LOD: i32 = 30;

/// Default live octree node budget per spawner
pub const DEFAULT_MAX_CHUNKS: usize = 100_000;

/// Largest number of positions a single query may request
pub const MAX_VOXELS_PER_QUERY: u64 = 1 << 26;

/// Template and inline-graph expansions allowed per compile
pub const DEFAULT_MAX_TEMPLATE_EXPANSIONS: usize = 1024;

/// Commands handled per runtime tick
pub const DEFAULT_PRIVILEGED_QUEUE_CAPACITY: usize = 256;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir()
        .ok_or_else(|| VoxelGraphError::Config("Could not determine app data directory".to_string()))?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .map_err(|e| VoxelGraphError::Config(format!("Failed to create app data directory: {}", e)))?;
    }

    Ok(dir)
}

/// Get the path to the default config file
pub fn config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Config Format ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

// ==================== Engine Config ====================

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub compiler: CompilerSettings,
    pub runtime: RuntimeSettings,
    pub spawner: ChunkSpawnerSettings,
    pub collision: CollisionSettings,
    pub logging: LoggingSettings,
    pub invoker: InvokerTolerances,
}

impl EngineConfig {
    /// Default config location inside the app data directory
    pub fn default_path() -> Result<PathBuf> {
        config_path().ok_or_else(|| VoxelGraphError::Config("Could not determine config path".to_string()))
    }

    /// Load a config file; the format follows the extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| VoxelGraphError::Config(format!("Failed to read config {:?}: {}", path, e)))?;

        match ConfigFormat::from_path(path) {
            ConfigFormat::Json => serde_json::from_str(&content)
                .map_err(|e| VoxelGraphError::Config(format!("Failed to parse config {:?}: {}", path, e))),
            ConfigFormat::Toml => toml::from_str(&content)
                .map_err(|e| VoxelGraphError::Config(format!("Failed to parse config {:?}: {}", path, e))),
        }
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config; the format follows the extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VoxelGraphError::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let content = match ConfigFormat::from_path(path) {
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| VoxelGraphError::Serialization(format!("Failed to serialize config: {}", e)))?,
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| VoxelGraphError::Serialization(format!("Failed to serialize config: {}", e)))?,
        };

        std::fs::write(path, content)
            .map_err(|e| VoxelGraphError::Config(format!("Failed to write config {:?}: {}", path, e)))
    }

    /// Save to the default location
    pub fn save_default(&self) -> Result<()> {
        let dir = ensure_app_data_dir()?;
        self.save(dir.join(CONFIG_FILE))
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.compiler.max_context_depth, 8);
        assert_eq!(config.runtime.executor_idle_timeout_secs, 30);
        assert_eq!(config.invoker.translation, 1.0);
        assert_eq!(config.invoker.rotation, 0.001);
        assert_eq!(config.invoker.scale, 0.0);
        assert!(!config.logging.file);
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a.JSON")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new("noext")), ConfigFormat::Toml);
    }

    #[test]
    fn test_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            [spawner]
            chunk_size = 16
            lod = 2

            [logging]
            file = true
            "#,
        )
        .unwrap();
        assert_eq!(config.spawner.chunk_size, 16);
        assert_eq!(config.spawner.lod, 2);
        assert_eq!(config.spawner.invoker_channel, "Default");
        assert!(config.logging.file);
        assert_eq!(config.runtime, RuntimeSettings::default());
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = EngineConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, VoxelGraphError::Config(_)));
        assert_eq!(EngineConfig::load_or_default("/definitely/not/here.toml"), EngineConfig::default());
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.json");

        let mut config = EngineConfig::default();
        config.runtime.worker_threads = 3;
        config.spawner.world_size = 4096.0;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
