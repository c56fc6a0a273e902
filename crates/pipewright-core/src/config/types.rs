//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for pipewright
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Result cache configuration
    pub cache: CacheConfig,

    /// Execution engine configuration
    pub execution: ExecutionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Which store backs the result cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// One file per entry under the cache directory
    #[default]
    Directory,
    /// In-process only; nothing survives the process
    Memory,
}

/// Result cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory for pipeline caches (default: ~/.pipewright)
    pub directory: Option<PathBuf>,

    /// Storage backend
    pub backend: CacheBackend,
}

impl CacheConfig {
    /// Directory holding the cache of the named pipeline
    pub fn pipeline_dir(&self, pipeline: &str) -> PathBuf {
        self.root_dir().join(pipeline)
    }

    /// Root cache directory, falling back to the default location
    pub fn root_dir(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(super::defaults::default_root_dir)
    }
}

/// How declared input files contribute to a fingerprint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputHashing {
    /// Hash full file contents
    #[default]
    Content,
    /// Hash size and modification time only
    Metadata,
}

/// Execution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum tasks running at once (1 = strictly sequential)
    pub concurrency: usize,

    /// Stop starting new tasks after the first failure
    pub fail_fast: bool,

    /// Default input hashing mode for tasks that don't pick one
    pub input_hashing: InputHashing,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            fail_fast: false,
            input_hashing: InputHashing::Content,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for JSON log files (default: ~/.pipewright/logs)
    pub directory: Option<PathBuf>,

    /// Console filter used when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            level: "warn".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cache.backend, CacheBackend::Directory);
        assert_eq!(config.execution.concurrency, 1);
        assert!(!config.execution.fail_fast);
        assert_eq!(config.execution.input_hashing, InputHashing::Content);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_pipeline_dir() {
        let cache = CacheConfig {
            directory: Some(PathBuf::from("/var/cache/pw")),
            backend: CacheBackend::Directory,
        };
        assert_eq!(cache.pipeline_dir("etl"), PathBuf::from("/var/cache/pw/etl"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("[execution]\nconcurrency = 4\n").unwrap();
        assert_eq!(config.execution.concurrency, 4);
        assert!(!config.execution.fail_fast);
        assert_eq!(config.cache.backend, CacheBackend::Directory);
    }

    #[test]
    fn test_backend_lowercase() {
        let config: Config = serde_yaml::from_str("cache:\n  backend: memory\n").unwrap();
        assert_eq!(config.cache.backend, CacheBackend::Memory);
    }
}
