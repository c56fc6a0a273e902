//! Error types for pipewright

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using PipewrightError
pub type Result<T> = std::result::Result<T, PipewrightError>;

/// Main error type for pipewright configuration and setup
#[derive(Debug, Error)]
pub enum PipewrightError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_is_transparent() {
        let err: PipewrightError = ConfigError::InvalidValue {
            field: "execution.concurrency".to_string(),
            message: "must be at least 1".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: execution.concurrency - must be at least 1"
        );
    }
}
