//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_execution(config)?;
    validate_logging(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_execution(config: &Config) -> Result<()> {
    if config.execution.concurrency == 0 {
        return Err(ConfigError::InvalidValue {
            field: "execution.concurrency".to_string(),
            message: "must be at least 1".to_string(),
        }
        .into());
    }

    Ok(())
}

fn validate_logging(config: &Config) -> Result<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", valid_levels.join(", ")),
        }
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.execution.concurrency = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("execution.concurrency"));
    }

    #[test]
    fn test_unknown_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(validate_config(&config).is_err());
    }
}
