//! Default configuration values

use std::path::PathBuf;

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "pipewright.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "pipewright.yaml";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".pipewright.toml",
        ".pipewright.yaml",
    ]
}

/// Default root for caches and logs: `~/.pipewright`
pub fn default_root_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".pipewright")
}

/// Default log directory: `~/.pipewright/logs`
pub fn default_log_dir() -> PathBuf {
    default_root_dir().join("logs")
}

/// Generate default configuration TOML
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| DEFAULT_CONFIG_TEMPLATE.to_string())
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# pipewright configuration

[cache]
backend = "directory"

[execution]
concurrency = 1
fail_fast = false
input_hashing = "content"

[logging]
level = "warn"
"#;
