//! Pipewright Core - shared configuration and error types
//!
//! This crate provides the error taxonomy and the configuration layer
//! (file discovery, parsing, defaults and validation) used by the task
//! engine and the CLI.

pub mod config;
pub mod error;

pub use config::{CacheBackend, CacheConfig, Config, ExecutionConfig, InputHashing, LoggingConfig};
pub use error::{ConfigError, PipewrightError, Result};
