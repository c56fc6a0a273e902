//! Exit codes for the CLI

use pipewright_core::PipewrightError;
use pipewright_tasks::{CacheError, PipelineError};

/// General error
pub const ERROR: i32 = 1;

/// Configuration error
pub const CONFIG_ERROR: i32 = 2;

/// Cache store could not be read or written
pub const CACHE_ERROR: i32 = 3;

/// Exit code for an error surfaced by a command
pub fn for_error(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<PipewrightError>().is_some() {
        CONFIG_ERROR
    } else if error.downcast_ref::<CacheError>().is_some()
        || matches!(error.downcast_ref::<PipelineError>(), Some(PipelineError::Cache(_)))
    {
        CACHE_ERROR
    } else {
        ERROR
    }
}
