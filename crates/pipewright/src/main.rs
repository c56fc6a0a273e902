//! pipewright - result cache maintenance CLI

mod cli;
mod exit_codes;

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use pipewright_core::config::{default_log_dir, find_config, load_config, LoggingConfig};

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    let start_dir = match &cli.directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    let config_path = find_config(&start_dir);
    let config = match config_path.as_deref().map(load_config).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            cli::output::error(&e.to_string());
            std::process::exit(exit_codes::CONFIG_ERROR);
        }
    };
    let guard = init_tracing(&config.logging, cli.verbose);

    match &config_path {
        Some(path) => tracing::debug!(path = %path.display(), "using configuration"),
        None => tracing::debug!("no configuration file found, using defaults"),
    }

    if let Err(e) = cli.execute(config) {
        cli::output::error(&format!("{:#}", e));
        let code = exit_codes::for_error(&e);
        // Flush the file log before exiting
        drop(guard);
        std::process::exit(code);
    }
}

/// Set up tracing with two layers:
/// - Console: RUST_LOG, else `--verbose`, else the configured level
/// - File: always debug-level JSON under the log directory
fn init_tracing(
    logging: &LoggingConfig,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_dir = logging.directory.clone().unwrap_or_else(default_log_dir);
    if let Some(log_dir) = ensure_dir(&log_dir) {
        let file_appender = tracing_appender::rolling::daily(&log_dir, "pipewright.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_filter(EnvFilter::new("debug")),
            )
            .init();

        return Some(guard);
    }

    // Fallback: console only
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    None
}

fn ensure_dir(dir: &Path) -> Option<PathBuf> {
    std::fs::create_dir_all(dir).ok()?;
    Some(dir.to_path_buf())
}
