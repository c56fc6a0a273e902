//! CLI definition and command handling

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use pipewright_core::config::Config;

use commands::{CacheCommand, InitCommand};

/// pipewright - inspect and maintain task result caches
#[derive(Debug, Parser)]
#[command(name = "pipewright")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<std::path::PathBuf>,

    /// Pipeline whose cache to operate on
    #[arg(short, long, global = true, env = "PIPEWRIGHT_PIPELINE", default_value = "default")]
    pub pipeline: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write a default pipewright configuration
    Init(InitCommand),

    /// Inspect and maintain the result cache
    Cache(CacheCommand),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self, config: Config) -> anyhow::Result<()> {
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match self.command {
            Commands::Init(ref cmd) => cmd.execute(&self),
            Commands::Cache(ref cmd) => cmd.execute(&self, &config),
        }
    }
}
