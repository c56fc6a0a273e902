//! Cache management command

use clap::{Args, Subcommand};
use console::style;

use pipewright_core::config::{CacheBackend, Config};
use pipewright_tasks::{CacheEntry, ExpiryContext, ResultCache};

use crate::cli::output;
use crate::cli::{Cli, OutputFormat};

/// Result cache management
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show cache statistics
    Status(CacheStatusCommand),
    /// List cached results and whether they are still valid
    List(CacheListCommand),
    /// Remove expired entries
    Prune(CachePruneCommand),
    /// Remove a single entry by key or unique key prefix
    Evict(CacheEvictCommand),
    /// Clear all cached entries
    Clean(CacheCleanCommand),
}

/// Show cache statistics
#[derive(Debug, Args)]
pub struct CacheStatusCommand;

/// List cached results
#[derive(Debug, Args)]
pub struct CacheListCommand {
    /// Only show entries produced by this task
    #[arg(long)]
    pub task: Option<String>,
}

/// Remove expired entries
#[derive(Debug, Args)]
pub struct CachePruneCommand {
    /// Dry run - show what would be pruned
    #[arg(long)]
    pub dry_run: bool,
}

/// Remove one entry
#[derive(Debug, Args)]
pub struct CacheEvictCommand {
    /// Full key or unique prefix
    pub key: String,
}

/// Clear all cached entries
#[derive(Debug, Args)]
pub struct CacheCleanCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli, config: &Config) -> anyhow::Result<()> {
        if config.cache.backend == CacheBackend::Memory && !cli.quiet {
            output::warning("Cache backend is 'memory'; nothing persists between processes");
        }
        let cache = ResultCache::from_config(&cli.pipeline, &config.cache)?;

        match &self.action {
            CacheAction::Status(cmd) => cmd.execute(cli, config, &cache),
            CacheAction::List(cmd) => cmd.execute(cli, &cache),
            CacheAction::Prune(cmd) => cmd.execute(cli, &cache),
            CacheAction::Evict(cmd) => cmd.execute(cli, &cache),
            CacheAction::Clean(cmd) => cmd.execute(cli, &cache),
        }
    }
}

impl CacheStatusCommand {
    fn execute(&self, cli: &Cli, config: &Config, cache: &ResultCache) -> anyhow::Result<()> {
        let stats = cache.status()?;
        let location = config.cache.pipeline_dir(&cli.pipeline);

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "pipeline": cli.pipeline,
                "entries": stats.entries,
                "total_size": stats.total_size,
                "total_size_formatted": stats.formatted_size(),
                "cache_dir": location.display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!("{}", output::header("Result Cache Status"));
            println!();
            println!("{}", output::key_value("Pipeline", &cli.pipeline));
            println!(
                "{}",
                output::key_value("Location", &output::path_style().apply_to(location.display()).to_string())
            );
            println!("{}", output::key_value("Entries", &stats.entries.to_string()));
            println!(
                "{}",
                output::key_value("Size", &style(stats.formatted_size()).yellow().to_string())
            );
        }

        Ok(())
    }
}

impl CacheListCommand {
    fn execute(&self, cli: &Cli, cache: &ResultCache) -> anyhow::Result<()> {
        let ctx = ExpiryContext::detached();
        let mut entries: Vec<CacheEntry> = cache
            .entries()?
            .into_iter()
            .filter(|e| self.task.as_ref().map_or(true, |t| &e.task == t))
            .collect();
        entries.sort_by(|a, b| a.task.cmp(&b.task).then(a.stamp.created_at.cmp(&b.stamp.created_at)));

        if cli.format == OutputFormat::Json {
            let rows: Vec<_> = entries
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "key": e.key,
                        "task": e.task,
                        "policy": e.policy.to_string(),
                        "created_at": e.stamp.created_at.to_rfc3339(),
                        "duration_ms": e.duration_ms,
                        "expired": e.policy.is_expired(&e.stamp, &ctx),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(());
        }

        if cli.quiet {
            return Ok(());
        }
        if entries.is_empty() {
            output::info("No cached results");
            return Ok(());
        }

        for entry in &entries {
            let created = entry
                .stamp
                .created_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S");
            println!(
                "{}  {:<24} {:<8} {}  {}",
                output::key_style().apply_to(output::short_key(entry.key.as_str())),
                entry.task,
                output::validity(entry.policy.is_expired(&entry.stamp, &ctx)),
                created,
                style(&entry.policy).dim()
            );
        }

        Ok(())
    }
}

impl CachePruneCommand {
    fn execute(&self, cli: &Cli, cache: &ResultCache) -> anyhow::Result<()> {
        let ctx = ExpiryContext::detached();

        if !cli.quiet && cli.format == OutputFormat::Text {
            output::info("Pruning expired cache entries...");
        }

        let (total, removed) = if self.dry_run {
            let entries = cache.entries()?;
            let expired = entries
                .iter()
                .filter(|e| e.policy.is_expired(&e.stamp, &ctx))
                .count();
            (entries.len(), expired)
        } else {
            let stats = cache.prune(&ctx)?;
            (stats.total, stats.removed)
        };

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "total": total,
                "removed": removed,
                "kept": total - removed,
                "dry_run": self.dry_run,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            let verb = if self.dry_run { "Would remove" } else { "Removed" };
            println!(
                "  {} {} {} of {} entries ({} kept)",
                style("✓").green(),
                verb,
                removed,
                total,
                total - removed
            );
        }

        Ok(())
    }
}

impl CacheEvictCommand {
    fn execute(&self, cli: &Cli, cache: &ResultCache) -> anyhow::Result<()> {
        let entry = resolve_key(cache, &self.key)?;
        cache.evict(&entry.key)?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({ "evicted": entry.key, "task": entry.task });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            output::success(&format!(
                "Evicted {} ({})",
                output::key_style().apply_to(output::short_key(entry.key.as_str())),
                entry.task
            ));
        }

        Ok(())
    }
}

/// Find the single entry whose key starts with `prefix`
fn resolve_key(cache: &ResultCache, prefix: &str) -> anyhow::Result<CacheEntry> {
    let mut matches: Vec<CacheEntry> = cache
        .entries()?
        .into_iter()
        .filter(|e| e.key.as_str().starts_with(prefix))
        .collect();

    match matches.len() {
        0 => anyhow::bail!("No cache entry matches '{}'", prefix),
        1 => Ok(matches.remove(0)),
        n => anyhow::bail!("'{}' is ambiguous: {} entries match", prefix, n),
    }
}

impl CacheCleanCommand {
    fn execute(&self, cli: &Cli, cache: &ResultCache) -> anyhow::Result<()> {
        let stats = cache.status()?;
        if stats.entries == 0 {
            if !cli.quiet {
                output::success("Cache is already empty.");
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!(
                    "Remove all {} cached results of pipeline '{}'?",
                    stats.entries, cli.pipeline
                ))
                .default(false)
                .interact()?;

            if !confirmed {
                println!("{}", style("Aborted.").yellow());
                return Ok(());
            }
        }

        cache.clear()?;

        if !cli.quiet {
            output::success(&format!(
                "Cleared {} entries ({})",
                stats.entries,
                stats.formatted_size()
            ));
        }

        Ok(())
    }
}
