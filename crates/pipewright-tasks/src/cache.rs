//! Fingerprint-keyed result cache with expiry-aware lookups

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use pipewright_core::config::{CacheBackend, CacheConfig};

use crate::expiry::{EntryStamp, ExpiryContext, ExpiryPolicy, SessionId};
use crate::fingerprint::Fingerprint;
use crate::store::{DirStore, KvStore, MemoryStore, StoreError};

/// A cached task result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key
    pub key: Fingerprint,
    /// Task that produced the value
    pub task: String,
    /// The task's result
    pub value: Value,
    /// Policy the entry was written under
    pub policy: ExpiryPolicy,
    /// Creation time, session and run
    #[serde(flatten)]
    pub stamp: EntryStamp,
    /// How long the task took to produce the value
    pub duration_ms: u64,
}

/// Result cache layered over a [`KvStore`]
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn KvStore>,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache").finish_non_exhaustive()
    }
}

impl ResultCache {
    /// Create a cache over any store
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Cache that lives only as long as the process
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Cache persisted under `dir`
    pub fn open_dir(dir: &Path) -> Result<Self, CacheError> {
        Ok(Self::new(Arc::new(DirStore::open(dir)?)))
    }

    /// Cache for the named pipeline, as configured
    pub fn from_config(pipeline: &str, config: &CacheConfig) -> Result<Self, CacheError> {
        match config.backend {
            CacheBackend::Memory => Ok(Self::in_memory()),
            CacheBackend::Directory => Self::open_dir(&config.pipeline_dir(pipeline)),
        }
    }

    /// Look up a valid entry.
    ///
    /// Expired or undecodable entries are deleted and reported as a miss.
    pub fn lookup(
        &self,
        key: &Fingerprint,
        ctx: &ExpiryContext,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let Some(bytes) = self.store.get(key.as_str())? else {
            debug!(%key, "cache miss");
            return Ok(None);
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%key, error = %e, "discarding undecodable cache entry");
                self.store.delete(key.as_str())?;
                return Ok(None);
            }
        };

        if entry.policy.is_expired(&entry.stamp, ctx) {
            debug!(%key, task = %entry.task, policy = %entry.policy, "cache entry expired");
            self.store.delete(key.as_str())?;
            return Ok(None);
        }

        debug!(%key, task = %entry.task, "cache hit");
        Ok(Some(entry))
    }

    /// Write an entry, replacing any entry under the same key
    pub fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        debug!(key = %entry.key, task = %entry.task, "storing result in cache");
        let bytes = serde_json::to_vec(entry)?;
        let ttl = entry
            .policy
            .ttl_hint(entry.stamp.created_at, chrono::Utc::now());
        self.store.put(entry.key.as_str(), &bytes, ttl)?;
        Ok(())
    }

    /// Remove one entry
    pub fn evict(&self, key: &Fingerprint) -> Result<(), CacheError> {
        debug!(%key, "evicting cache entry");
        self.store.delete(key.as_str())?;
        Ok(())
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<(), CacheError> {
        info!("clearing result cache");
        self.store.clear()?;
        Ok(())
    }

    /// All decodable entries, without evaluating expiry
    pub fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = Vec::new();
        for key in self.store.keys()? {
            if let Some(entry) = self.read_raw(&key)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Delete every expired or undecodable entry
    pub fn prune(&self, ctx: &ExpiryContext) -> Result<PruneStats, CacheError> {
        info!("pruning cache");
        let mut stats = PruneStats::default();

        for key in self.store.keys()? {
            stats.total += 1;
            let expired = match self.read_raw(&key)? {
                Some(entry) => entry.policy.is_expired(&entry.stamp, ctx),
                None => true,
            };

            if expired {
                self.store.delete(&key)?;
                stats.removed += 1;
            } else {
                stats.kept += 1;
            }
        }

        info!(total = stats.total, removed = stats.removed, kept = stats.kept, "cache prune complete");
        Ok(stats)
    }

    /// Delete the session-scoped entries written by `session`.
    ///
    /// Call when a session ends; lookups from later sessions would treat
    /// these entries as expired anyway.
    pub fn evict_session(&self, session: SessionId) -> Result<usize, CacheError> {
        let mut removed = 0;
        for entry in self.entries()? {
            if entry.policy == ExpiryPolicy::Session && entry.stamp.session == session {
                self.store.delete(entry.key.as_str())?;
                removed += 1;
            }
        }
        info!(%session, removed, "session entries evicted");
        Ok(removed)
    }

    /// Get cache statistics
    pub fn status(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();
        for key in self.store.keys()? {
            if let Some(bytes) = self.store.get(&key)? {
                stats.entries += 1;
                stats.total_size += bytes.len() as u64;
            }
        }
        Ok(stats)
    }

    fn read_raw(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let Some(bytes) = self.store.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(key, error = %e, "skipping undecodable cache entry");
                Ok(None)
            }
        }
    }
}

/// Statistics from a prune operation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    /// Total entries found
    pub total: usize,
    /// Entries removed
    pub removed: usize,
    /// Entries kept
    pub kept: usize,
}

/// Cache statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache entries
    pub entries: usize,
    /// Total size in bytes
    pub total_size: u64,
}

impl CacheStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        if self.total_size < 1024 {
            format!("{} B", self.total_size)
        } else if self.total_size < 1024 * 1024 {
            format!("{:.1} KB", self.total_size as f64 / 1024.0)
        } else if self.total_size < 1024 * 1024 * 1024 {
            format!("{:.1} MB", self.total_size as f64 / (1024.0 * 1024.0))
        } else {
            format!(
                "{:.1} GB",
                self.total_size as f64 / (1024.0 * 1024.0 * 1024.0)
            )
        }
    }
}

/// Cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Underlying store failed
    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),

    /// JSON serialization error
    #[error("Cache serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiry::{ExpirySpan, RunId};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(key: &str, policy: ExpiryPolicy, run: RunId) -> CacheEntry {
        CacheEntry {
            key: Fingerprint(key.to_string()),
            task: "task".to_string(),
            value: json!({ "rows": 3 }),
            policy,
            stamp: EntryStamp {
                created_at: Utc::now(),
                session: SessionId::current(),
                run,
            },
            duration_ms: 12,
        }
    }

    #[test]
    fn test_store_and_lookup() {
        let cache = ResultCache::in_memory();
        let run = RunId::new();
        let e = entry("k1", ExpiryPolicy::Never, run);

        cache.store(&e).unwrap();
        let found = cache.lookup(&e.key, &ExpiryContext::during_run(run)).unwrap();
        assert_eq!(found, Some(e));
    }

    #[test]
    fn test_miss() {
        let cache = ResultCache::in_memory();
        let ctx = ExpiryContext::during_run(RunId::new());
        assert!(cache.lookup(&Fingerprint("nope".into()), &ctx).unwrap().is_none());
    }

    #[test]
    fn test_put_overwrites() {
        let cache = ResultCache::in_memory();
        let run = RunId::new();
        let mut e = entry("k1", ExpiryPolicy::Never, run);
        cache.store(&e).unwrap();
        e.value = json!("second");
        cache.store(&e).unwrap();

        let found = cache.lookup(&e.key, &ExpiryContext::during_run(run)).unwrap().unwrap();
        assert_eq!(found.value, json!("second"));
        assert_eq!(cache.status().unwrap().entries, 1);
    }

    #[test]
    fn test_expired_entry_is_miss_and_deleted() {
        let cache = ResultCache::in_memory();
        let run = RunId::new();
        let mut e = entry("k1", ExpiryPolicy::FromNow(ExpirySpan::minutes(5)), run);
        e.stamp.created_at = Utc::now() - Duration::minutes(10);
        cache.store(&e).unwrap();

        let ctx = ExpiryContext::during_run(run);
        assert!(cache.lookup(&e.key, &ctx).unwrap().is_none());
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn test_session_entry_from_other_session_is_miss() {
        let cache = ResultCache::in_memory();
        let run = RunId::new();
        let mut e = entry("k1", ExpiryPolicy::Session, run);
        e.stamp.session = SessionId::fresh();
        cache.store(&e).unwrap();

        assert!(cache
            .lookup(&e.key, &ExpiryContext::during_run(run))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_undecodable_entry_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store.put("bad", b"not json", None).unwrap();
        let cache = ResultCache::new(store.clone());

        let ctx = ExpiryContext::during_run(RunId::new());
        assert!(cache.lookup(&Fingerprint("bad".into()), &ctx).unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_prune() {
        let cache = ResultCache::in_memory();
        let run = RunId::new();
        cache.store(&entry("keep", ExpiryPolicy::Never, run)).unwrap();
        cache
            .store(&entry("drop", ExpiryPolicy::OnPipelineComplete("task".into()), run))
            .unwrap();

        let stats = cache.prune(&ExpiryContext::detached()).unwrap();
        assert_eq!(stats, PruneStats { total: 2, removed: 1, kept: 1 });
        assert_eq!(cache.entries().unwrap()[0].key.as_str(), "keep");
    }

    #[test]
    fn test_evict_session() {
        let cache = ResultCache::in_memory();
        let run = RunId::new();
        cache.store(&entry("mine", ExpiryPolicy::Session, run)).unwrap();
        cache.store(&entry("forever", ExpiryPolicy::Never, run)).unwrap();
        let mut other = entry("theirs", ExpiryPolicy::Session, run);
        other.stamp.session = SessionId::fresh();
        cache.store(&other).unwrap();

        assert_eq!(cache.evict_session(SessionId::current()).unwrap(), 1);
        let keys: Vec<_> = cache.entries().unwrap().into_iter().map(|e| e.key.0).collect();
        assert_eq!(keys, vec!["forever".to_string(), "theirs".to_string()]);
    }

    #[test]
    fn test_clear_and_evict() {
        let cache = ResultCache::in_memory();
        let run = RunId::new();
        cache.store(&entry("a", ExpiryPolicy::Never, run)).unwrap();
        cache.store(&entry("b", ExpiryPolicy::Never, run)).unwrap();

        cache.evict(&Fingerprint("a".into())).unwrap();
        assert_eq!(cache.status().unwrap().entries, 1);
        cache.clear().unwrap();
        assert_eq!(cache.status().unwrap().entries, 0);
    }

    #[test]
    fn test_dir_backed_cache_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let run = RunId::new();
        let e = entry("persisted", ExpiryPolicy::Never, run);
        ResultCache::open_dir(temp.path()).unwrap().store(&e).unwrap();

        let reopened = ResultCache::open_dir(temp.path()).unwrap();
        let found = reopened
            .lookup(&e.key, &ExpiryContext::during_run(RunId::new()))
            .unwrap();
        assert_eq!(found.map(|f| f.value), Some(json!({ "rows": 3 })));
    }

    #[test]
    fn test_from_config_memory() {
        let config = CacheConfig {
            directory: None,
            backend: CacheBackend::Memory,
        };
        let cache = ResultCache::from_config("etl", &config).unwrap();
        assert_eq!(cache.status().unwrap(), CacheStats::default());
    }

    #[test]
    fn test_cache_stats_formatted_size() {
        let stats = CacheStats {
            entries: 0,
            total_size: 1536,
        };
        assert_eq!(stats.formatted_size(), "1.5 KB");

        let stats = CacheStats {
            entries: 0,
            total_size: 500,
        };
        assert_eq!(stats.formatted_size(), "500 B");
    }
}
