//! Execution engine: drives tasks through the cache-or-run state machine

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use pipewright_core::config::InputHashing;

use crate::cache::{CacheEntry, ResultCache};
use crate::dag::TaskDag;
use crate::expiry::{EntryStamp, Expiration, ExpiryContext, ExpiryPolicy, RunId, SessionId};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::pipeline::ResultsTable;
use crate::reporter::{TaskEvent, TaskReporter};
use crate::task::{OperationTiming, Task, TaskContext, TaskError, TaskStatus, ENTRY_OPERATION};

/// How a task may use the cache in this run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Reuse a valid entry, run on a miss
    #[default]
    Normal,
    /// Never read the cache; always run and write the fresh result
    Forced,
    /// Reuse a valid entry; never run
    ReadOnly,
}

/// What happened to one task in one run
#[derive(Debug)]
pub struct TaskOutcome {
    pub task: String,
    pub status: TaskStatus,
    pub value: Option<Value>,
    pub fingerprint: Option<Fingerprint>,
    pub duration: Duration,
    pub timings: Vec<OperationTiming>,
    pub error: Option<TaskError>,
}

impl TaskOutcome {
    fn pending(task: &str) -> Self {
        Self {
            task: task.to_string(),
            status: TaskStatus::Pending,
            value: None,
            fingerprint: None,
            duration: Duration::ZERO,
            timings: Vec::new(),
            error: None,
        }
    }
}

/// Everything a run needs, resolved before the first task starts
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub dag: TaskDag,
    pub tasks: HashMap<String, Task>,
    pub modes: HashMap<String, CacheMode>,
    pub fail_fast: bool,
}

impl RunPlan {
    fn mode(&self, task: &str) -> CacheMode {
        self.modes.get(task).copied().unwrap_or_default()
    }

    /// First dependency of `task` that has not succeeded or been skipped
    fn blocking_dependency<'a>(
        &'a self,
        task: &str,
        statuses: &HashMap<String, TaskStatus>,
    ) -> Option<&'a str> {
        self.tasks.get(task)?.dependencies().iter().find_map(|dep| {
            let done = statuses.get(dep).is_some_and(TaskStatus::is_success);
            (!done).then_some(dep.as_str())
        })
    }
}

/// Runs tasks for a single pipeline run
#[derive(Clone)]
pub struct Engine {
    cache: ResultCache,
    reporter: Arc<dyn TaskReporter>,
    fingerprinter: Fingerprinter,
    run: RunId,
}

impl Engine {
    /// Create an engine for a fresh run
    pub fn new(
        cache: ResultCache,
        reporter: Arc<dyn TaskReporter>,
        default_hashing: InputHashing,
    ) -> Self {
        Self {
            cache,
            reporter,
            fingerprinter: Fingerprinter::new(default_hashing),
            run: RunId::new(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run
    }

    fn transition(&self, task: &str, from: TaskStatus, to: TaskStatus) {
        debug!(task, %from, %to, "task status transition");
        self.reporter.report(&TaskEvent::StatusChanged {
            task: task.to_string(),
            from,
            to,
        });
    }

    /// Drive one task from `Pending` to its final status for this run
    pub fn run_task(&self, task: &Task, results: &ResultsTable, mode: CacheMode) -> TaskOutcome {
        let name = task.name();
        self.reporter.report(&TaskEvent::Started {
            task: name.to_string(),
        });

        let fingerprint = match self.fingerprinter.fingerprint(task) {
            Ok(fingerprint) => fingerprint,
            Err(error) => {
                return self.failed(name, TaskStatus::Pending, None, Duration::ZERO, Vec::new(), error)
            }
        };

        if mode != CacheMode::Forced {
            let ctx = ExpiryContext::during_run(self.run);
            match self.cache.lookup(&fingerprint, &ctx) {
                Ok(Some(entry)) => {
                    info!(task = name, "using previous result");
                    results.insert(name, entry.value.clone());
                    self.transition(name, TaskStatus::Pending, TaskStatus::Skipped);
                    self.reporter.report(&TaskEvent::Completed {
                        task: name.to_string(),
                        duration: Duration::ZERO,
                        cached: true,
                    });
                    return TaskOutcome {
                        status: TaskStatus::Skipped,
                        value: Some(entry.value),
                        fingerprint: Some(fingerprint),
                        ..TaskOutcome::pending(name)
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(task = name, error = %e, "cache lookup failed, treating as a miss");
                }
            }
        }

        if mode == CacheMode::ReadOnly {
            self.reporter.report(&TaskEvent::NotStarted {
                task: name.to_string(),
                reason: "ignored and no valid cached result".to_string(),
            });
            return TaskOutcome {
                fingerprint: Some(fingerprint),
                ..TaskOutcome::pending(name)
            };
        }

        info!(task = name, expiry = %task.expiry(), "executing");
        self.transition(name, TaskStatus::Pending, TaskStatus::Running);

        let ctx = TaskContext::new(task, results);
        let start = Instant::now();
        let result = ctx.call(ENTRY_OPERATION);
        let duration = start.elapsed();
        let timings = ctx.into_timings();

        match result {
            Ok(value) => {
                let entry = CacheEntry {
                    key: fingerprint.clone(),
                    task: name.to_string(),
                    value: value.clone(),
                    policy: task.expiry().clone(),
                    stamp: EntryStamp {
                        created_at: Utc::now(),
                        session: SessionId::current(),
                        run: self.run,
                    },
                    duration_ms: duration.as_millis() as u64,
                };
                if let Err(e) = self.cache.store(&entry) {
                    warn!(task = name, error = %e, "failed to cache result");
                }

                results.insert(name, value.clone());
                self.transition(name, TaskStatus::Running, TaskStatus::Succeeded);
                self.reporter.report(&TaskEvent::Completed {
                    task: name.to_string(),
                    duration,
                    cached: false,
                });

                TaskOutcome {
                    status: TaskStatus::Succeeded,
                    value: Some(value),
                    fingerprint: Some(fingerprint),
                    duration,
                    timings,
                    ..TaskOutcome::pending(name)
                }
            }
            Err(source) => {
                let error = TaskError::Execution {
                    task: name.to_string(),
                    source,
                };
                self.failed(name, TaskStatus::Running, Some(fingerprint), duration, timings, error)
            }
        }
    }

    fn failed(
        &self,
        name: &str,
        from: TaskStatus,
        fingerprint: Option<Fingerprint>,
        duration: Duration,
        timings: Vec<OperationTiming>,
        error: TaskError,
    ) -> TaskOutcome {
        self.transition(name, from, TaskStatus::Failed);
        self.reporter.report(&TaskEvent::Failed {
            task: name.to_string(),
            duration,
            error: error.to_string(),
        });
        TaskOutcome {
            status: TaskStatus::Failed,
            fingerprint,
            duration,
            timings,
            error: Some(error),
            ..TaskOutcome::pending(name)
        }
    }

    fn not_started(&self, name: &str, reason: String) -> TaskOutcome {
        self.reporter.report(&TaskEvent::NotStarted {
            task: name.to_string(),
            reason,
        });
        TaskOutcome::pending(name)
    }

    /// Run the plan on the calling thread, strictly in topological order
    #[instrument(skip_all, fields(run = %self.run, tasks = plan.dag.len()))]
    pub fn execute(&self, plan: &RunPlan, results: &ResultsTable) -> Vec<TaskOutcome> {
        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        let mut outcomes = Vec::with_capacity(plan.dag.len());
        let mut aborted = false;

        for name in plan.dag.sorted() {
            let outcome = match plan.tasks.get(name) {
                _ if aborted => self.not_started(name, "run aborted".to_string()),
                None => TaskOutcome::pending(name),
                Some(task) => match plan.blocking_dependency(name, &statuses) {
                    Some(dep) => {
                        self.not_started(name, format!("dependency '{}' did not complete", dep))
                    }
                    None => self.run_task(task, results, plan.mode(name)),
                },
            };

            if outcome.status == TaskStatus::Failed && plan.fail_fast {
                warn!(task = %name, "aborting run after failure");
                aborted = true;
            }
            statuses.insert(name.clone(), outcome.status);
            outcomes.push(outcome);
        }

        outcomes
    }

    /// Run the plan wave by wave, with up to `concurrency` tasks at once.
    ///
    /// Task bodies run on tokio's blocking pool. A failure stops later waves
    /// only when `fail_fast` is set; otherwise just its dependents wait.
    #[instrument(skip_all, fields(run = %self.run, tasks = plan.dag.len(), concurrency = concurrency))]
    pub async fn execute_async(
        &self,
        plan: Arc<RunPlan>,
        results: ResultsTable,
        concurrency: usize,
    ) -> Vec<TaskOutcome> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        let mut by_name: HashMap<String, TaskOutcome> = HashMap::new();
        let mut aborted = false;

        for (wave_idx, wave) in plan.dag.waves().iter().enumerate() {
            if !aborted {
                self.reporter.report(&TaskEvent::WaveStarted {
                    wave: wave_idx,
                    task_count: wave.len(),
                });
            }

            let mut handles = Vec::new();

            for name in wave {
                if aborted {
                    by_name.insert(name.clone(), self.not_started(name, "run aborted".to_string()));
                    continue;
                }
                if let Some(dep) = plan.blocking_dependency(name, &statuses) {
                    let reason = format!("dependency '{}' did not complete", dep);
                    by_name.insert(name.clone(), self.not_started(name, reason));
                    continue;
                }

                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        by_name.insert(name.clone(), TaskOutcome::pending(name));
                        continue;
                    }
                };
                let engine = self.clone();
                let plan = plan.clone();
                let results = results.clone();
                let task_name = name.clone();

                let handle = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    match plan.tasks.get(&task_name) {
                        Some(task) => engine.run_task(task, &results, plan.mode(&task_name)),
                        None => TaskOutcome::pending(&task_name),
                    }
                });
                handles.push((name.clone(), handle));
            }

            for (name, handle) in handles {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let error = TaskError::Execution {
                            task: name.clone(),
                            source: anyhow::anyhow!("task panicked: {}", e),
                        };
                        self.failed(&name, TaskStatus::Running, None, Duration::ZERO, Vec::new(), error)
                    }
                };
                if outcome.status == TaskStatus::Failed && plan.fail_fast {
                    warn!(task = %name, "aborting run after failure");
                    aborted = true;
                }
                statuses.insert(name.clone(), outcome.status);
                by_name.insert(name, outcome);
            }
        }

        // Return outcomes in topological order
        plan.dag
            .sorted()
            .iter()
            .filter_map(|name| by_name.remove(name))
            .collect()
    }

    /// Apply end-of-run expiry: evict every entry whose policy ends with
    /// this run. Returns how many entries were evicted.
    pub fn finish_run<'a, I>(&self, touched: I) -> usize
    where
        I: IntoIterator<Item = (&'a str, &'a ExpiryPolicy, &'a Fingerprint)>,
    {
        let ctx = ExpiryContext::during_run(self.run).completed();
        let stamp = EntryStamp {
            created_at: ctx.now,
            session: ctx.session,
            run: self.run,
        };

        let mut evicted = 0;
        for (task, policy, key) in touched {
            let ends_with_run = policy.expiration(stamp.created_at) == Expiration::EndOfRun;
            if !ends_with_run || !policy.is_expired(&stamp, &ctx) {
                continue;
            }
            match self.cache.evict(key) {
                Ok(()) => {
                    evicted += 1;
                    self.reporter.report(&TaskEvent::Evicted {
                        task: task.to_string(),
                        key: key.to_string(),
                    });
                }
                Err(e) => warn!(task, error = %e, "failed to evict entry at end of run"),
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::CollectingReporter;
    use crate::store::{KvStore, MemoryStore, StoreError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine_with(cache: ResultCache) -> (Engine, Arc<CollectingReporter>) {
        let reporter = Arc::new(CollectingReporter::default());
        let engine = Engine::new(cache, reporter.clone(), InputHashing::Content);
        (engine, reporter)
    }

    fn counting_task(name: &str, counter: Arc<AtomicUsize>) -> Task {
        Task::new(name)
            .with_expiry(ExpiryPolicy::Never)
            .with_entry(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(7))
            })
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = ResultCache::in_memory();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("t", counter.clone());
        let results = ResultsTable::default();

        let (engine, _) = engine_with(cache.clone());
        let first = engine.run_task(&task, &results, CacheMode::Normal);
        assert_eq!(first.status, TaskStatus::Succeeded);
        assert_eq!(first.value, Some(json!(7)));

        let (engine, _) = engine_with(cache);
        let second = engine.run_task(&task, &results, CacheMode::Normal);
        assert_eq!(second.status, TaskStatus::Skipped);
        assert_eq!(second.duration, Duration::ZERO);
        assert_eq!(second.fingerprint, first.fingerprint);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forced_bypasses_read() {
        let cache = ResultCache::in_memory();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("t", counter.clone());
        let results = ResultsTable::default();
        let (engine, _) = engine_with(cache);

        engine.run_task(&task, &results, CacheMode::Normal);
        let forced = engine.run_task(&task, &results, CacheMode::Forced);
        assert_eq!(forced.status, TaskStatus::Succeeded);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_read_only_miss_stays_pending() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("t", counter.clone());
        let (engine, reporter) = engine_with(ResultCache::in_memory());

        let outcome = engine.run_task(&task, &ResultsTable::default(), CacheMode::ReadOnly);
        assert_eq!(outcome.status, TaskStatus::Pending);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(reporter
            .events()
            .iter()
            .any(|e| matches!(e, TaskEvent::NotStarted { .. })));
    }

    #[test]
    fn test_failure_is_not_cached() {
        let cache = ResultCache::in_memory();
        let task = Task::new("boom").with_entry(|_| anyhow::bail!("exploded"));
        let (engine, reporter) = engine_with(cache.clone());

        let outcome = engine.run_task(&task, &ResultsTable::default(), CacheMode::Normal);
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(matches!(outcome.error, Some(TaskError::Execution { .. })));
        assert!(outcome.error.unwrap().to_string().contains("exploded"));
        assert_eq!(cache.status().unwrap().entries, 0);

        let transitions: Vec<_> = reporter
            .events()
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::StatusChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(transitions, vec![TaskStatus::Running, TaskStatus::Failed]);
    }

    #[test]
    fn test_missing_input_fails_before_running() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("t", counter.clone()).with_input("/definitely/not/here.csv");
        let (engine, _) = engine_with(ResultCache::in_memory());

        let outcome = engine.run_task(&task, &ResultsTable::default(), CacheMode::Normal);
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(matches!(outcome.error, Some(TaskError::InputNotFound { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    struct BrokenStore;

    impl KvStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(std::io::Error::other("store offline").into())
        }
        fn put(&self, _: &str, _: &[u8], _: Option<Duration>) -> Result<(), StoreError> {
            Err(std::io::Error::other("store offline").into())
        }
        fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(std::io::Error::other("store offline").into())
        }
        fn keys(&self) -> Result<Vec<String>, StoreError> {
            Err(std::io::Error::other("store offline").into())
        }
    }

    #[test]
    fn test_store_errors_are_misses() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("t", counter.clone());
        let (engine, _) = engine_with(ResultCache::new(Arc::new(BrokenStore)));
        let results = ResultsTable::default();

        assert_eq!(engine.run_task(&task, &results, CacheMode::Normal).status, TaskStatus::Succeeded);
        assert_eq!(engine.run_task(&task, &results, CacheMode::Normal).status, TaskStatus::Succeeded);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(results.get("t"), Some(json!(7)));
    }

    #[test]
    fn test_finish_run_evicts_only_end_of_run_entries() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResultCache::new(store.clone());
        let (engine, _) = engine_with(cache);
        let results = ResultsTable::default();

        let once = Task::new("once")
            .with_expiry(ExpiryPolicy::OnPipelineComplete("once".to_string()))
            .with_entry(|_| Ok(json!(1)));
        let keep = Task::new("keep")
            .with_expiry(ExpiryPolicy::Never)
            .with_entry(|_| Ok(json!(2)));

        let a = engine.run_task(&once, &results, CacheMode::Normal);
        let b = engine.run_task(&keep, &results, CacheMode::Normal);
        let key_a = a.fingerprint.unwrap();
        let key_b = b.fingerprint.unwrap();

        let evicted = engine.finish_run([
            ("once", once.expiry(), &key_a),
            ("keep", keep.expiry(), &key_b),
        ]);
        assert_eq!(evicted, 1);
        assert_eq!(store.keys().unwrap(), vec![key_b.0]);
    }
}
