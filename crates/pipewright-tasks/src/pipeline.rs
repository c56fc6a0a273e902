//! Pipeline: registered tasks, their resolved order, and the results table

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use pipewright_core::config::{Config, ExecutionConfig, InputHashing};

use crate::cache::{CacheError, ResultCache};
use crate::dag::{DagError, TaskDag};
use crate::engine::{CacheMode, Engine, RunPlan, TaskOutcome};
use crate::expiry::{ExpiryPolicy, RunId, SessionId};
use crate::fingerprint::Fingerprint;
use crate::reporter::{TaskEvent, TaskReporter, TaskReporterRegistry};
use crate::task::{OperationTiming, Task, TaskError, TaskStatus};

/// Results of the current run, shared between the pipeline and running tasks
#[derive(Debug, Clone, Default)]
pub struct ResultsTable {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl ResultsTable {
    pub fn get(&self, task: &str) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task)
            .cloned()
    }

    pub fn insert(&self, task: &str, value: Value) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.to_string(), value);
    }

    pub fn remove(&self, task: &str) -> Option<Value> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task)
    }

    pub fn contains(&self, task: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(task)
    }

    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Per-task state from the most recent run
#[derive(Debug, Clone, Default)]
pub struct TaskState {
    pub status: TaskStatus,
    pub duration: Duration,
    pub timings: Vec<OperationTiming>,
    pub fingerprint: Option<Fingerprint>,
    pub error: Option<String>,
}

/// Options for one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Clear the whole cache before running
    pub force_all: bool,
    /// Stop starting tasks after the first failure
    pub fail_fast: bool,
    /// Maximum tasks in flight for `execute_async`
    pub concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force_all: false,
            fail_fast: false,
            concurrency: 1,
        }
    }
}

impl From<&ExecutionConfig> for RunOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            force_all: false,
            fail_fast: config.fail_fast,
            concurrency: config.concurrency,
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run: RunId,
    pub total: usize,
    pub succeeded: usize,
    /// Tasks satisfied from the cache
    pub skipped: usize,
    pub failed: usize,
    /// Tasks that never started
    pub pending: usize,
    pub evicted: usize,
    pub duration: Duration,
}

/// Pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Graph could not be resolved
    #[error(transparent)]
    Dag(#[from] DagError),

    /// Tasks registered without an entry operation
    #[error("Tasks have no 'run' operation: {}", .0.join(", "))]
    MissingEntry(Vec<String>),

    /// A task with this name is already registered
    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    /// Task not registered, or it has no result yet
    #[error("Unknown task or task has no result: '{0}'")]
    UnknownTask(String),

    /// One or more tasks failed; the run has finished
    #[error("{} task(s) failed: {}", .0.len(), failure_list(.0))]
    TasksFailed(Vec<TaskError>),

    /// Cache could not be opened or maintained
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A result did not deserialize into the requested type
    #[error("Result of task '{task}' has an unexpected shape: {source}")]
    Decode {
        task: String,
        #[source]
        source: serde_json::Error,
    },
}

fn failure_list(errors: &[TaskError]) -> String {
    errors
        .iter()
        .map(|e| e.task().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A set of named tasks executed in dependency order against a result cache
pub struct Pipeline {
    name: String,
    tasks: Vec<Task>,
    dag: Option<TaskDag>,
    results: ResultsTable,
    states: HashMap<String, TaskState>,
    forced: HashSet<String>,
    ignored: HashSet<String>,
    cache: ResultCache,
    reporters: TaskReporterRegistry,
    input_hashing: InputHashing,
    run_defaults: RunOptions,
    session: SessionId,
    last_run: Option<RunId>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("tasks", &self.tasks.len())
            .field("last_run", &self.last_run)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create an empty pipeline over `cache`
    pub fn new(name: impl Into<String>, cache: ResultCache) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            dag: None,
            results: ResultsTable::default(),
            states: HashMap::new(),
            forced: HashSet::new(),
            ignored: HashSet::new(),
            cache,
            reporters: TaskReporterRegistry::new(),
            input_hashing: InputHashing::default(),
            run_defaults: RunOptions::default(),
            session: SessionId::current(),
            last_run: None,
        }
    }

    /// Create a pipeline whose cache, hashing and run options follow `config`
    pub fn from_config(name: impl Into<String>, config: &Config) -> Result<Self, PipelineError> {
        let name = name.into();
        let cache = ResultCache::from_config(&name, &config.cache)?;
        let mut pipeline = Self::new(name, cache);
        pipeline.input_hashing = config.execution.input_hashing;
        pipeline.run_defaults = RunOptions::from(&config.execution);
        Ok(pipeline)
    }

    /// Add a reporter alongside the default tracing reporter
    pub fn with_reporter(mut self, reporter: Arc<dyn TaskReporter>) -> Self {
        self.reporters.register_shared(reporter);
        self
    }

    /// Hash inputs this way unless a task says otherwise
    pub fn with_input_hashing(mut self, mode: InputHashing) -> Self {
        self.input_hashing = mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options taken from the execution config, or the defaults
    pub fn run_options(&self) -> RunOptions {
        self.run_defaults
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Register a task. Registration order does not constrain dependencies.
    pub fn add(&mut self, task: Task) -> Result<(), PipelineError> {
        if self.tasks.iter().any(|t| t.name() == task.name()) {
            return Err(PipelineError::DuplicateTask(task.name().to_string()));
        }
        self.dag = None;
        self.tasks.push(task);
        Ok(())
    }

    /// Unregister a task, dropping its state and result
    pub fn remove(&mut self, name: &str) -> Option<Task> {
        let position = self.tasks.iter().position(|t| t.name() == name)?;
        self.dag = None;
        self.states.remove(name);
        self.results.remove(name);
        self.forced.remove(name);
        self.ignored.remove(name);
        Some(self.tasks.remove(position))
    }

    pub fn get_task(&self, name: &str) -> Result<&Task, PipelineError> {
        self.tasks
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| PipelineError::UnknownTask(name.to_string()))
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Resolved execution order, computed once until tasks change
    pub fn execution_order(&mut self) -> Result<&[String], PipelineError> {
        if self.dag.is_none() {
            self.dag = Some(TaskDag::build(&self.tasks)?);
        }
        Ok(self.dag.as_ref().map(TaskDag::sorted).unwrap_or_default())
    }

    /// Always run `name` on the next runs, ignoring any cached result
    pub fn set_forced(&mut self, name: &str) -> Result<(), PipelineError> {
        self.get_task(name)?;
        self.forced.insert(name.to_string());
        Ok(())
    }

    pub fn clear_forced(&mut self) {
        self.forced.clear();
    }

    /// Never run `name`; reuse a cached result when one is valid
    pub fn set_ignored(&mut self, name: &str) -> Result<(), PipelineError> {
        self.get_task(name)?;
        self.ignored.insert(name.to_string());
        Ok(())
    }

    pub fn clear_ignored(&mut self) {
        self.ignored.clear();
    }

    fn mode_for(&self, name: &str) -> CacheMode {
        if self.forced.contains(name) {
            CacheMode::Forced
        } else if self.ignored.contains(name) {
            CacheMode::ReadOnly
        } else {
            CacheMode::Normal
        }
    }

    /// Validate, reset per-run state and build the plan for a new run
    fn prepare(&mut self, options: &RunOptions) -> Result<(Engine, RunPlan), PipelineError> {
        let missing: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| !t.has_entry())
            .map(|t| t.name().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::MissingEntry(missing));
        }

        self.execution_order()?;
        let untracked: Vec<&str> = self
            .tasks
            .iter()
            .filter(|t| !t.tracks_definition())
            .map(Task::name)
            .collect();
        if !untracked.is_empty() {
            debug!(pipeline = %self.name, tasks = ?untracked, "definitions untracked; code edits will not invalidate these results");
        }
        let dag = match &self.dag {
            Some(dag) => dag.clone(),
            None => TaskDag::build(&self.tasks)?,
        };

        self.results.clear();
        self.states = self
            .tasks
            .iter()
            .map(|t| (t.name().to_string(), TaskState::default()))
            .collect();

        if options.force_all {
            if let Err(e) = self.cache.clear() {
                warn!(pipeline = %self.name, error = %e, "failed to clear cache before forced run");
            }
        }

        let plan = RunPlan {
            dag,
            tasks: self
                .tasks
                .iter()
                .map(|t| (t.name().to_string(), t.clone()))
                .collect(),
            modes: self
                .tasks
                .iter()
                .map(|t| (t.name().to_string(), self.mode_for(t.name())))
                .collect(),
            fail_fast: options.fail_fast,
        };

        let engine = Engine::new(
            self.cache.clone(),
            Arc::new(self.reporters.clone()),
            self.input_hashing,
        );
        self.last_run = Some(engine.run_id());
        info!(pipeline = %self.name, run = %engine.run_id(), tasks = self.tasks.len(), "starting run");

        Ok((engine, plan))
    }

    /// Record outcomes, apply end-of-run expiry and summarise
    fn finish(
        &mut self,
        engine: &Engine,
        outcomes: Vec<TaskOutcome>,
        started: Instant,
    ) -> Result<RunSummary, PipelineError> {
        let touched: Vec<(String, ExpiryPolicy, Fingerprint)> = outcomes
            .iter()
            .filter(|o| o.status.is_success())
            .filter_map(|o| {
                let task = self.tasks.iter().find(|t| t.name() == o.task)?;
                let owned_here = match task.expiry() {
                    ExpiryPolicy::OnPipelineComplete(owner) => {
                        self.tasks.iter().any(|t| t.name() == owner)
                    }
                    _ => false,
                };
                let fingerprint = o.fingerprint.clone()?;
                owned_here.then(|| (o.task.clone(), task.expiry().clone(), fingerprint))
            })
            .collect();
        let evicted = engine.finish_run(
            touched
                .iter()
                .map(|(task, policy, key)| (task.as_str(), policy, key)),
        );

        let mut summary = RunSummary {
            run: engine.run_id(),
            total: outcomes.len(),
            succeeded: 0,
            skipped: 0,
            failed: 0,
            pending: 0,
            evicted,
            duration: started.elapsed(),
        };
        let mut errors = Vec::new();

        for outcome in outcomes {
            match outcome.status {
                TaskStatus::Succeeded => summary.succeeded += 1,
                TaskStatus::Skipped => summary.skipped += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Pending | TaskStatus::Running => summary.pending += 1,
            }
            self.states.insert(
                outcome.task.clone(),
                TaskState {
                    status: outcome.status,
                    duration: outcome.duration,
                    timings: outcome.timings,
                    fingerprint: outcome.fingerprint,
                    error: outcome.error.as_ref().map(ToString::to_string),
                },
            );
            if let Some(error) = outcome.error {
                errors.push(error);
            }
        }

        self.reporters.broadcast(&TaskEvent::AllCompleted {
            total: summary.total,
            succeeded: summary.succeeded,
            failed: summary.failed,
            cached: summary.skipped,
            duration: summary.duration,
        });

        if errors.is_empty() {
            Ok(summary)
        } else {
            Err(PipelineError::TasksFailed(errors))
        }
    }

    /// Run every task once, sequentially, in resolved order.
    ///
    /// Task failures are reported after the run has finished; statuses and
    /// results of the tasks that did complete stay inspectable.
    #[instrument(skip_all, fields(pipeline = %self.name, force_all = options.force_all))]
    pub fn execute(&mut self, options: RunOptions) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let (engine, plan) = self.prepare(&options)?;
        let outcomes = engine.execute(&plan, &self.results);
        self.finish(&engine, outcomes, started)
    }

    /// Run every task once, independent tasks concurrently
    #[instrument(skip_all, fields(pipeline = %self.name, concurrency = options.concurrency))]
    pub async fn execute_async(&mut self, options: RunOptions) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let (engine, plan) = self.prepare(&options)?;
        let outcomes = engine
            .execute_async(Arc::new(plan), self.results.clone(), options.concurrency)
            .await;
        self.finish(&engine, outcomes, started)
    }

    /// Result of `name` from the latest run
    pub fn get_result(&self, name: &str) -> Result<Value, PipelineError> {
        self.get_task(name)?;
        self.results
            .get(name)
            .ok_or_else(|| PipelineError::UnknownTask(name.to_string()))
    }

    /// Result of `name`, deserialized
    pub fn get_result_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, PipelineError> {
        let value = self.get_result(name)?;
        serde_json::from_value(value).map_err(|source| PipelineError::Decode {
            task: name.to_string(),
            source,
        })
    }

    pub fn status(&self, name: &str) -> Result<TaskStatus, PipelineError> {
        self.get_task(name)?;
        Ok(self.states.get(name).map(|s| s.status).unwrap_or_default())
    }

    pub fn duration(&self, name: &str) -> Result<Duration, PipelineError> {
        self.get_task(name)?;
        Ok(self.states.get(name).map(|s| s.duration).unwrap_or_default())
    }

    /// Per-operation timings of `name` in the latest run
    pub fn timings(&self, name: &str) -> Result<&[OperationTiming], PipelineError> {
        self.get_task(name)?;
        Ok(self
            .states
            .get(name)
            .map(|s| s.timings.as_slice())
            .unwrap_or_default())
    }

    pub fn state(&self, name: &str) -> Option<&TaskState> {
        self.states.get(name)
    }

    /// Whether every task succeeded or was served from the cache
    pub fn is_complete(&self) -> bool {
        !self.tasks.is_empty()
            && self
                .tasks
                .iter()
                .all(|t| self.states.get(t.name()).is_some_and(|s| s.status.is_success()))
    }

    pub fn last_run(&self) -> Option<RunId> {
        self.last_run
    }

    /// Drop every `Session` entry this process wrote
    pub fn end_session(&self) -> Result<usize, PipelineError> {
        let evicted = self.cache.evict_session(self.session)?;
        info!(pipeline = %self.name, evicted, "session ended");
        Ok(evicted)
    }
}
