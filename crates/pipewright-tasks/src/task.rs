//! Task types and definitions

use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use pipewright_core::config::InputHashing;

use crate::expiry::ExpiryPolicy;
use crate::pipeline::ResultsTable;

/// Name of the operation the engine invokes to run a task
pub const ENTRY_OPERATION: &str = "run";

/// A named operation attached to a task.
///
/// Operations receive the task's [`TaskContext`], through which they can call
/// sibling operations and read the results of declared dependencies.
pub type Operation = Arc<dyn Fn(&TaskContext<'_>) -> anyhow::Result<Value> + Send + Sync>;

/// Where a task's definition lives, for fingerprinting.
///
/// The whole unit is hashed, so editing any task that shares the unit
/// invalidates every task declared in it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefinitionSource {
    /// No definition tracked; only the name and inputs are fingerprinted
    #[default]
    None,
    /// Source file read at fingerprint time
    File(PathBuf),
    /// Source text embedded at build time, e.g. with `include_str!`
    Inline(String),
}

/// Execution status of a task within one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not started (yet, or ever, when a dependency failed)
    #[default]
    Pending,
    /// Entry operation in progress
    Running,
    /// Valid cached result reused
    Skipped,
    /// Entry operation returned a value
    Succeeded,
    /// Entry operation or fingerprinting failed
    Failed,
}

impl TaskStatus {
    /// Whether dependents may start after this status
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Skipped => "skipped",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Wall-clock time spent in one operation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTiming {
    pub operation: String,
    pub duration: Duration,
}

/// A named unit of work
#[derive(Clone)]
pub struct Task {
    name: String,
    operations: Vec<(String, Operation)>,
    dependencies: Vec<String>,
    inputs: Vec<PathBuf>,
    input_hashing: Option<InputHashing>,
    source: DefinitionSource,
    expiry: ExpiryPolicy,
}

impl Task {
    /// Create a new task with no operations.
    ///
    /// The definition starts untracked ([`DefinitionSource::None`]): the
    /// fingerprint covers the name and inputs only, so editing the entry
    /// closure does not invalidate cached results. Track the code with
    /// [`Task::with_source_file`], or with [`Task::with_source_text`] fed
    /// by `include_str!` of the module that declares the task.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
            dependencies: Vec::new(),
            inputs: Vec::new(),
            input_hashing: None,
            source: DefinitionSource::None,
            expiry: ExpiryPolicy::Session,
        }
    }

    /// Attach a named operation, replacing any operation with the same name
    pub fn with_operation<F>(mut self, name: impl Into<String>, op: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let op: Operation = Arc::new(op);
        match self.operations.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = op,
            None => self.operations.push((name, op)),
        }
        self
    }

    /// Attach the entry operation
    pub fn with_entry<F>(self, op: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.with_operation(ENTRY_OPERATION, op)
    }

    /// Declare a dependency on another task by name
    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        let dep = dep.into();
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
        self
    }

    /// Declare an input file or glob pattern
    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    /// Declare several input files or glob patterns
    pub fn with_inputs<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.inputs.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Override the configured input hashing mode for this task
    pub fn with_input_hashing(mut self, mode: InputHashing) -> Self {
        self.input_hashing = Some(mode);
        self
    }

    /// Set the definition source
    pub fn with_source(mut self, source: DefinitionSource) -> Self {
        self.source = source;
        self
    }

    /// Track a source file as this task's definition
    pub fn with_source_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_source(DefinitionSource::File(path.into()))
    }

    /// Track embedded source text as this task's definition
    pub fn with_source_text(self, text: impl Into<String>) -> Self {
        self.with_source(DefinitionSource::Inline(text.into()))
    }

    /// Set the expiry policy for cached results
    pub fn with_expiry(mut self, expiry: ExpiryPolicy) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn input_hashing(&self) -> Option<InputHashing> {
        self.input_hashing
    }

    pub fn source(&self) -> &DefinitionSource {
        &self.source
    }

    /// Whether code edits change this task's fingerprint
    pub fn tracks_definition(&self) -> bool {
        self.source != DefinitionSource::None
    }

    pub fn expiry(&self) -> &ExpiryPolicy {
        &self.expiry
    }

    /// Look up an operation by name
    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, op)| op)
    }

    /// Operation names in attachment order
    pub fn operation_names(&self) -> impl Iterator<Item = &str> {
        self.operations.iter().map(|(n, _)| n.as_str())
    }

    /// Whether the entry operation is attached
    pub fn has_entry(&self) -> bool {
        self.operation(ENTRY_OPERATION).is_some()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("operations", &self.operation_names().collect::<Vec<_>>())
            .field("dependencies", &self.dependencies)
            .field("inputs", &self.inputs)
            .field("input_hashing", &self.input_hashing)
            .field("source", &self.source)
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// The handle an operation runs against: its task plus the pipeline's results
pub struct TaskContext<'a> {
    task: &'a Task,
    results: &'a ResultsTable,
    timings: RefCell<Vec<OperationTiming>>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(task: &'a Task, results: &'a ResultsTable) -> Self {
        Self {
            task,
            results,
            timings: RefCell::new(Vec::new()),
        }
    }

    /// Name of the running task
    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// Declared input paths of the running task
    pub fn inputs(&self) -> &[PathBuf] {
        self.task.inputs()
    }

    /// Invoke one of the task's operations by name
    pub fn call(&self, operation: &str) -> anyhow::Result<Value> {
        let op = self
            .task
            .operation(operation)
            .ok_or_else(|| TaskError::UnknownOperation {
                task: self.task.name().to_string(),
                operation: operation.to_string(),
            })?;

        debug!(task = %self.task.name(), operation, "running operation");
        let start = Instant::now();
        let result = op(self);
        let duration = start.elapsed();
        debug!(
            task = %self.task.name(),
            operation,
            elapsed_ms = duration.as_millis() as u64,
            "operation finished"
        );

        self.timings.borrow_mut().push(OperationTiming {
            operation: operation.to_string(),
            duration,
        });
        result
    }

    /// Result of a declared dependency
    pub fn dependency(&self, name: &str) -> anyhow::Result<Value> {
        if !self.task.dependencies().iter().any(|d| d == name) {
            return Err(TaskError::UndeclaredDependency {
                task: self.task.name().to_string(),
                dependency: name.to_string(),
            }
            .into());
        }

        self.results.get(name).ok_or_else(|| {
            TaskError::MissingResult {
                task: self.task.name().to_string(),
                dependency: name.to_string(),
            }
            .into()
        })
    }

    /// Result of a declared dependency, deserialized
    pub fn dependency_as<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self.dependency(name)?;
        Ok(serde_json::from_value(value)?)
    }

    pub(crate) fn into_timings(self) -> Vec<OperationTiming> {
        self.timings.into_inner()
    }
}

/// Errors raised while fingerprinting or running a single task
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// A declared input (or definition source) is missing
    #[error("Task '{task}': input not found: {}", path.display())]
    InputNotFound { task: String, path: PathBuf },

    /// The task's own operation failed
    #[error("Task '{task}' failed: {source:#}")]
    Execution {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// An operation name that the task does not have
    #[error("Task '{task}' has no operation named '{operation}'")]
    UnknownOperation { task: String, operation: String },

    /// An operation read a task it does not depend on
    #[error("Task '{task}' read '{dependency}', which is not a declared dependency")]
    UndeclaredDependency { task: String, dependency: String },

    /// A dependency finished without publishing a result
    #[error("Task '{task}': dependency '{dependency}' has no result")]
    MissingResult { task: String, dependency: String },

    /// Invalid glob pattern in the declared inputs
    #[error("Task '{task}': invalid input pattern '{pattern}': {message}")]
    InvalidPattern {
        task: String,
        pattern: String,
        message: String,
    },

    /// Reading an input or definition file failed
    #[error("Task '{task}': failed to read {}: {source}", path.display())]
    Io {
        task: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TaskError {
    /// Name of the task the error belongs to
    pub fn task(&self) -> &str {
        match self {
            Self::InputNotFound { task, .. }
            | Self::Execution { task, .. }
            | Self::UnknownOperation { task, .. }
            | Self::UndeclaredDependency { task, .. }
            | Self::MissingResult { task, .. }
            | Self::InvalidPattern { task, .. }
            | Self::Io { task, .. } => task,
        }
    }

    pub(crate) fn io(task: &str, path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::InputNotFound {
                task: task.to_string(),
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                task: task.to_string(),
                path: path.to_path_buf(),
                source,
            }
        }
    }
}
