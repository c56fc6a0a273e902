//! Task execution reporting

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::task::TaskStatus;

/// Events emitted during a pipeline run
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A task is starting (cache lookup and, on a miss, execution)
    Started { task: String },
    /// A task finished without error
    Completed {
        task: String,
        duration: Duration,
        cached: bool,
    },
    /// A task failed
    Failed {
        task: String,
        duration: Duration,
        error: String,
    },
    /// A task was not started
    NotStarted { task: String, reason: String },
    /// A task's status changed
    StatusChanged {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// An execution wave is starting
    WaveStarted { wave: usize, task_count: usize },
    /// A cache entry was removed after the run
    Evicted { task: String, key: String },
    /// All tasks completed
    AllCompleted {
        total: usize,
        succeeded: usize,
        failed: usize,
        cached: usize,
        duration: Duration,
    },
}

/// Trait for reporting task execution progress
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Started { task } => {
                tracing::info!("Running {}...", task);
            }
            TaskEvent::Completed {
                task,
                duration,
                cached,
            } => {
                if *cached {
                    tracing::info!("{} used previous result", task);
                } else {
                    tracing::info!("{} done in {}", task, format_duration(*duration));
                }
            }
            TaskEvent::Failed {
                task,
                duration,
                error,
            } => {
                tracing::error!(
                    "{} failed after {}: {}",
                    task,
                    format_duration(*duration),
                    error
                );
            }
            TaskEvent::NotStarted { task, reason } => {
                tracing::info!("{} not started: {}", task, reason);
            }
            TaskEvent::StatusChanged { task, from, to } => {
                tracing::debug!(task = %task, %from, %to, "status changed");
            }
            TaskEvent::WaveStarted { wave, task_count } => {
                tracing::debug!("Starting wave {} ({} tasks)", wave, task_count);
            }
            TaskEvent::Evicted { task, key } => {
                tracing::debug!(task = %task, key = %key, "cache entry evicted");
            }
            TaskEvent::AllCompleted {
                total,
                succeeded,
                failed,
                cached,
                duration,
            } => {
                tracing::info!(
                    "Pipeline complete: {}/{} succeeded, {} failed, {} cached ({})",
                    succeeded,
                    total,
                    failed,
                    cached,
                    format_duration(*duration)
                );
            }
        }
    }
}

/// `m:ss.ss`, the way run times are shown to users
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    let minutes = (secs / 60.0).floor();
    format!("{}:{:05.2}", minutes as u64, secs - minutes * 60.0)
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of tasks that emitted `Started`, in order
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::Started { task } => Some(task),
                _ => None,
            })
            .collect()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Registry of task reporters
#[derive(Clone)]
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    /// Register a reporter the caller keeps a handle to
    pub fn register_shared(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        self.broadcast(event);
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
