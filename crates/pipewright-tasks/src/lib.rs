//! Pipewright Tasks - dependency-ordered task execution engine
//!
//! This crate runs named, interdependent tasks in topological order and
//! caches each task's result under a fingerprint of its definition and
//! declared inputs, subject to a pluggable expiry policy.

pub mod cache;
pub mod dag;
pub mod engine;
pub mod expiry;
pub mod fingerprint;
pub mod pipeline;
pub mod reporter;
pub mod store;
pub mod task;

pub use cache::{CacheEntry, CacheError, CacheStats, PruneStats, ResultCache};
pub use dag::{DagError, TaskDag, TaskNode};
pub use engine::{CacheMode, Engine, RunPlan, TaskOutcome};
pub use expiry::{Expiration, ExpiryContext, ExpiryPolicy, ExpirySpan, RunId, SessionId};
pub use fingerprint::{Fingerprint, Fingerprinter};
pub use pipeline::{Pipeline, PipelineError, ResultsTable, RunOptions, RunSummary, TaskState};
pub use reporter::{CollectingReporter, TaskEvent, TaskReporter, TaskReporterRegistry, TracingReporter};
pub use store::{DirStore, KvStore, MemoryStore, StoreError};
pub use task::{
    DefinitionSource, OperationTiming, Task, TaskContext, TaskError, TaskStatus, ENTRY_OPERATION,
};
