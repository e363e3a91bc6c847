//! Plugin job pipeline.
//!
//! Request handlers submit [`JobSpec`]s to the [`JobQueue`], which persists
//! them and wakes the [`Worker`]. The worker owns the
//! [`plugin_system::PluginManager`] and runs one job at a time, streaming the
//! operation's progress into the job's log.

mod dispatch;
pub mod error;
pub mod job;
pub mod queue;
pub mod store;
pub mod worker;

pub use error::{JobError, JobResult, StorageError};
pub use job::{Job, JobAction, JobId, JobSpec, JobStatus};
pub use queue::{JobFilter, JobQueue, QueueConfig, INTERRUPTED_ERROR};
pub use store::{JobStorage, JsonJobStorage};
pub use worker::{Worker, WorkerConfig, WorkerHandle};
