//! Durable job queue.
//!
//! [`QueueBackend`] is the interface the emitter enqueues through;
//! [`FileBroker`] is the file-backed implementation. Workers hand each job to
//! a registered [`JobProcessor`].

pub mod file_broker;
pub mod job;
pub mod store;
pub mod worker_pool;

pub use file_broker::FileBroker;
pub use job::{Job, JobOptions, JobStatus};
pub use store::JobStore;
pub use worker_pool::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// Handles jobs pulled by workers.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Process one job. `Ok` completes it with the returned value, `Err`
    /// counts as a failed attempt.
    async fn process(&self, job: &Job) -> Result<Value>;

    /// Called once when a job becomes permanently failed.
    async fn on_failed(&self, _job: &Job, _error: &str) {}
}

/// Counts by state, taken from a single consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Waiting and visible now.
    pub waiting: usize,
    /// Waiting but not yet visible.
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    /// Visible jobs held back because the queue is paused.
    pub paused: usize,
    pub is_paused: bool,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }
}

/// Retention windows for [`QueueBackend::clean`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanPolicy {
    pub completed_older_than: Duration,
    pub failed_older_than: Duration,
}

impl Default for CleanPolicy {
    fn default() -> Self {
        Self {
            completed_older_than: Duration::from_secs(24 * 60 * 60),
            failed_older_than: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// A queue backend.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Queue name.
    fn name(&self) -> &str;

    /// Enqueue a job. Idempotent on `options.job_id` while that job is not
    /// terminal.
    async fn add(&self, name: &str, data: Value, options: JobOptions) -> Result<Job>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    async fn get_stats(&self) -> Result<QueueStats>;

    /// Whether the backing store is readable and writable.
    async fn is_healthy(&self) -> bool;

    /// Stop handing out waiting jobs. Active jobs keep running.
    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    fn is_paused(&self) -> bool;

    /// Remove terminal jobs older than the policy's windows. Returns the
    /// number removed.
    async fn clean(&self, policy: &CleanPolicy) -> Result<usize>;

    /// Register the processor workers hand jobs to.
    fn set_processor(&self, processor: Arc<dyn JobProcessor>);

    /// Start workers and background maintenance.
    async fn start(&self) -> Result<()>;

    /// Stop workers, waiting for in-flight jobs.
    async fn shutdown(&self);
}
