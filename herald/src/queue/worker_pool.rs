//! Worker pool draining a [`FileBroker`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::file_broker::FileBroker;
use super::job::{Job, JobStatus};
use super::JobProcessor;
use crate::Error;
use crate::config::QueueSettings;
use crate::domain::RetryPolicy;
use crate::notification::RetryExecutor;

/// Attempts made to record a job's outcome before giving up on it.
const STATE_WRITE_ATTEMPTS: u32 = 3;

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of workers, and so the maximum number of jobs in flight.
    pub concurrency: usize,
    /// Job timeout in seconds.
    ///
    /// A job running longer is aborted and counted as a failed attempt.
    pub job_timeout_secs: u64,
    /// Upper bound on how long an idle worker sleeps between polls.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            job_timeout_secs: 300,
            poll_interval_ms: 1000,
        }
    }
}

impl From<&QueueSettings> for WorkerPoolConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            job_timeout_secs: settings.job_timeout_secs,
            poll_interval_ms: settings.poll_interval_ms,
        }
    }
}

/// Worker pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    pub workers: usize,
    /// Jobs currently being processed.
    pub busy: usize,
    pub completed: u64,
    /// Failed attempts that were scheduled for another try.
    pub retried: u64,
    /// Jobs that failed permanently.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    busy: AtomicUsize,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

/// A fixed set of workers pulling jobs from one broker.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    counters: Arc<Counters>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::with_config(WorkerPoolConfig::default())
    }

    pub fn with_config(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            counters: Arc::new(Counters::default()),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers.
    pub fn start(&self, broker: Arc<FileBroker>, processor: Arc<dyn JobProcessor>) {
        let worker = Worker {
            broker,
            processor,
            counters: self.counters.clone(),
            cancellation_token: self.cancellation_token.clone(),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms.max(1)),
            job_timeout: Duration::from_secs(self.config.job_timeout_secs),
            state_writes: RetryExecutor::new(RetryPolicy {
                max_attempts: STATE_WRITE_ATTEMPTS,
                initial_delay_ms: 100,
                backoff_factor: 2.0,
                max_delay_ms: 1000,
                jitter: false,
            }),
        };

        info!(workers = self.config.concurrency, "Starting queue worker pool");

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for id in 0..self.config.concurrency {
                join_set.spawn(worker.clone().run(id));
            }
        }
    }

    /// Stop the workers, waiting for in-flight jobs to finish.
    pub async fn stop(&self) {
        info!("Stopping queue worker pool");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Queue worker ended abnormally");
                }
            }
        }

        info!("Queue worker pool stopped");
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            workers: self.config.concurrency,
            busy: self.counters.busy.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct Worker {
    broker: Arc<FileBroker>,
    processor: Arc<dyn JobProcessor>,
    counters: Arc<Counters>,
    cancellation_token: CancellationToken,
    poll_interval: Duration,
    job_timeout: Duration,
    state_writes: RetryExecutor,
}

impl Worker {
    async fn run(self, id: usize) {
        debug!(worker = id, "Queue worker started");
        let notifier = self.broker.notifier();

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.broker.dequeue().await {
                Ok(Some(job)) => {
                    debug!(worker = id, job_id = %job.id, name = %job.name, attempt = job.attempts, "Processing job");
                    self.process(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(worker = id, error = %e, "Error dequeuing job"),
            }

            let wait = self
                .broker
                .next_wake_in()
                .await
                .map_or(self.poll_interval, |next| next.min(self.poll_interval));

            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = notifier.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        debug!(worker = id, "Queue worker stopped");
    }

    async fn process(&self, job: Job) {
        self.counters.busy.fetch_add(1, Ordering::SeqCst);

        let processor = self.processor.clone();
        let input = job.clone();
        let mut handle = tokio::spawn(async move { processor.process(&input).await });

        let outcome = match tokio::time::timeout(self.job_timeout, &mut handle).await {
            Ok(Ok(Ok(value))) => Outcome::Done(value),
            Ok(Ok(Err(Error::Interrupted(reason)))) => Outcome::Interrupted(reason),
            Ok(Ok(Err(e))) => Outcome::Failed(e.to_string()),
            Ok(Err(e)) => Outcome::Failed(format!("job processor panicked: {}", e)),
            Err(_) => {
                handle.abort();
                Outcome::Failed(format!(
                    "job timed out after {}s",
                    self.job_timeout.as_secs_f64()
                ))
            }
        };

        let (id, attempt) = (job.id.as_str(), job.attempts);
        match outcome {
            Outcome::Done(value) => {
                let recorded = self
                    .record(&job, || self.broker.complete(id, attempt, value.clone()))
                    .await;
                if recorded.is_some() {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Outcome::Failed(error) => {
                let recorded = self
                    .record(&job, || self.broker.fail(id, attempt, &error))
                    .await;
                if let Some(updated) = recorded {
                    if updated.status == JobStatus::Failed {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        self.processor.on_failed(&updated, &error).await;
                    } else {
                        self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Outcome::Interrupted(reason) => {
                self.record(&job, || self.broker.release(id, attempt, &reason))
                    .await;
            }
        }

        self.counters.busy.fetch_sub(1, Ordering::SeqCst);
    }

    /// Persist a job outcome. On repeated failure the job stays active until
    /// stalled-job recovery releases it. An outcome for a claim that was
    /// taken over is dropped.
    async fn record<F, Fut>(&self, job: &Job, mut write: F) -> Option<Job>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<Job>>,
    {
        let result = self
            .state_writes
            .execute(STATE_WRITE_ATTEMPTS, |_| {
                let pending = write();
                async move {
                    match pending.await {
                        Ok(updated) => Ok(Some(updated)),
                        Err(Error::StaleClaim { .. }) => Ok(None),
                        Err(e) => Err(e),
                    }
                }
            })
            .await;

        match result {
            Ok(Some(updated)) => Some(updated),
            Ok(None) => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    "Job was reclaimed while running, discarding this outcome"
                );
                None
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    error = %e,
                    "Failed to record job outcome, leaving it for stalled recovery"
                );
                None
            }
        }
    }
}

/// How one run of a job ended.
enum Outcome {
    Done(Value),
    Failed(String),
    /// Cut short by shutdown; the attempt is handed back.
    Interrupted(String),
}
