//! File-backed queue broker.
//!
//! The broker keeps the queue's jobs in memory behind a single `RwLock` and
//! mirrors them to a [`JobStore`]. Every mutation takes the write lock,
//! applies the change to a copy, persists the copy, and only then swaps it
//! in. A failed write therefore changes neither the file nor memory, and
//! readers always see one consistent state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobOptions, JobStatus, dequeue_order};
use super::store::JobStore;
use super::worker_pool::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};
use super::{CleanPolicy, JobProcessor, QueueBackend, QueueStats};
use crate::config::QueueSettings;
use crate::{Error, Result};

/// Error recorded on jobs interrupted by a process exit.
const INTERRUPTED_ERROR: &str = "interrupted before completion";

/// Error recorded on jobs that stayed active past the stall window.
const STALLED_ERROR: &str = "job stalled";

/// Durable queue persisted to `<data_dir>/<name>.jsonl`.
pub struct FileBroker {
    this: Weak<FileBroker>,
    settings: QueueSettings,
    store: JobStore,
    jobs: RwLock<Vec<Job>>,
    notify: Arc<Notify>,
    paused: AtomicBool,
    processor: parking_lot::RwLock<Option<Arc<dyn JobProcessor>>>,
    pool: WorkerPool,
    started: AtomicBool,
    cancellation_token: CancellationToken,
    maintenance: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl FileBroker {
    /// Open (or create) the queue store and recover jobs interrupted by a
    /// previous process.
    pub async fn open(settings: QueueSettings) -> Result<Arc<Self>> {
        let store = JobStore::new(&settings.data_dir, &settings.name);
        let mut jobs = store.open().await?;

        let now = Utc::now();
        let mut recovered = 0usize;
        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Active) {
            job.fail(INTERRUPTED_ERROR, Duration::ZERO, now)?;
            recovered += 1;
            if job.status == JobStatus::Failed {
                warn!(job_id = %job.id, attempts = job.attempts, "Interrupted job had no attempts left");
            }
        }
        if recovered > 0 {
            store.write(&jobs).await?;
            info!(queue = %settings.name, recovered, "Recovered interrupted jobs");
        }

        info!(
            queue = %settings.name,
            path = %store.path().display(),
            jobs = jobs.len(),
            "Queue opened"
        );

        let pool = WorkerPool::with_config(WorkerPoolConfig::from(&settings));
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            settings,
            store,
            jobs: RwLock::new(jobs),
            notify: Arc::new(Notify::new()),
            paused: AtomicBool::new(false),
            processor: parking_lot::RwLock::new(None),
            pool,
            started: AtomicBool::new(false),
            cancellation_token: CancellationToken::new(),
            maintenance: parking_lot::Mutex::new(None),
        }))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Woken whenever jobs may have become available.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn clean_policy(&self) -> CleanPolicy {
        CleanPolicy {
            completed_older_than: Duration::from_secs(self.settings.completed_retention_secs),
            failed_older_than: Duration::from_secs(self.settings.failed_retention_secs),
        }
    }

    /// Persist `next` and make it the current state.
    async fn commit(&self, current: &mut RwLockWriteGuard<'_, Vec<Job>>, next: Vec<Job>) -> Result<()> {
        self.store.write(&next).await?;
        **current = next;
        Ok(())
    }

    /// Apply `change` to the job with `id` and commit, provided the job is
    /// still active under `attempt`. A worker whose claim was taken over by
    /// stalled recovery gets [`Error::StaleClaim`].
    async fn update_claimed<F>(&self, id: &str, attempt: u32, change: F) -> Result<Job>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<()>,
    {
        let mut jobs = self.jobs.write().await;
        let index = jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| Error::not_found("job", id))?;
        if jobs[index].status != JobStatus::Active || jobs[index].attempts != attempt {
            return Err(Error::StaleClaim {
                id: id.to_string(),
                attempt,
            });
        }

        let mut next = jobs.clone();
        change(&mut next[index], Utc::now())?;
        let job = next[index].clone();
        self.commit(&mut jobs, next).await?;
        Ok(job)
    }

    /// Enqueue a job. See [`QueueBackend::add`].
    pub async fn add_job(&self, name: &str, data: Value, options: JobOptions) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = Job::new(
            name,
            data,
            &options,
            self.settings.backoff.max_attempts,
            Utc::now(),
        );

        let existing = jobs.iter().position(|j| j.id == job.id);
        if let Some(index) = existing
            && !jobs[index].status.is_terminal()
        {
            debug!(job_id = %job.id, status = %jobs[index].status, "Job already queued");
            return Ok(jobs[index].clone());
        }

        let mut next = jobs.clone();
        match existing {
            Some(index) => next[index] = job.clone(),
            None => next.push(job.clone()),
        }
        self.commit(&mut jobs, next).await?;
        drop(jobs);

        debug!(
            queue = %self.settings.name,
            job_id = %job.id,
            name = %job.name,
            priority = %job.priority,
            available_at = %job.available_at,
            "Job enqueued"
        );
        self.notify.notify_one();
        Ok(job)
    }

    /// Claim the next eligible job, moving it to `active`.
    pub async fn dequeue(&self) -> Result<Option<Job>> {
        if self.is_paused() {
            return Ok(None);
        }

        let mut jobs = self.jobs.write().await;
        if self.is_paused() {
            return Ok(None);
        }

        let now = Utc::now();
        let Some(index) = jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.is_eligible(now))
            .min_by(|(_, a), (_, b)| dequeue_order(a, b))
            .map(|(index, _)| index)
        else {
            return Ok(None);
        };

        let mut next = jobs.clone();
        next[index].start(now)?;
        let job = next[index].clone();
        self.commit(&mut jobs, next).await?;
        Ok(Some(job))
    }

    /// `active -> completed` for the run that claimed `attempt`.
    pub async fn complete(&self, id: &str, attempt: u32, result: Value) -> Result<Job> {
        let job = self
            .update_claimed(id, attempt, |job, now| job.complete(result, now))
            .await?;
        info!(job_id = %job.id, attempts = job.attempts, "Job completed");
        Ok(job)
    }

    /// Record a failed attempt. The job goes back to `waiting` with backoff
    /// while attempts remain, otherwise to `failed`.
    pub async fn fail(&self, id: &str, attempt: u32, error: &str) -> Result<Job> {
        let backoff = &self.settings.backoff;
        let job = self
            .update_claimed(id, attempt, |job, now| {
                let delay = backoff.delay_for_attempt(job.attempts);
                job.fail(error, delay, now)
            })
            .await?;

        match job.status {
            JobStatus::Failed => warn!(
                job_id = %job.id,
                attempts = job.attempts,
                error = %error,
                "Job failed permanently"
            ),
            _ => info!(
                job_id = %job.id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                retry_at = %job.available_at,
                error = %error,
                "Job failed, will retry"
            ),
        }
        Ok(job)
    }

    /// Return a job interrupted by shutdown to `waiting` without spending
    /// the attempt.
    pub async fn release(&self, id: &str, attempt: u32, reason: &str) -> Result<Job> {
        let job = self
            .update_claimed(id, attempt, |job, now| job.release(reason, now))
            .await?;
        info!(job_id = %job.id, attempts = job.attempts, reason = %reason, "Job released");
        self.notify.notify_one();
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.iter().find(|j| j.id == id).cloned()
    }

    /// Snapshot of every job, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        self.jobs
            .read()
            .await
            .iter()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect()
    }

    /// Time until the earliest delayed job becomes visible.
    pub async fn next_wake_in(&self) -> Option<Duration> {
        if self.is_paused() {
            return None;
        }
        let now = Utc::now();
        self.jobs
            .read()
            .await
            .iter()
            .filter(|j| j.is_delayed(now))
            .map(|j| j.available_at)
            .min()
            .and_then(|at| (at - now).to_std().ok())
    }

    pub async fn stats(&self) -> QueueStats {
        let jobs = self.jobs.read().await;
        let now = Utc::now();
        let is_paused = self.is_paused();
        let mut stats = QueueStats {
            is_paused,
            ..Default::default()
        };

        for job in jobs.iter() {
            match job.status {
                JobStatus::Waiting if job.is_delayed(now) => stats.delayed += 1,
                JobStatus::Waiting if is_paused => stats.paused += 1,
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn pause_workers(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!(queue = %self.settings.name, "Queue paused");
        }
    }

    pub fn resume_workers(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!(queue = %self.settings.name, "Queue resumed");
        }
        self.notify.notify_waiters();
    }

    /// Remove terminal jobs past their retention window.
    pub async fn clean_jobs(&self, policy: &CleanPolicy) -> Result<usize> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();
        let cutoff = |window: Duration| {
            chrono::Duration::from_std(window)
                .ok()
                .and_then(|window| now.checked_sub_signed(window))
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        };
        let completed_cutoff = cutoff(policy.completed_older_than);
        let failed_cutoff = cutoff(policy.failed_older_than);

        let next: Vec<Job> = jobs
            .iter()
            .filter(|job| match job.status {
                JobStatus::Completed => !job.finished_before(completed_cutoff),
                JobStatus::Failed => !job.finished_before(failed_cutoff),
                _ => true,
            })
            .cloned()
            .collect();

        let removed = jobs.len() - next.len();
        if removed > 0 {
            self.commit(&mut jobs, next).await?;
            info!(queue = %self.settings.name, removed, "Cleaned old jobs");
        }
        Ok(removed)
    }

    /// Release jobs that stayed active longer than `stalled_after`. Returns
    /// the jobs that changed; those now `failed` have no attempts left.
    pub async fn recover_stalled(&self, stalled_after: Duration) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::from_std(stalled_after)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return Ok(Vec::new());
        };

        let mut next = jobs.clone();
        let mut changed = Vec::new();
        for job in next.iter_mut().filter(|j| {
            j.status == JobStatus::Active && j.processing_started_at.is_none_or(|at| at < cutoff)
        }) {
            job.fail(STALLED_ERROR, Duration::ZERO, now)?;
            changed.push(job.clone());
        }

        if !changed.is_empty() {
            self.commit(&mut jobs, next).await?;
            drop(jobs);
            warn!(queue = %self.settings.name, count = changed.len(), "Recovered stalled jobs");
            self.notify.notify_waiters();
        }
        Ok(changed)
    }

    /// One maintenance pass: retention cleanup, then stalled-job recovery.
    pub async fn run_maintenance(&self) {
        if let Err(e) = self.clean_jobs(&self.clean_policy()).await {
            error!(queue = %self.settings.name, error = %e, "Queue cleanup failed");
        }

        match self.recover_stalled(self.settings.stalled_after()).await {
            Ok(changed) => {
                let processor = self.processor.read().clone();
                if let Some(processor) = processor {
                    for job in changed.iter().filter(|j| j.status == JobStatus::Failed) {
                        processor.on_failed(job, STALLED_ERROR).await;
                    }
                }
            }
            Err(e) => error!(queue = %self.settings.name, error = %e, "Stalled job recovery failed"),
        }
    }

    pub fn worker_stats(&self) -> WorkerPoolStats {
        self.pool.stats()
    }

    async fn start_workers(&self) -> Result<()> {
        let processor = self
            .processor
            .read()
            .clone()
            .ok_or_else(|| Error::config("no job processor registered"))?;
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| Error::Other("queue broker dropped".to_string()))?;

        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.pool.start(this.clone(), processor);

        let token = self.cancellation_token.clone();
        let interval = self.settings.cleanup_interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Queue maintenance task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        this.run_maintenance().await;
                    }
                }
            }
        });
        *self.maintenance.lock() = Some(handle);

        info!(queue = %self.settings.name, "Queue started");
        Ok(())
    }

    async fn stop(&self) {
        self.cancellation_token.cancel();
        self.pool.stop().await;

        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Queue maintenance task ended abnormally");
        }
        info!(queue = %self.settings.name, "Queue stopped");
    }
}

#[async_trait]
impl QueueBackend for FileBroker {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn add(&self, name: &str, data: Value, options: JobOptions) -> Result<Job> {
        self.add_job(name, data, options).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.get(id).await)
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        Ok(self.stats().await)
    }

    async fn is_healthy(&self) -> bool {
        match self.store.check_access().await {
            Ok(()) => true,
            Err(e) => {
                warn!(queue = %self.settings.name, error = %e, "Queue health check failed");
                false
            }
        }
    }

    async fn pause(&self) -> Result<()> {
        self.pause_workers();
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.resume_workers();
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn clean(&self, policy: &CleanPolicy) -> Result<usize> {
        self.clean_jobs(policy).await
    }

    fn set_processor(&self, processor: Arc<dyn JobProcessor>) {
        *self.processor.write() = Some(processor);
    }

    async fn start(&self) -> Result<()> {
        self.start_workers().await
    }

    async fn shutdown(&self) {
        self.stop().await;
    }
}
