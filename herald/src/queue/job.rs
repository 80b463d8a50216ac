//! Job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::Priority;
use crate::{Error, Result};

/// Job status.
///
/// `waiting -> active -> completed`, or `active -> waiting` while attempts
/// remain and `active -> failed` once they are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, possibly delayed until `available_at`.
    Waiting,
    /// Claimed by a worker.
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for [`add`](super::QueueBackend::add).
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Job id. Generated when absent. Adding an id that is still waiting or
    /// active returns the existing job.
    pub job_id: Option<String>,
    pub priority: Priority,
    /// Keep the job invisible to workers for this long.
    pub delay: Option<Duration>,
    /// Overrides the queue's default attempt limit.
    pub max_attempts: Option<u32>,
}

impl JobOptions {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    /// Job name, the event type for notification jobs.
    pub name: String,
    pub data: Value,
    pub status: JobStatus,
    /// Attempts started so far.
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Not handed to workers before this instant.
    pub available_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        data: Value,
        options: &JobOptions,
        default_max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: options
                .job_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: name.into(),
            data,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(default_max_attempts).max(1),
            priority: options.priority,
            created_at: now,
            available_at: options.delay.map_or(now, |delay| after(now, delay)),
            processing_started_at: None,
            completed_at: None,
            result: None,
            last_error: None,
        }
    }

    /// Waiting and visible at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.available_at <= now
    }

    /// Waiting but not yet visible at `now`.
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.available_at > now
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    fn expect(&self, status: JobStatus, to: JobStatus) -> Result<()> {
        if self.status != status {
            return Err(Error::invalid_transition(self.status, to));
        }
        Ok(())
    }

    /// `waiting -> active`, counting a new attempt.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect(JobStatus::Waiting, JobStatus::Active)?;
        self.status = JobStatus::Active;
        self.attempts += 1;
        self.processing_started_at = Some(now);
        Ok(())
    }

    /// `active -> completed`.
    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> Result<()> {
        self.expect(JobStatus::Active, JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.result = Some(result);
        self.last_error = None;
        Ok(())
    }

    /// `active -> waiting` after `retry_delay` while attempts remain,
    /// otherwise `active -> failed` with the error recorded in `result`.
    pub fn fail(&mut self, error: &str, retry_delay: Duration, now: DateTime<Utc>) -> Result<()> {
        let retry = self.has_attempts_left();
        let target = if retry { JobStatus::Waiting } else { JobStatus::Failed };
        self.expect(JobStatus::Active, target)?;
        self.last_error = Some(error.to_string());

        if retry {
            self.status = JobStatus::Waiting;
            self.available_at = after(now, retry_delay);
            self.processing_started_at = None;
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            self.result = Some(serde_json::json!({ "error": error }));
        }
        Ok(())
    }

    /// `active -> waiting` without counting the attempt, for work cut short
    /// by shutdown. The job is visible again immediately.
    pub fn release(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.expect(JobStatus::Active, JobStatus::Waiting)?;
        self.status = JobStatus::Waiting;
        self.attempts = self.attempts.saturating_sub(1);
        self.available_at = now;
        self.processing_started_at = None;
        self.last_error = Some(reason.to_string());
        Ok(())
    }

    /// Age of a terminal job, measured from when it finished.
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_terminal() && self.completed_at.unwrap_or(self.created_at) < cutoff
    }
}

/// Dequeue order: highest priority, then earliest `available_at`, then
/// earliest `created_at`.
pub(crate) fn dequeue_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.available_at.cmp(&b.available_at))
        .then_with(|| a.created_at.cmp(&b.created_at))
}
