//! Retry with exponential backoff.
//!
//! The executor never decides on its own whether an error is worth retrying.
//! It exposes [`is_retryable`] and friends so callers can make that call.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{DeliveryStatus, NotificationResult, RetryPolicy};
use crate::{Error, Result};

/// A value that reports its own success, for [`RetryExecutor::execute_with_result`].
pub trait RetryOutcome: Sized {
    /// Whether the attempt that produced this value should end the retry loop.
    fn is_success(&self) -> bool;

    /// Record which 1-indexed attempt produced this value.
    fn record_attempt(&mut self, attempt: u32);

    /// Mark this value as superseded by another attempt after `delay`.
    fn schedule_retry(&mut self, delay: Duration);

    /// Convert the last observed value once attempts are exhausted.
    fn into_exhausted(self) -> Self;
}

impl RetryOutcome for NotificationResult {
    /// Deliveries a provider deliberately skipped are not retried.
    fn is_success(&self) -> bool {
        matches!(self.status, DeliveryStatus::Sent | DeliveryStatus::Skipped)
    }

    fn record_attempt(&mut self, attempt: u32) {
        self.attempts = attempt;
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.status = DeliveryStatus::Retrying;
        self.next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|delay| Utc::now() + delay);
    }

    fn into_exhausted(mut self) -> Self {
        if !self.is_success() {
            self.status = DeliveryStatus::Failed;
        }
        self.next_retry_at = None;
        self
    }
}

/// Runs an operation up to N times, sleeping with backoff in between.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancellation_token: Option<CancellationToken>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancellation_token: None,
        }
    }

    /// Abort inter-attempt sleeps when `token` is cancelled. The last
    /// observed error or result is returned in that case.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether retries are currently being cut short.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Run `operation` until it succeeds or `max_attempts` attempts were made,
    /// returning the last error on exhaustion.
    ///
    /// `operation` receives the 1-indexed attempt number. A `max_attempts` of 0
    /// is treated as 1.
    pub async fn execute<F, Fut, T>(&self, max_attempts: u32, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts {
                        debug!(attempt, error = %err, "Retry attempts exhausted");
                        return Err(err);
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        retryable = is_retryable(&err),
                        error = %err,
                        "Attempt failed, retrying"
                    );

                    if !self.sleep(delay).await {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Like [`execute`](Self::execute) for operations that report failure in
    /// their return value. Never fails: on exhaustion the last value is
    /// returned through [`RetryOutcome::into_exhausted`].
    pub async fn execute_with_result<F, Fut, T>(&self, max_attempts: u32, mut operation: F) -> T
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
        T: RetryOutcome,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let mut outcome = operation(attempt).await;
            outcome.record_attempt(attempt);

            if outcome.is_success() {
                return outcome;
            }
            if attempt >= max_attempts {
                return outcome.into_exhausted();
            }

            let delay = self.policy.delay_for_attempt(attempt);
            outcome.schedule_retry(delay);
            debug!(
                attempt,
                max = max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Unsuccessful outcome, retrying"
            );

            if !self.sleep(delay).await {
                return outcome.into_exhausted();
            }
            attempt += 1;
        }
    }

    /// Returns false when cancelled before the delay elapsed.
    async fn sleep(&self, delay: Duration) -> bool {
        match &self.cancellation_token {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Retry sleep cancelled");
                        false
                    }
                    _ = tokio::time::sleep(delay) => true,
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

/// Classify an error as transient.
///
/// Retryable: timeouts, rate limits, connection-level I/O failures, an
/// unavailable queue, and delivery failures with HTTP 408/429/5xx or a
/// transient-looking message.
pub fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Timeout(_) | Error::RateLimited(_) | Error::QueueUnavailable(_) => true,
        Error::Delivery {
            status: Some(status),
            ..
        } => is_retryable_status(*status),
        Error::Delivery {
            status: None,
            message,
        } => is_retryable_message(message),
        Error::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
        ),
        Error::Other(message) => is_retryable_message(message),
        _ => false,
    }
}

/// HTTP 408, 429 and every 5xx.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

const RETRYABLE_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "econnreset",
    "connection reset",
    "econnrefused",
    "connection refused",
    "socket hang up",
    "rate limit",
    "too many requests",
    "temporarily unavailable",
    "service unavailable",
];

/// Heuristic for errors that only carry a message.
pub fn is_retryable_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    RETRYABLE_MARKERS.iter().any(|marker| message.contains(marker))
}
