//! Retry policy value object.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound of the multiplicative jitter applied to a backoff delay.
pub const MAX_JITTER: f64 = 0.1;

/// Exponential backoff policy shared by channel retries and job re-visibility.
///
/// `delay(n) = min(initial_delay * backoff_factor^(n-1) * (1 + jitter), max_delay)`
/// with `jitter` drawn uniformly from `[0, 0.1]` and `n` the 1-indexed attempt
/// that just failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one. Channel retries
    /// use it when an event type sets no `retry_attempts`; the queue uses it
    /// as the per-job attempt limit.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied per additional attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Hard cap on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Whether to add jitter to delays.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_true() -> bool {
    true
}

impl RetryPolicy {
    /// Delay after `attempt` failed, without jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::from_millis(self.cap(base))
    }

    /// Delay after `attempt` failed, including jitter when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.jitter {
            return self.base_delay_for_attempt(attempt);
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let jitter = rand::random::<f64>() * MAX_JITTER;
        let delay =
            self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent) * (1.0 + jitter);
        Duration::from_millis(self.cap(delay))
    }

    fn cap(&self, delay_ms: f64) -> u64 {
        if !delay_ms.is_finite() || delay_ms < 0.0 {
            return self.max_delay_ms;
        }
        delay_ms.min(self.max_delay_ms as f64) as u64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_true(),
        }
    }
}
