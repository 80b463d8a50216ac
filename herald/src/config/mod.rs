//! Application configuration.
//!
//! Configuration is read once at startup from a JSON file and a handful of
//! environment variables. Every field has a default, so an empty object is a
//! valid configuration file.

pub mod event_types;

pub use event_types::{EventTypeConfig, EventTypeSource, StaticEventTypes};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::RetryPolicy;
use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    pub logging: LoggingSettings,
    pub queue: QueueSettings,
    /// Default backoff policy for channel retries.
    pub retry: RetryPolicy,
    pub result_store: ResultStoreSettings,
    pub emitter: EmitterSettings,
    pub event_types: HashMap<String, EventTypeConfig>,
    /// Provider name to provider-specific configuration.
    pub providers: HashMap<String, Value>,
}

impl HeraldConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            Error::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Override the queue directory and worker count, then re-validate.
    pub fn apply_overrides(
        &mut self,
        data_dir: Option<PathBuf>,
        concurrency: Option<usize>,
    ) -> Result<()> {
        if let Some(dir) = data_dir.filter(|d| !d.as_os_str().is_empty()) {
            self.queue.data_dir = dir;
        }
        if let Some(concurrency) = concurrency {
            self.queue.concurrency = concurrency;
        }
        self.validate()
    }

    /// Check settings and every event type.
    pub fn validate(&self) -> Result<()> {
        if self.queue.name.trim().is_empty() {
            return Err(Error::config("queue.name must not be empty"));
        }
        if self
            .queue
            .name
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            return Err(Error::config(format!(
                "queue.name {:?} may only contain ASCII letters, digits, '-' and '_'",
                self.queue.name
            )));
        }
        if self.queue.concurrency == 0 {
            return Err(Error::config("queue.concurrency must be at least 1"));
        }
        if self.queue.backoff.max_attempts == 0 {
            return Err(Error::config("queue.backoff.max_attempts must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_factor < 1.0 || self.queue.backoff.backoff_factor < 1.0 {
            return Err(Error::config("backoff_factor must be >= 1.0"));
        }
        for (field, value) in [
            ("queue.poll_interval_ms", self.queue.poll_interval_ms),
            ("queue.job_timeout_secs", self.queue.job_timeout_secs),
            ("queue.cleanup_interval_secs", self.queue.cleanup_interval_secs),
            ("result_store.cleanup_interval_secs", self.result_store.cleanup_interval_secs),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than 0", field)));
            }
        }
        // A job still inside its timeout must never be handed to a second worker.
        if self.queue.stalled_after_secs <= self.queue.job_timeout_secs {
            return Err(Error::config(format!(
                "queue.stalled_after_secs ({}) must be greater than queue.job_timeout_secs ({})",
                self.queue.stalled_after_secs, self.queue.job_timeout_secs
            )));
        }
        for (name, event_type) in &self.event_types {
            event_type.validate(name)?;
        }
        Ok(())
    }

    /// Event type source backed by `event_types`.
    pub fn event_type_source(&self) -> StaticEventTypes {
        StaticEventTypes::new(self.event_types.clone())
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive, used when `RUST_LOG` is not set.
    pub filter: Option<String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Also write daily-rotated log files to this directory.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: None,
            json: false,
            directory: None,
            file_prefix: "herald.log".to_string(),
        }
    }
}

/// Durable queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Queue name, also the store file stem.
    pub name: String,
    pub data_dir: PathBuf,
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Attempts per job (`max_attempts`) and the re-visibility backoff
    /// between them.
    pub backoff: RetryPolicy,
    pub poll_interval_ms: u64,
    pub job_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Active jobs older than this are considered stalled.
    pub stalled_after_secs: u64,
    pub completed_retention_secs: u64,
    pub failed_retention_secs: u64,
}

impl QueueSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn stalled_after(&self) -> Duration {
        Duration::from_secs(self.stalled_after_secs)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "notifications".to_string(),
            data_dir: PathBuf::from("./data/queue"),
            concurrency: 5,
            backoff: RetryPolicy::default(),
            poll_interval_ms: 1000,
            job_timeout_secs: 300,
            cleanup_interval_secs: 3600,
            stalled_after_secs: 600,
            completed_retention_secs: 24 * 60 * 60,
            failed_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultStoreSettings {
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl ResultStoreSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for ResultStoreSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            cleanup_interval_secs: 60,
        }
    }
}

/// Emitter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterSettings {
    /// Wait used when neither the caller nor the event type sets a timeout.
    pub default_timeout_ms: u64,
}

impl EmitterSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for EmitterSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}
