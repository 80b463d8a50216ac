//! Event type configuration and the source it is read from.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::{Priority, ProcessingMode};
use crate::{Error, Result};

/// Static description of how one event type is dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTypeConfig {
    #[serde(default)]
    pub description: String,
    /// Channels to fan out to, in result order.
    pub channels: Vec<String>,
    #[serde(default, alias = "defaultProcessing")]
    pub default_processing: ProcessingMode,
    #[serde(default, alias = "waitForResult")]
    pub wait_for_result: bool,
    /// Attempts per channel. `None` falls back to the retry policy.
    #[serde(default, alias = "retryAttempts")]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, alias = "delayMs")]
    pub delay_ms: Option<u64>,
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

impl EventTypeConfig {
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            description: String::new(),
            channels: channels.into_iter().map(Into::into).collect(),
            default_processing: ProcessingMode::default(),
            wait_for_result: false,
            retry_attempts: None,
            priority: Priority::default(),
            delay_ms: None,
            timeout_ms: None,
        }
    }

    pub fn with_processing(mut self, mode: ProcessingMode) -> Self {
        self.default_processing = mode;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Reject configurations that could never deliver anything.
    pub fn validate(&self, event_type: &str) -> Result<()> {
        if self.channels.is_empty() {
            return Err(Error::InvalidEventTypeConfig {
                event_type: event_type.to_string(),
                reason: "no channels configured".to_string(),
            });
        }
        if let Some(blank) = self.channels.iter().find(|c| c.trim().is_empty()) {
            return Err(Error::InvalidEventTypeConfig {
                event_type: event_type.to_string(),
                reason: format!("invalid channel name {:?}", blank),
            });
        }
        Ok(())
    }

    /// Attempts per channel, with `default` used when unset. Every channel is
    /// tried at least once.
    pub fn effective_retry_attempts(&self, default: u32) -> u32 {
        self.retry_attempts.unwrap_or(default).max(1)
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms.map(Duration::from_millis)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Read-only source of event type configuration.
pub trait EventTypeSource: Send + Sync {
    /// Look up the configuration for one event type.
    fn get(&self, event_type: &str) -> Option<EventTypeConfig>;

    /// Names of all known event types.
    fn event_types(&self) -> Vec<String>;
}

/// In-memory event type map, loaded once from configuration.
#[derive(Debug, Default)]
pub struct StaticEventTypes {
    types: RwLock<HashMap<String, EventTypeConfig>>,
}

impl StaticEventTypes {
    pub fn new(types: HashMap<String, EventTypeConfig>) -> Self {
        Self {
            types: RwLock::new(types),
        }
    }

    pub fn with(self, event_type: impl Into<String>, config: EventTypeConfig) -> Self {
        self.insert(event_type, config);
        self
    }

    pub fn insert(&self, event_type: impl Into<String>, config: EventTypeConfig) {
        self.types.write().insert(event_type.into(), config);
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}

impl EventTypeSource for StaticEventTypes {
    fn get(&self, event_type: &str) -> Option<EventTypeConfig> {
        self.types.read().get(event_type).cloned()
    }

    fn event_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }
}
