//! Delivery outcomes reported back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Channel name used when a failure cannot be attributed to a configured channel.
pub const UNKNOWN_CHANNEL: &str = "unknown";

/// Error recorded when a channel has no healthy provider.
pub const NO_HEALTHY_PROVIDER: &str = "no healthy provider";

/// Error recorded on the synthetic result returned when a wait times out.
pub const TIMEOUT_ERROR: &str = "timeout";

/// Status of one channel delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
    Pending,
    Retrying,
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Skipped => "skipped",
        }
    }

    /// Whether no further attempt will be made for this delivery.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of delivering one event to one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResult {
    pub channel: String,
    pub provider: String,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl NotificationResult {
    fn new(
        channel: impl Into<String>,
        provider: impl Into<String>,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            provider: provider.into(),
            status,
            error,
            sent_at: Utc::now(),
            attempts: 1,
            next_retry_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn sent(channel: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::new(channel, provider, DeliveryStatus::Sent, None)
    }

    pub fn failed(
        channel: impl Into<String>,
        provider: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(channel, provider, DeliveryStatus::Failed, Some(error.into()))
    }

    pub fn skipped(
        channel: impl Into<String>,
        provider: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(channel, provider, DeliveryStatus::Skipped, Some(reason.into()))
    }

    /// Failed result for a channel that had no usable provider.
    pub fn no_healthy_provider(channel: impl Into<String>) -> Self {
        let mut result = Self::failed(channel, "", NO_HEALTHY_PROVIDER);
        result.attempts = 0;
        result
    }

    /// Synthetic result returned when a caller's wait expires before the
    /// event finished processing.
    pub fn pending_timeout() -> Self {
        let mut result = Self::new(
            UNKNOWN_CHANNEL,
            "",
            DeliveryStatus::Pending,
            Some(TIMEOUT_ERROR.to_string()),
        );
        result.attempts = 0;
        result
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_sent(&self) -> bool {
        self.status == DeliveryStatus::Sent
    }
}

/// How an emission was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Sync,
    #[default]
    Async,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

impl std::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller of `emit` gets back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEmissionResult {
    pub event_id: String,
    pub correlation_id: String,
    pub mode: ProcessingMode,
    pub waited_for_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<NotificationResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_duration_ms: Option<u64>,
}

impl EventEmissionResult {
    pub fn new(
        event_id: impl Into<String>,
        correlation_id: impl Into<String>,
        mode: ProcessingMode,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            correlation_id: correlation_id.into(),
            mode,
            waited_for_result: false,
            results: None,
            queued_at: None,
            processed_at: None,
            processing_duration_ms: None,
        }
    }

    /// True when results are present and every channel was delivered.
    pub fn all_sent(&self) -> bool {
        self.results
            .as_ref()
            .is_some_and(|results| !results.is_empty() && results.iter().all(|r| r.is_sent()))
    }

    /// True when the caller stopped waiting before results arrived.
    pub fn timed_out(&self) -> bool {
        self.results.as_ref().is_some_and(|results| {
            results.len() == 1
                && results[0].status == DeliveryStatus::Pending
                && results[0].error.as_deref() == Some(TIMEOUT_ERROR)
        })
    }
}
