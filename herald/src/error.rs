//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Configuration and infrastructure failures are errors. Delivery outcomes
/// are reported as [`NotificationResult`](crate::domain::NotificationResult)
/// data and only appear here while a provider attempt is in flight.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Invalid configuration for event type {event_type}: {reason}")]
    InvalidEventTypeConfig { event_type: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Delivery failed{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Delivery { status: Option<u16>, message: String },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// The job moved on since this attempt claimed it.
    #[error("Job {id} is no longer held by attempt {attempt}")]
    StaleClaim { id: String, attempt: u32 },

    /// Work cut short by shutdown before it could finish.
    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn queue_unavailable(msg: impl Into<String>) -> Self {
        Self::QueueUnavailable(msg.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery {
            status: None,
            message: msg.into(),
        }
    }

    pub fn delivery_status(status: u16, msg: impl Into<String>) -> Self {
        Self::Delivery {
            status: Some(status),
            message: msg.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Errors caused by event-type configuration. These are surfaced to the
    /// caller immediately and never retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownEventType(_)
                | Self::InvalidEventTypeConfig { .. }
                | Self::Configuration(_)
        )
    }
}
