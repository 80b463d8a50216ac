//! Event entity and per-delivery context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// A single emission of a typed business event.
///
/// Created by the emitter and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Globally unique id, also the idempotency key of the queued job.
    pub event_id: String,
    /// Caller-facing trace id.
    pub correlation_id: String,
    pub event_type: String,
    /// Opaque to the dispatch engine.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Create a new event with a fresh id. A correlation id is generated
    /// when the caller does not supply one.
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Build the delivery context for the first attempt of this event.
    pub fn delivery_context(&self, metadata: HashMap<String, Value>) -> DeliveryContext {
        DeliveryContext {
            event_id: self.event_id.clone(),
            correlation_id: self.correlation_id.clone(),
            event_type: self.event_type.clone(),
            attempt: 1,
            metadata,
        }
    }
}

/// What a channel provider knows about the delivery it is performing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryContext {
    pub event_id: String,
    pub correlation_id: String,
    pub event_type: String,
    /// 1-indexed attempt number for the current channel.
    pub attempt: u32,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl DeliveryContext {
    /// Copy of this context for the given attempt.
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_event_generates_distinct_ids() {
        let event = Event::new("user.welcome", json!({"userId": 123}), None);
        assert_ne!(event.event_id, event.correlation_id);
        assert!(Uuid::parse_str(&event.event_id).is_ok());

        let other = Event::new("user.welcome", json!({}), None);
        assert_ne!(event.event_id, other.event_id);
    }

    #[test]
    fn test_supplied_correlation_id_is_kept() {
        let event = Event::new("order.paid", json!({}), Some("req-42".to_string()));
        assert_eq!(event.correlation_id, "req-42");
    }

    #[test]
    fn test_delivery_context_attempts() {
        let event = Event::new("order.paid", json!({}), None);
        let ctx = event.delivery_context(HashMap::new());
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.event_id, event.event_id);

        let third = ctx.for_attempt(3);
        assert_eq!(third.attempt, 3);
        assert_eq!(third.correlation_id, ctx.correlation_id);
    }
}
