//! Provider that writes deliveries to the application log.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

use crate::Result;
use crate::domain::{DeliveryContext, NotificationResult};
use crate::notification::provider::ChannelProvider;

/// Logs every delivery at `info` level. Useful as a default sink and for
/// wiring checks.
pub struct LogProvider {
    name: String,
    channel: String,
    healthy: AtomicBool,
    delivered: AtomicU64,
}

impl LogProvider {
    pub fn new(channel: impl Into<String>) -> Self {
        Self::named("log", channel)
    }

    pub fn named(name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
            healthy: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
        }
    }

    /// Toggle the health check result at runtime.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of deliveries written so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelProvider for LogProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(&self, payload: &Value, context: &DeliveryContext) -> Result<NotificationResult> {
        info!(
            channel = %self.channel,
            provider = %self.name,
            event_id = %context.event_id,
            correlation_id = %context.correlation_id,
            event_type = %context.event_type,
            attempt = context.attempt,
            payload = %payload,
            "Notification delivered"
        );
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(NotificationResult::sent(&self.channel, &self.name))
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeliveryStatus, Event};
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_log_provider_delivers() {
        let provider = LogProvider::new("audit");
        let event = Event::new("user.welcome", json!({"userId": 1}), None);
        let ctx = event.delivery_context(HashMap::new());

        let result = provider.send(&event.payload, &ctx).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Sent);
        assert_eq!(result.channel, "audit");
        assert_eq!(result.provider, "log");
        assert_eq!(provider.delivered(), 1);
    }

    #[tokio::test]
    async fn test_health_toggle() {
        let provider = LogProvider::named("console", "audit");
        assert!(provider.health_check().await);
        provider.set_healthy(false);
        assert!(!provider.health_check().await);
    }
}
