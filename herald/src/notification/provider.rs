//! Channel provider trait.

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;
use crate::domain::{DeliveryContext, NotificationResult};

/// Delivers payloads to one channel.
///
/// A provider may either return `Err` or an `Ok` result whose status is not
/// `sent`; the router retries both the same way. Returned results need not
/// fill in `attempts`, the router records that.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Provider name, unique within its channel.
    fn name(&self) -> &str;

    /// Channel this provider delivers to.
    fn channel(&self) -> &str;

    /// Deliver one payload.
    async fn send(&self, payload: &Value, context: &DeliveryContext) -> Result<NotificationResult>;

    /// Whether the provider can currently accept deliveries.
    async fn health_check(&self) -> bool;

    /// Check provider-specific configuration, listing every problem found.
    fn validate_config(&self, _config: &Value) -> std::result::Result<(), Vec<String>> {
        Ok(())
    }
}
