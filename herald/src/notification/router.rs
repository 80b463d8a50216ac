//! Channel fan-out.
//!
//! For each configured channel the router picks the first healthy provider,
//! delivers through the [`RetryExecutor`] and turns every outcome, including
//! errors and panics, into exactly one [`NotificationResult`].

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::provider::ChannelProvider;
use super::retry::{RetryExecutor, is_retryable};
use crate::config::EventTypeConfig;
use crate::domain::{DeliveryContext, NotificationResult};
use crate::{Error, Result};

/// Upper bound on a single provider health check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

type Providers = Vec<Arc<dyn ChannelProvider>>;

/// Health of one registered provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub healthy: bool,
}

/// Routes events to channel providers.
pub struct Router {
    /// Providers per channel, in registration order.
    providers: RwLock<HashMap<String, Providers>>,
    executor: RetryExecutor,
}

impl Router {
    pub fn new(executor: RetryExecutor) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            executor,
        }
    }

    /// Register a provider for its channel. A provider with the same name on
    /// the same channel is replaced in place.
    pub fn register_provider(&self, provider: Arc<dyn ChannelProvider>) {
        let channel = provider.channel().to_string();
        let name = provider.name().to_string();

        let mut providers = self.providers.write();
        let list = providers.entry(channel.clone()).or_default();
        match list.iter().position(|p| p.name() == name) {
            Some(index) => {
                list[index] = provider;
                info!(channel = %channel, provider = %name, "Replaced channel provider");
            }
            None => {
                list.push(provider);
                info!(channel = %channel, provider = %name, "Registered channel provider");
            }
        }
    }

    /// Validate `config` with the provider, then register it.
    pub fn register_provider_with_config(
        &self,
        provider: Arc<dyn ChannelProvider>,
        config: &Value,
    ) -> Result<()> {
        provider.validate_config(config).map_err(|problems| {
            Error::config(format!(
                "provider {} for channel {} rejected its configuration: {}",
                provider.name(),
                provider.channel(),
                problems.join("; ")
            ))
        })?;
        self.register_provider(provider);
        Ok(())
    }

    /// Remove a provider. Returns whether one was removed.
    pub fn unregister_provider(&self, channel: &str, name: &str) -> bool {
        let mut providers = self.providers.write();
        let Some(list) = providers.get_mut(channel) else {
            return false;
        };

        let before = list.len();
        list.retain(|p| p.name() != name);
        let removed = list.len() != before;
        if list.is_empty() {
            providers.remove(channel);
        }

        if removed {
            info!(channel = %channel, provider = %name, "Unregistered channel provider");
        }
        removed
    }

    /// Whether shutdown has started cutting channel retries short.
    pub fn is_cancelled(&self) -> bool {
        self.executor.is_cancelled()
    }

    /// Channels that have at least one provider.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.providers.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn providers_for(&self, channel: &str) -> Vec<Arc<dyn ChannelProvider>> {
        self.providers
            .read()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver `payload` to every channel of `config`.
    ///
    /// Channels run concurrently. The returned vector has one entry per
    /// configured channel, in configured order.
    pub async fn route(
        &self,
        config: &EventTypeConfig,
        payload: &Value,
        context: &DeliveryContext,
    ) -> Vec<NotificationResult> {
        let attempts = config.effective_retry_attempts(self.executor.policy().max_attempts);
        let payload = Arc::new(payload.clone());

        let handles: Vec<_> = config
            .channels
            .iter()
            .map(|channel| {
                let channel = channel.clone();
                let providers = self.providers_for(&channel);
                let executor = self.executor.clone();
                let payload = payload.clone();
                let context = context.clone();
                tokio::spawn(route_channel(
                    channel, providers, executor, attempts, payload, context,
                ))
            })
            .collect();

        let results = join_all(handles).await;

        results
            .into_iter()
            .zip(config.channels.iter())
            .map(|(joined, channel)| match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        event_id = %context.event_id,
                        channel = %channel,
                        error = %e,
                        "Channel delivery task aborted"
                    );
                    NotificationResult::failed(channel, "", format!("delivery task failed: {}", e))
                }
            })
            .collect()
    }

    /// Healthy iff at least one registered provider is healthy.
    pub async fn health_check(&self) -> bool {
        let providers: Vec<_> = self.providers.read().values().flatten().cloned().collect();
        let checks = providers.iter().map(|p| check_health(p.as_ref()));
        join_all(checks).await.into_iter().any(|healthy| healthy)
    }

    /// Per channel, the health of every provider.
    pub async fn health_report(&self) -> BTreeMap<String, Vec<ProviderHealth>> {
        let snapshot: Vec<(String, Providers)> = self
            .providers
            .read()
            .iter()
            .map(|(channel, list)| (channel.clone(), list.clone()))
            .collect();

        let mut report = BTreeMap::new();
        for (channel, list) in snapshot {
            let checks = join_all(list.iter().map(|p| check_health(p.as_ref()))).await;
            let entries = list
                .iter()
                .zip(checks)
                .map(|(p, healthy)| ProviderHealth {
                    name: p.name().to_string(),
                    healthy,
                })
                .collect();
            report.insert(channel, entries);
        }
        report
    }
}

async fn check_health(provider: &dyn ChannelProvider) -> bool {
    match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, provider.health_check()).await {
        Ok(healthy) => healthy,
        Err(_) => {
            warn!(
                channel = %provider.channel(),
                provider = %provider.name(),
                "Provider health check timed out"
            );
            false
        }
    }
}

/// First provider whose health check passes.
async fn select_provider(providers: &[Arc<dyn ChannelProvider>]) -> Option<Arc<dyn ChannelProvider>> {
    for provider in providers {
        if check_health(provider.as_ref()).await {
            return Some(provider.clone());
        }
        debug!(
            channel = %provider.channel(),
            provider = %provider.name(),
            "Skipping unhealthy provider"
        );
    }
    None
}

async fn route_channel(
    channel: String,
    providers: Providers,
    executor: RetryExecutor,
    attempts: u32,
    payload: Arc<Value>,
    context: DeliveryContext,
) -> NotificationResult {
    let Some(provider) = select_provider(&providers).await else {
        warn!(
            event_id = %context.event_id,
            channel = %channel,
            registered = providers.len(),
            "No healthy provider for channel"
        );
        return NotificationResult::no_healthy_provider(channel);
    };
    let provider_name = provider.name().to_string();

    let result = executor
        .execute_with_result(attempts, |attempt| {
            let provider = provider.clone();
            let payload = payload.clone();
            let context = context.for_attempt(attempt);
            let channel = channel.clone();
            let provider_name = provider_name.clone();

            async move {
                match provider.send(&payload, &context).await {
                    Ok(mut result) => {
                        result.channel = channel;
                        if result.provider.is_empty() {
                            result.provider = provider_name;
                        }
                        result
                    }
                    Err(e) => {
                        warn!(
                            event_id = %context.event_id,
                            channel = %channel,
                            provider = %provider_name,
                            attempt,
                            error = %e,
                            "Provider send failed"
                        );
                        NotificationResult::failed(channel, provider_name, e.to_string())
                            .with_metadata("retryable", json!(is_retryable(&e)))
                    }
                }
            }
        })
        .await;

    debug!(
        event_id = %context.event_id,
        channel = %result.channel,
        provider = %result.provider,
        status = %result.status,
        attempts = result.attempts,
        "Channel delivery finished"
    );
    result
}
