//! Service container.
//!
//! [`Herald`] builds every component from a [`HeraldConfig`], wires them
//! together and owns their lifecycle.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EventTypeSource, HeraldConfig};
use crate::domain::EventEmissionResult;
use crate::notification::channels::{LogProvider, WebhookProvider};
use crate::notification::{
    ChannelProvider, EmitOptions, Emitter, EventJobProcessor, ProviderHealth, ResultStore,
    ResultStoreStats, RetryExecutor, Router,
};
use crate::queue::{FileBroker, QueueBackend, QueueStats, WorkerPoolStats};
use crate::{Error, Result};

/// Overall health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// At least one provider is healthy.
    pub router: bool,
    /// The queue store is readable and writable.
    pub queue: bool,
    pub providers: BTreeMap<String, Vec<ProviderHealth>>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.router && self.queue
    }
}

/// Service statistics.
#[derive(Debug, Clone, Serialize)]
pub struct HeraldStats {
    pub queue: QueueStats,
    pub workers: WorkerPoolStats,
    pub results: ResultStoreStats,
    /// Channels with at least one provider.
    pub channels: Vec<String>,
}

/// The assembled dispatch engine.
pub struct Herald {
    config: HeraldConfig,
    event_types: Arc<dyn EventTypeSource>,
    router: Arc<Router>,
    result_store: Arc<ResultStore>,
    broker: Arc<FileBroker>,
    emitter: Emitter,
    cancellation_token: CancellationToken,
    cleanup: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Herald {
    /// Build the service with event types taken from the configuration.
    pub async fn new(config: HeraldConfig) -> Result<Self> {
        let event_types = Arc::new(config.event_type_source());
        Self::with_event_types(config, event_types).await
    }

    /// Build the service with an external event type source.
    pub async fn with_event_types(
        config: HeraldConfig,
        event_types: Arc<dyn EventTypeSource>,
    ) -> Result<Self> {
        config.validate()?;

        let cancellation_token = CancellationToken::new();
        let executor =
            RetryExecutor::new(config.retry.clone()).with_cancellation(cancellation_token.child_token());
        let router = Arc::new(Router::new(executor));
        let result_store = Arc::new(ResultStore::with_ttl(config.result_store.ttl()));
        let broker = FileBroker::open(config.queue.clone()).await?;

        let queue: Arc<dyn QueueBackend> = broker.clone();
        let emitter = Emitter::new(
            event_types.clone(),
            router.clone(),
            queue,
            result_store.clone(),
            config.emitter.clone(),
        );

        info!(
            event_types = event_types.event_types().len(),
            queue = %config.queue.name,
            "Herald initialized"
        );

        Ok(Self {
            config,
            event_types,
            router,
            result_store,
            broker,
            emitter,
            cancellation_token,
            cleanup: parking_lot::Mutex::new(None),
        })
    }

    /// Register a provider. When `providers.<name>` is configured the
    /// provider validates it first.
    pub fn register_provider(&self, provider: Arc<dyn ChannelProvider>) -> Result<()> {
        match self.config.providers.get(provider.name()) {
            Some(config) => self.router.register_provider_with_config(provider, config),
            None => {
                self.router.register_provider(provider);
                Ok(())
            }
        }
    }

    /// Build and register the providers described under `providers`.
    ///
    /// Each entry carries a `type` of `webhook` or `log`. Returns the number
    /// registered.
    pub fn register_configured_providers(&self) -> Result<usize> {
        let mut names: Vec<&String> = self.config.providers.keys().collect();
        names.sort();

        for name in &names {
            let config = &self.config.providers[*name];
            let provider = build_provider(name, config)?;
            self.router.register_provider_with_config(provider, config)?;
        }
        Ok(names.len())
    }

    /// Start queue workers, queue maintenance and result store cleanup.
    pub async fn start(&self) -> Result<()> {
        let processor = Arc::new(EventJobProcessor::new(
            self.router.clone(),
            self.event_types.clone(),
            self.result_store.clone(),
        ));
        self.broker.set_processor(processor);
        self.broker.start().await?;

        let mut cleanup = self.cleanup.lock();
        if cleanup.is_none() {
            *cleanup = Some(self.spawn_result_cleanup(self.config.result_store.cleanup_interval()));
        }

        info!(
            channels = ?self.router.channels(),
            workers = self.config.queue.concurrency,
            "Herald started"
        );
        Ok(())
    }

    fn spawn_result_cleanup(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.result_store.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Result store cleanup shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        store.cleanup_expired();
                    }
                }
            }
        })
    }

    /// Stop background work and wait for in-flight jobs.
    pub async fn shutdown(&self) {
        info!("Shutting down Herald");
        self.cancellation_token.cancel();
        self.broker.shutdown().await;

        let cleanup = self.cleanup.lock().take();
        if let Some(handle) = cleanup
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Result store cleanup ended abnormally");
        }
        info!("Herald shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub async fn health(&self) -> HealthReport {
        let (providers, queue) = tokio::join!(self.router.health_report(), self.broker.is_healthy());
        let router = providers.values().flatten().any(|p| p.healthy);
        HealthReport {
            router,
            queue,
            providers,
        }
    }

    pub async fn stats(&self) -> HeraldStats {
        HeraldStats {
            queue: self.broker.stats().await,
            workers: self.broker.worker_stats(),
            results: self.result_store.stats(),
            channels: self.router.channels(),
        }
    }

    pub async fn emit(
        &self,
        event_type: &str,
        payload: Value,
        options: EmitOptions,
    ) -> Result<EventEmissionResult> {
        self.emitter.emit(event_type, payload, options).await
    }

    pub async fn emit_and_wait(
        &self,
        event_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<EventEmissionResult> {
        self.emitter.emit_and_wait(event_type, payload, timeout).await
    }

    pub fn config(&self) -> &HeraldConfig {
        &self.config
    }

    pub fn event_types(&self) -> &Arc<dyn EventTypeSource> {
        &self.event_types
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn result_store(&self) -> &Arc<ResultStore> {
        &self.result_store
    }

    pub fn broker(&self) -> &Arc<FileBroker> {
        &self.broker
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }
}

/// Provider described by one `providers` entry.
fn build_provider(name: &str, config: &Value) -> Result<Arc<dyn ChannelProvider>> {
    let kind = config.get("type").and_then(Value::as_str).unwrap_or("webhook");
    match kind {
        "webhook" => Ok(Arc::new(WebhookProvider::from_value(name, config)?)),
        "log" => {
            let channel = config
                .get("channel")
                .and_then(Value::as_str)
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| Error::config(format!("provider {}: missing channel", name)))?;
            Ok(Arc::new(LogProvider::named(name, channel)))
        }
        other => Err(Error::config(format!(
            "provider {}: unknown type {:?}",
            name, other
        ))),
    }
}
