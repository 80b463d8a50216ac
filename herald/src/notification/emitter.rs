//! Public entry point for emitting events.
//!
//! The emitter resolves an event type, decides between synchronous and
//! queued processing, and packages the outcome as an
//! [`EventEmissionResult`]. Only an unknown or invalid event type and an
//! unavailable queue are returned as errors; every delivery outcome,
//! including a caller-side timeout, is reported as data.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::processor::QueuedEvent;
use super::result_store::ResultStore;
use super::router::Router;
use crate::config::{EmitterSettings, EventTypeConfig, EventTypeSource};
use crate::domain::{
    Event, EventEmissionResult, NotificationResult, Priority, ProcessingMode, UNKNOWN_CHANNEL,
};
use crate::queue::{JobOptions, QueueBackend};
use crate::{Error, Result};

/// Requested processing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitMode {
    /// Let the options and the event type decide.
    #[default]
    Auto,
    Sync,
    Async,
}

impl From<ProcessingMode> for EmitMode {
    fn from(mode: ProcessingMode) -> Self {
        match mode {
            ProcessingMode::Sync => Self::Sync,
            ProcessingMode::Async => Self::Async,
        }
    }
}

/// Per-emission options.
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub mode: EmitMode,
    /// `Some(true)` in `Auto` mode selects synchronous processing. In
    /// explicit `Async` mode it waits for the queued event's results.
    /// `None` defers to the event type.
    pub wait_for_result: Option<bool>,
    pub correlation_id: Option<String>,
    /// Upper bound on how long the caller waits for results.
    pub timeout: Option<Duration>,
    /// Overrides the event type's priority for this emission.
    pub priority: Option<Priority>,
    /// Overrides the event type's delay for this emission.
    pub delay: Option<Duration>,
    /// Passed to providers in the delivery context.
    pub metadata: HashMap<String, Value>,
}

impl EmitOptions {
    pub fn with_mode(mut self, mode: EmitMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn wait_for_result(mut self, wait: bool) -> Self {
        self.wait_for_result = Some(wait);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// First match wins: explicit mode, `wait_for_result`, then the event type.
fn resolve_mode(options: &EmitOptions, config: &EventTypeConfig) -> ProcessingMode {
    match options.mode {
        EmitMode::Sync => ProcessingMode::Sync,
        EmitMode::Async => ProcessingMode::Async,
        EmitMode::Auto if options.wait_for_result == Some(true) => ProcessingMode::Sync,
        EmitMode::Auto => config.default_processing,
    }
}

/// Emits events either through the router directly or through the queue.
pub struct Emitter {
    event_types: Arc<dyn EventTypeSource>,
    router: Arc<Router>,
    queue: Arc<dyn QueueBackend>,
    result_store: Arc<ResultStore>,
    settings: EmitterSettings,
}

impl Emitter {
    pub fn new(
        event_types: Arc<dyn EventTypeSource>,
        router: Arc<Router>,
        queue: Arc<dyn QueueBackend>,
        result_store: Arc<ResultStore>,
        settings: EmitterSettings,
    ) -> Self {
        Self {
            event_types,
            router,
            queue,
            result_store,
            settings,
        }
    }

    /// Look up and validate the configuration for `event_type`.
    pub fn event_type_config(&self, event_type: &str) -> Result<EventTypeConfig> {
        let config = self
            .event_types
            .get(event_type)
            .ok_or_else(|| Error::UnknownEventType(event_type.to_string()))?;
        config.validate(event_type)?;
        Ok(config)
    }

    /// Emit one event.
    pub async fn emit(
        &self,
        event_type: &str,
        payload: Value,
        options: EmitOptions,
    ) -> Result<EventEmissionResult> {
        let started = Instant::now();
        let config = self.event_type_config(event_type)?;
        let mode = resolve_mode(&options, &config);
        let event = Event::new(event_type, payload, options.correlation_id.clone());

        debug!(
            event_id = %event.event_id,
            correlation_id = %event.correlation_id,
            event_type = %event_type,
            mode = %mode,
            "Emitting event"
        );

        match mode {
            ProcessingMode::Sync => Ok(self.emit_sync(event, config, options, started).await),
            ProcessingMode::Async => self.emit_async(event, config, options, started).await,
        }
    }

    /// Emit and wait up to `timeout` for the delivery results.
    pub async fn emit_and_wait(
        &self,
        event_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<EventEmissionResult> {
        let options = EmitOptions::default()
            .wait_for_result(true)
            .with_timeout(timeout);
        self.emit(event_type, payload, options).await
    }

    async fn emit_sync(
        &self,
        event: Event,
        config: EventTypeConfig,
        options: EmitOptions,
        started: Instant,
    ) -> EventEmissionResult {
        let mut emission =
            EventEmissionResult::new(&event.event_id, &event.correlation_id, ProcessingMode::Sync);
        emission.waited_for_result = true;

        let limit = options.timeout.or(config.timeout());
        let context = event.delivery_context(options.metadata);
        let router = self.router.clone();
        let store = self.result_store.clone();
        let event_id = event.event_id.clone();
        let payload = event.payload;

        // Runs detached so a caller-side timeout does not cancel delivery.
        let delivery = tokio::spawn(async move {
            let results = router.route(&config, &payload, &context).await;
            store.put(&event_id, results.clone());
            results
        });

        let joined = match limit {
            Some(limit) => tokio::time::timeout(limit, delivery).await.ok(),
            None => Some(delivery.await),
        };

        let results = match joined {
            Some(Ok(results)) => results,
            Some(Err(e)) => {
                error!(event_id = %event.event_id, error = %e, "Synchronous routing failed");
                let failed = vec![NotificationResult::failed(
                    UNKNOWN_CHANNEL,
                    "",
                    format!("routing failed: {}", e),
                )];
                self.result_store.put(&event.event_id, failed.clone());
                failed
            }
            None => {
                warn!(
                    event_id = %event.event_id,
                    timeout_ms = limit.map(|l| l.as_millis() as u64),
                    "Timed out waiting for synchronous delivery"
                );
                emission.results = Some(vec![NotificationResult::pending_timeout()]);
                return emission;
            }
        };

        emission.processed_at = Some(Utc::now());
        emission.processing_duration_ms = Some(started.elapsed().as_millis() as u64);
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            channels = results.len(),
            sent = results.iter().filter(|r| r.is_sent()).count(),
            duration_ms = emission.processing_duration_ms,
            "Event processed synchronously"
        );
        emission.results = Some(results);
        emission
    }

    async fn emit_async(
        &self,
        event: Event,
        config: EventTypeConfig,
        options: EmitOptions,
        started: Instant,
    ) -> Result<EventEmissionResult> {
        let mut emission =
            EventEmissionResult::new(&event.event_id, &event.correlation_id, ProcessingMode::Async);

        let mut job_options = JobOptions::default()
            .with_id(&event.event_id)
            .with_priority(options.priority.unwrap_or(config.priority));
        if let Some(delay) = options.delay.or(config.delay()) {
            job_options = job_options.with_delay(delay);
        }

        let data = serde_json::to_value(QueuedEvent::new(event.clone(), options.metadata))?;
        let job = self.queue.add(&event.event_type, data, job_options).await?;
        emission.queued_at = Some(Utc::now());

        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            queue = %self.queue.name(),
            priority = %job.priority,
            available_at = %job.available_at,
            "Event queued"
        );

        if !options.wait_for_result.unwrap_or(config.wait_for_result) {
            return Ok(emission);
        }

        let timeout = options
            .timeout
            .or(config.timeout())
            .unwrap_or_else(|| self.settings.default_timeout());
        emission.waited_for_result = true;

        match self.result_store.wait(&event.event_id, timeout).await {
            Some(results) => {
                emission.processed_at = Some(Utc::now());
                emission.processing_duration_ms = Some(started.elapsed().as_millis() as u64);
                emission.results = Some(results);
            }
            None => {
                warn!(
                    event_id = %event.event_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for queued event"
                );
                emission.results = Some(vec![NotificationResult::pending_timeout()]);
            }
        }
        Ok(emission)
    }
}
