//! Queue job processor that routes queued events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::result_store::ResultStore;
use super::retry::RetryOutcome;
use super::router::Router;
use crate::config::EventTypeSource;
use crate::domain::{Event, NotificationResult, UNKNOWN_CHANNEL};
use crate::queue::{Job, JobProcessor};
use crate::{Error, Result};

/// Job payload written by the emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEvent {
    #[serde(flatten)]
    pub event: Event,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl QueuedEvent {
    pub fn new(event: Event, metadata: HashMap<String, Value>) -> Self {
        Self { event, metadata }
    }

    pub fn from_job(job: &Job) -> Result<Self> {
        Ok(serde_json::from_value(job.data.clone())?)
    }
}

/// Delivers queued events through the [`Router`] and publishes the results.
///
/// Delivery failures are results, not errors: a job whose channels all
/// failed still completes. Only an unreadable job or an event type that is
/// no longer configured fails the attempt. Undelivered channels during
/// shutdown yield [`Error::Interrupted`] so the job is kept.
pub struct EventJobProcessor {
    router: Arc<Router>,
    event_types: Arc<dyn EventTypeSource>,
    result_store: Arc<ResultStore>,
}

impl EventJobProcessor {
    pub fn new(
        router: Arc<Router>,
        event_types: Arc<dyn EventTypeSource>,
        result_store: Arc<ResultStore>,
    ) -> Self {
        Self {
            router,
            event_types,
            result_store,
        }
    }
}

#[async_trait]
impl JobProcessor for EventJobProcessor {
    async fn process(&self, job: &Job) -> Result<Value> {
        let queued = QueuedEvent::from_job(job)?;
        let event = &queued.event;
        let config = self
            .event_types
            .get(&event.event_type)
            .ok_or_else(|| Error::UnknownEventType(event.event_type.clone()))?;

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            job_attempt = job.attempts,
            "Routing queued event"
        );

        let context = event.delivery_context(queued.metadata.clone());
        let results = self.router.route(&config, &event.payload, &context).await;

        // Retries cut short by shutdown are not a final outcome. Hand the job
        // back so the next run delivers it.
        if self.router.is_cancelled() && !results.iter().all(|r| r.is_success()) {
            warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Delivery interrupted by shutdown, returning job to the queue"
            );
            return Err(Error::Interrupted(format!(
                "delivery of {} cut short by shutdown",
                event.event_id
            )));
        }

        let sent = results.iter().filter(|r| r.is_sent()).count();
        info!(
            event_id = %event.event_id,
            correlation_id = %event.correlation_id,
            event_type = %event.event_type,
            channels = results.len(),
            sent,
            "Queued event processed"
        );

        self.result_store.put(&event.event_id, results.clone());
        Ok(serde_json::to_value(results)?)
    }

    async fn on_failed(&self, job: &Job, error: &str) {
        let event_id = QueuedEvent::from_job(job)
            .map(|queued| queued.event.event_id)
            .unwrap_or_else(|_| job.id.clone());

        warn!(event_id = %event_id, error = %error, "Queued event failed permanently");

        if self.result_store.get(&event_id).is_none() {
            self.result_store.put(
                &event_id,
                vec![NotificationResult::failed(UNKNOWN_CHANNEL, "", error).with_attempts(job.attempts)],
            );
        }
    }
}
