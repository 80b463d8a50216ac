//! Integration tests for herald.
//!
//! These run the assembled service against a real queue directory in a
//! temporary location, with in-process channel providers.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use herald::config::{EventTypeConfig, HeraldConfig};
use herald::domain::{DeliveryContext, DeliveryStatus, NotificationResult, ProcessingMode};
use herald::notification::ChannelProvider;
use herald::notification::channels::LogProvider;
use herald::queue::{FileBroker, JobStatus};
use herald::{Error, Herald, Result};

/// Fails the first `failures` sends, then succeeds.
struct FlakyProvider {
    channel: String,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyProvider {
    fn new(channel: &str, failures: u32) -> Self {
        Self {
            channel: channel.to_string(),
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ChannelProvider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(&self, _payload: &Value, _context: &DeliveryContext) -> Result<NotificationResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(Error::delivery_status(503, "service unavailable"))
        } else {
            Ok(NotificationResult::sent(&self.channel, "flaky"))
        }
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Takes `delay` to deliver anything.
struct SlowProvider {
    channel: String,
    delay: Duration,
}

#[async_trait]
impl ChannelProvider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(&self, _payload: &Value, _context: &DeliveryContext) -> Result<NotificationResult> {
        tokio::time::sleep(self.delay).await;
        Ok(NotificationResult::sent(&self.channel, "slow"))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Configuration with fast retries and a queue in `dir`.
fn test_config(dir: &TempDir) -> HeraldConfig {
    let mut config = HeraldConfig::default();
    config.queue.data_dir = dir.path().to_path_buf();
    config.queue.poll_interval_ms = 20;
    config.queue.backoff.initial_delay_ms = 10;
    config.queue.backoff.max_delay_ms = 50;
    config.retry.initial_delay_ms = 10;
    config.retry.max_delay_ms = 50;

    config.event_types.insert(
        "user.welcome".to_string(),
        EventTypeConfig::new(["email"]).with_processing(ProcessingMode::Async),
    );
    config.event_types.insert(
        "order.shipped".to_string(),
        EventTypeConfig::new(["email"])
            .with_processing(ProcessingMode::Sync)
            .with_retry_attempts(3),
    );
    config.event_types.insert(
        "report.ready".to_string(),
        EventTypeConfig::new(["email", "chat"]),
    );
    config
}

async fn wait_until_completed(herald: &Herald, completed: usize) {
    for _ in 0..200 {
        if herald.stats().await.queue.completed >= completed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("jobs did not complete: {:?}", herald.stats().await.queue);
}

mod dispatch_scenarios {
    use super::*;
    use herald::notification::{EmitMode, EmitOptions};

    #[tokio::test]
    async fn test_async_emission_is_queued_then_delivered() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");
        herald
            .register_provider(Arc::new(LogProvider::new("email")))
            .expect("Failed to register provider");
        herald.start().await.expect("Failed to start service");

        let result = herald
            .emit(
                "user.welcome",
                json!({"userId": 123, "email": "a@b.com"}),
                EmitOptions::default(),
            )
            .await
            .expect("Emission failed");

        assert_eq!(result.mode, ProcessingMode::Async);
        assert!(!result.waited_for_result);
        assert!(result.queued_at.is_some());
        assert!(result.results.is_none());

        wait_until_completed(&herald, 1).await;

        let job = herald
            .broker()
            .get(&result.event_id)
            .await
            .expect("Job missing");
        assert_eq!(job.status, JobStatus::Completed);

        let results = herald
            .result_store()
            .get(&result.event_id)
            .expect("Results missing");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].channel, "email");
        assert_eq!(results[0].status, DeliveryStatus::Sent);

        herald.shutdown().await;
    }

    #[tokio::test]
    async fn test_unhealthy_provider_still_completes_event() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");
        let email = Arc::new(LogProvider::new("email"));
        email.set_healthy(false);
        herald.register_provider(email.clone()).expect("Failed to register provider");
        herald.start().await.expect("Failed to start service");

        let result = herald
            .emit("user.welcome", json!({"userId": 123}), EmitOptions::default())
            .await
            .expect("Emission failed");
        wait_until_completed(&herald, 1).await;

        let results = herald
            .result_store()
            .get(&result.event_id)
            .expect("Results missing");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].channel, "email");
        assert_eq!(results[0].status, DeliveryStatus::Failed);
        assert_eq!(results[0].error.as_deref(), Some("no healthy provider"));
        assert_eq!(email.delivered(), 0);

        herald.shutdown().await;
    }

    #[tokio::test]
    async fn test_provider_recovering_within_retry_budget() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");
        let flaky = Arc::new(FlakyProvider::new("email", 2));
        herald.register_provider(flaky.clone()).expect("Failed to register provider");

        let result = herald
            .emit("order.shipped", json!({"orderId": 9}), EmitOptions::default())
            .await
            .expect("Emission failed");

        assert_eq!(result.mode, ProcessingMode::Sync);
        let results = result.results.expect("Results missing");
        assert_eq!(results[0].status, DeliveryStatus::Sent);
        assert_eq!(results[0].attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_provider_exhausting_retry_budget() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");
        herald
            .register_provider(Arc::new(FlakyProvider::new("email", 10)))
            .expect("Failed to register provider");

        let result = herald
            .emit("order.shipped", json!({}), EmitOptions::default())
            .await
            .expect("Emission failed");

        let results = result.results.expect("Results missing");
        assert_eq!(results[0].status, DeliveryStatus::Failed);
        assert_eq!(results[0].attempts, 3);
        assert!(results[0].error.as_deref().unwrap_or_default().contains("503"));
    }

    #[tokio::test]
    async fn test_emit_and_wait_times_out_without_cancelling() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");
        herald
            .register_provider(Arc::new(SlowProvider {
                channel: "email".to_string(),
                delay: Duration::from_millis(800),
            }))
            .expect("Failed to register provider");

        let started = Instant::now();
        let result = herald
            .emit_and_wait("user.welcome", json!({}), Duration::from_millis(100))
            .await
            .expect("Emission failed");

        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(result.waited_for_result);
        assert!(result.timed_out());
        let results = result.results.as_ref().expect("Results missing");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, DeliveryStatus::Pending);
        assert_eq!(results[0].error.as_deref(), Some("timeout"));

        // Delivery carries on and publishes its results.
        let late = herald
            .result_store()
            .wait(&result.event_id, Duration::from_secs(5))
            .await
            .expect("Delivery did not finish");
        assert_eq!(late[0].status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn test_queued_wait_times_out_with_pending_result() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");
        herald
            .register_provider(Arc::new(SlowProvider {
                channel: "email".to_string(),
                delay: Duration::from_secs(5),
            }))
            .expect("Failed to register provider");
        herald.start().await.expect("Failed to start service");

        let started = Instant::now();
        let result = herald
            .emit(
                "user.welcome",
                json!({}),
                EmitOptions::default()
                    .with_mode(EmitMode::Async)
                    .wait_for_result(true)
                    .with_timeout(Duration::from_millis(100)),
            )
            .await
            .expect("Emission failed");

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.mode, ProcessingMode::Async);
        assert!(result.waited_for_result);
        assert!(result.timed_out());
        assert!(result.queued_at.is_some());
    }

    #[tokio::test]
    async fn test_queued_wait_receives_results() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");
        herald
            .register_provider(Arc::new(LogProvider::new("email")))
            .expect("Failed to register provider");
        herald.start().await.expect("Failed to start service");

        let result = herald
            .emit(
                "user.welcome",
                json!({}),
                EmitOptions::default()
                    .with_mode(EmitMode::Async)
                    .wait_for_result(true)
                    .with_timeout(Duration::from_secs(5)),
            )
            .await
            .expect("Emission failed");

        assert!(result.waited_for_result);
        assert!(result.all_sent());
        assert!(result.processed_at.is_some());

        herald.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_event_type_creates_no_job() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");

        let err = herald
            .emit("no.such.event", json!({}), EmitOptions::default())
            .await
            .expect_err("Unknown event type must fail");
        assert!(matches!(err, Error::UnknownEventType(_)));
        assert!(err.is_configuration_error());
        assert_eq!(herald.stats().await.queue.total(), 0);
    }

    #[tokio::test]
    async fn test_results_follow_channel_order() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");
        // The first channel is the slow one, so completion order is reversed.
        herald
            .register_provider(Arc::new(SlowProvider {
                channel: "email".to_string(),
                delay: Duration::from_millis(100),
            }))
            .expect("Failed to register provider");
        herald
            .register_provider(Arc::new(LogProvider::new("chat")))
            .expect("Failed to register provider");

        let result = herald
            .emit("report.ready", json!({}), EmitOptions::default().with_mode(EmitMode::Sync))
            .await
            .expect("Emission failed");

        let channels: Vec<String> = result
            .results
            .expect("Results missing")
            .into_iter()
            .map(|r| r.channel)
            .collect();
        assert_eq!(channels, vec!["email", "chat"]);
    }

    #[tokio::test]
    async fn test_channel_without_provider_is_reported_not_dropped() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");
        herald
            .register_provider(Arc::new(LogProvider::new("chat")))
            .expect("Failed to register provider");

        let result = herald
            .emit("report.ready", json!({}), EmitOptions::default().with_mode(EmitMode::Sync))
            .await
            .expect("Emission failed");

        let results = result.results.expect("Results missing");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, DeliveryStatus::Failed);
        assert_eq!(results[1].status, DeliveryStatus::Sent);
    }
}

mod queue_durability {
    use super::*;
    use chrono::Utc;
    use herald::config::QueueSettings;
    use herald::domain::Priority;
    use herald::notification::EmitOptions;
    use herald::queue::{Job, JobOptions, JobStore, QueueBackend};

    fn settings(dir: &TempDir) -> QueueSettings {
        QueueSettings {
            name: "durable".to_string(),
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_on_event_id() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let broker = FileBroker::open(settings(&dir)).await.expect("Failed to open broker");

        for _ in 0..3 {
            broker
                .add("user.welcome", json!({}), JobOptions::default().with_id("evt-42"))
                .await
                .expect("Enqueue failed");
        }

        let stats = broker.get_stats().await.expect("Stats failed");
        assert_eq!(stats.total(), 1);
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn test_reload_reproduces_every_field() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = JobStore::new(dir.path(), "durable");
        let now = Utc::now();

        let mut completed = Job::new(
            "order.shipped",
            json!({"nested": {"list": [1, 2, 3]}, "text": "héllo"}),
            &JobOptions::default().with_priority(Priority::High),
            3,
            now,
        );
        completed.start(now).expect("start");
        completed.complete(json!([{"channel": "email"}]), now).expect("complete");

        let mut retrying = Job::new(
            "user.welcome",
            json!(null),
            &JobOptions::default().with_delay(Duration::from_secs(30)),
            2,
            now,
        );
        retrying.available_at = now;
        retrying.start(now).expect("start");
        retrying.fail("boom", Duration::from_secs(10), now).expect("fail");

        let jobs = vec![completed, retrying];
        store.write(&jobs).await.expect("Write failed");
        assert_eq!(store.load().await.expect("Load failed"), jobs);

        let broker = FileBroker::open(settings(&dir)).await.expect("Failed to open broker");
        assert_eq!(broker.list_jobs(None).await, jobs);
    }

    #[tokio::test]
    async fn test_partial_write_is_invisible_after_restart() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let before = {
            let broker = FileBroker::open(settings(&dir)).await.expect("Failed to open broker");
            broker
                .add("a", json!({"n": 1}), JobOptions::default().with_id("a"))
                .await
                .expect("Enqueue failed");
            broker
                .add("b", json!({"n": 2}), JobOptions::default().with_id("b"))
                .await
                .expect("Enqueue failed");
            broker.list_jobs(None).await
        };

        // A crash between writing the temp file and renaming it.
        let raw = std::fs::read(dir.path().join("durable.jsonl")).expect("Store missing");
        std::fs::write(dir.path().join(".durable.jsonl.tmp"), &raw[..raw.len() / 2])
            .expect("Failed to simulate partial write");

        let broker = FileBroker::open(settings(&dir)).await.expect("Failed to reopen broker");
        assert_eq!(broker.list_jobs(None).await, before);
        assert!(!dir.path().join(".durable.jsonl.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_disk_and_memory_in_step() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let broker = FileBroker::open(settings(&dir)).await.expect("Failed to open broker");
        broker
            .add("a", json!({}), JobOptions::default().with_id("a"))
            .await
            .expect("Enqueue failed");

        std::fs::create_dir(dir.path().join(".durable.jsonl.tmp")).expect("Failed to block temp path");
        let err = broker
            .add("b", json!({}), JobOptions::default().with_id("b"))
            .await
            .expect_err("Write should fail");
        assert!(matches!(err, Error::QueueUnavailable(_)));
        assert!(broker.get("b").await.is_none());

        std::fs::remove_dir(dir.path().join(".durable.jsonl.tmp")).expect("cleanup");
        broker
            .add("b", json!({}), JobOptions::default().with_id("b"))
            .await
            .expect("Enqueue should succeed again");
        assert_eq!(broker.store().load().await.expect("Load failed").len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_queue_fails_async_emission() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");

        std::fs::create_dir(dir.path().join(".notifications.jsonl.tmp"))
            .expect("Failed to block temp path");
        let err = herald
            .emit("user.welcome", json!({}), EmitOptions::default())
            .await
            .expect_err("Queue failure must propagate");
        assert!(matches!(err, Error::QueueUnavailable(_)));
    }

    #[tokio::test]
    async fn test_interrupted_job_is_processed_after_restart() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(&dir);

        let event_id = {
            let herald = Herald::new(config.clone()).await.expect("Failed to build service");
            let result = herald
                .emit("user.welcome", json!({}), EmitOptions::default())
                .await
                .expect("Emission failed");
            // Claim the job without finishing it, as a crash mid-processing would.
            let job = herald.broker().dequeue().await.expect("Dequeue failed").expect("No job");
            assert_eq!(job.status, JobStatus::Active);
            result.event_id
        };

        let herald = Herald::new(config).await.expect("Failed to rebuild service");
        herald
            .register_provider(Arc::new(LogProvider::new("email")))
            .expect("Failed to register provider");
        herald.start().await.expect("Failed to start service");
        wait_until_completed(&herald, 1).await;

        let job = herald.broker().get(&event_id).await.expect("Job missing");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);

        herald.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_channel_retry_keeps_job() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = test_config(&dir);
        config.retry.initial_delay_ms = 60_000;
        config.retry.max_delay_ms = 60_000;

        let event_id = {
            let herald = Herald::new(config.clone()).await.expect("Failed to build service");
            let flaky = Arc::new(FlakyProvider::new("email", 1));
            herald.register_provider(flaky.clone()).expect("Failed to register provider");
            herald.start().await.expect("Failed to start service");

            let result = herald
                .emit("user.welcome", json!({"userId": 9}), EmitOptions::default())
                .await
                .expect("Emission failed");
            for _ in 0..200 {
                if flaky.calls.load(Ordering::SeqCst) >= 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);

            // The router is now sleeping before its second attempt.
            let started = Instant::now();
            herald.shutdown().await;
            assert!(started.elapsed() < Duration::from_secs(10));

            let job = herald.broker().get(&result.event_id).await.expect("Job missing");
            assert_eq!(job.status, JobStatus::Waiting);
            assert_eq!(job.attempts, 0);
            assert!(herald.result_store().get(&result.event_id).is_none());
            result.event_id
        };

        let herald = Herald::new(config).await.expect("Failed to rebuild service");
        herald
            .register_provider(Arc::new(LogProvider::new("email")))
            .expect("Failed to register provider");
        herald.start().await.expect("Failed to start service");
        wait_until_completed(&herald, 1).await;

        let job = herald.broker().get(&event_id).await.expect("Job missing");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
        let results = herald.result_store().get(&event_id).expect("Results missing");
        assert_eq!(results[0].status, DeliveryStatus::Sent);

        herald.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_holds_jobs_until_resume() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let herald = Herald::new(test_config(&dir)).await.expect("Failed to build service");
        herald
            .register_provider(Arc::new(LogProvider::new("email")))
            .expect("Failed to register provider");
        herald.broker().pause().await.expect("Pause failed");
        herald.start().await.expect("Failed to start service");

        herald
            .emit("user.welcome", json!({}), EmitOptions::default())
            .await
            .expect("Emission failed");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = herald.stats().await.queue;
        assert!(stats.is_paused);
        assert_eq!(stats.paused, 1);
        assert_eq!(stats.completed, 0);

        herald.broker().resume().await.expect("Resume failed");
        wait_until_completed(&herald, 1).await;

        herald.shutdown().await;
    }

    #[tokio::test]
    async fn test_persisted_record_is_inspectable() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let broker = FileBroker::open(settings(&dir)).await.expect("Failed to open broker");
        broker
            .add("user.welcome", json!({"userId": 1}), JobOptions::default().with_id("evt-1"))
            .await
            .expect("Enqueue failed");

        let raw = std::fs::read_to_string(dir.path().join("durable.jsonl")).expect("Store missing");
        let record: Value = serde_json::from_str(raw.lines().next().expect("No record")).expect("Not JSON");
        assert_eq!(record["id"], "evt-1");
        assert_eq!(record["name"], "user.welcome");
        assert_eq!(record["data"]["userId"], 1);
        assert_eq!(record["status"], "waiting");
        assert_eq!(record["attempts"], 0);
        assert_eq!(record["maxAttempts"], 3);
        assert!(record["createdAt"].is_string());
    }
}
