//! Short-lived cache of delivery results keyed by event id.
//!
//! Waiters block on a per-event [`Notify`] that `put` fires, so waiting for an
//! asynchronously processed event needs no polling.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::NotificationResult;

/// Default time results stay available (5 minutes).
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct StoredResults {
    results: Vec<NotificationResult>,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl StoredResults {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Result store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultStoreStats {
    pub entries: usize,
    pub waiters: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
}

/// TTL cache of per-event results.
pub struct ResultStore {
    entries: DashMap<String, StoredResults>,
    waiters: DashMap<String, Arc<Notify>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_RESULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            waiters: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store results and wake everyone waiting on `event_id`.
    pub fn put(&self, event_id: &str, results: Vec<NotificationResult>) {
        self.entries.insert(
            event_id.to_string(),
            StoredResults {
                results,
                expires_at: Instant::now().checked_add(self.ttl),
            },
        );
        if let Some((_, notify)) = self.waiters.remove(event_id) {
            notify.notify_waiters();
        }
        debug!(event_id = %event_id, "Stored delivery results");
    }

    /// Results for `event_id`, if present and not expired.
    pub fn get(&self, event_id: &str) -> Option<Vec<NotificationResult>> {
        let Some(entry) = self.entries.get(event_id) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired() {
            drop(entry);
            self.entries.remove(event_id);
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.results.clone())
    }

    /// Wait up to `timeout` for results to be stored.
    pub async fn wait(&self, event_id: &str, timeout: Duration) -> Option<Vec<NotificationResult>> {
        let deadline = Instant::now().checked_add(timeout);

        loop {
            if let Some(results) = self.get(event_id) {
                return Some(results);
            }

            let notify = self
                .waiters
                .entry(event_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone();
            let notified = notify.notified();

            if let Some(results) = self.get(event_id) {
                return Some(results);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.release_waiter(event_id, &notify);
                        return self.get(event_id);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Drop the waiter entry if nobody else holds it.
    fn release_waiter(&self, event_id: &str, notify: &Arc<Notify>) {
        self.waiters
            .remove_if(event_id, |_, current| {
                Arc::ptr_eq(current, notify) && Arc::strong_count(current) <= 2
            });
    }

    pub fn remove(&self, event_id: &str) -> Option<Vec<NotificationResult>> {
        self.entries.remove(event_id).map(|(_, stored)| stored.results)
    }

    /// Evict expired entries and abandoned waiters. Returns the number of
    /// entries evicted.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.is_expired());
        let evicted = before.saturating_sub(self.entries.len());

        self.waiters.retain(|_, notify| Arc::strong_count(notify) > 1);

        if evicted > 0 {
            self.expired.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "Evicted expired delivery results");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> ResultStoreStats {
        ResultStoreStats {
            entries: self.entries.len(),
            waiters: self.waiters.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}
