//! File persistence for one named queue.
//!
//! Jobs live in `<dir>/<queue>.jsonl`, one JSON record per line. Every write
//! replaces the whole file: the new contents go to `.<queue>.jsonl.tmp`, are
//! synced, then renamed over the store. Readers therefore only ever see the
//! previous or the next complete state.

use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::job::Job;
use crate::{Error, Result};

/// On-disk job list for a single queue.
#[derive(Debug, Clone)]
pub struct JobStore {
    dir: PathBuf,
    queue: String,
}

impl JobStore {
    pub fn new(dir: impl Into<PathBuf>, queue: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            queue: queue.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the store file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.jsonl", self.queue))
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(format!(".{}.jsonl.tmp", self.queue))
    }

    fn scratch_path(&self) -> PathBuf {
        self.dir.join(format!(".{}.writable.tmp", self.queue))
    }

    /// Temporary files left behind by this queue.
    fn is_own_temp_file(&self, file_name: &str) -> bool {
        file_name.starts_with(&format!(".{}.", self.queue)) && file_name.ends_with(".tmp")
    }

    /// Create the directory, remove leftovers of interrupted writes, and load
    /// all jobs.
    pub async fn open(&self) -> Result<Vec<Job>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.open_blocking())
            .await
            .map_err(|e| Error::queue_unavailable(format!("store task failed: {}", e)))?
    }

    fn open_blocking(&self) -> Result<Vec<Job>> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            Error::queue_unavailable(format!(
                "cannot create queue directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;
        self.cleanup_temp_files()?;
        self.load_blocking()
    }

    fn cleanup_temp_files(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            Error::queue_unavailable(format!("cannot list {}: {}", self.dir.display(), e))
        })?;

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !self.is_own_temp_file(file_name) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => info!(file = %file_name, "Removed leftover temporary queue file"),
                Err(e) => warn!(file = %file_name, error = %e, "Failed to remove temporary queue file"),
            }
        }
        Ok(())
    }

    /// Read every job from the store. A missing store is an empty queue.
    pub async fn load(&self) -> Result<Vec<Job>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.load_blocking())
            .await
            .map_err(|e| Error::queue_unavailable(format!("store task failed: {}", e)))?
    }

    fn load_blocking(&self) -> Result<Vec<Job>> {
        let path = self.path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::queue_unavailable(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str::<Job>(line).map_err(|e| {
                    Error::queue_unavailable(format!(
                        "corrupt record at {}:{}: {}",
                        path.display(),
                        index + 1,
                        e
                    ))
                })
            })
            .collect()
    }

    /// Atomically replace the store contents with `jobs`.
    pub async fn write(&self, jobs: &[Job]) -> Result<()> {
        let contents = encode(jobs)?;
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.write_blocking(&contents))
            .await
            .map_err(|e| Error::queue_unavailable(format!("store task failed: {}", e)))?
    }

    fn write_blocking(&self, contents: &[u8]) -> Result<()> {
        let temp_path = self.temp_path();
        let result = self.write_and_rename(&temp_path, contents);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
        }
        result.map_err(|e| {
            Error::queue_unavailable(format!("cannot write {}: {}", self.path().display(), e))
        })
    }

    fn write_and_rename(&self, temp_path: &Path, contents: &[u8]) -> std::io::Result<()> {
        let mut file = std::fs::File::create(temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(temp_path, self.path())?;
        sync_dir(&self.dir);
        debug!(path = %self.path().display(), bytes = contents.len(), "Queue store written");
        Ok(())
    }

    /// Readable and writable without touching the store file.
    pub async fn check_access(&self) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.check_access_blocking())
            .await
            .map_err(|e| Error::queue_unavailable(format!("store task failed: {}", e)))?
    }

    fn check_access_blocking(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            std::fs::File::open(&path).map_err(|e| {
                Error::queue_unavailable(format!("cannot read {}: {}", path.display(), e))
            })?;
        }

        let scratch = self.scratch_path();
        std::fs::write(&scratch, b"ok").map_err(|e| {
            Error::queue_unavailable(format!("cannot write to {}: {}", self.dir.display(), e))
        })?;
        let _ = std::fs::remove_file(&scratch);
        Ok(())
    }
}

/// One JSON record per line.
fn encode(jobs: &[Job]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(jobs.len() * 256);
    for job in jobs {
        serde_json::to_writer(&mut buf, job)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::JobOptions;
    use chrono::Utc;
    use serde_json::json;

    fn jobs(n: usize) -> Vec<Job> {
        (0..n)
            .map(|i| Job::new(format!("job-{i}"), json!({"i": i}), &JobOptions::default(), 3, Utc::now()))
            .collect()
    }

    #[tokio::test]
    async fn test_missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().join("q"), "notifications");
        assert!(store.open().await.unwrap().is_empty());
        assert!(dir.path().join("q").is_dir());
    }

    #[tokio::test]
    async fn test_write_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path(), "notifications");
        let written = jobs(3);

        store.write(&written).await.unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw.lines().count(), 3);

        assert_eq!(store.load().await.unwrap(), written);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_open_removes_leftover_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path(), "notifications");
        store.write(&jobs(1)).await.unwrap();

        std::fs::write(store.temp_path(), b"{\"id\":\"half-writ").unwrap();
        std::fs::write(dir.path().join(".other.jsonl.tmp"), b"keep").unwrap();

        let loaded = store.open().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!store.temp_path().exists());
        assert!(dir.path().join(".other.jsonl.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_store_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path(), "notifications");
        std::fs::write(store.path(), b"{not json}\n").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, Error::QueueUnavailable(_)));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path(), "notifications");
        let before = jobs(2);
        store.write(&before).await.unwrap();

        // A directory squatting on the temp path makes the write fail.
        std::fs::create_dir(store.temp_path()).unwrap();
        let err = store.write(&jobs(5)).await.unwrap_err();
        assert!(matches!(err, Error::QueueUnavailable(_)));

        assert_eq!(store.load().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_check_access() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path(), "notifications");
        store.check_access().await.unwrap();
        assert!(!store.scratch_path().exists());

        let missing = JobStore::new(dir.path().join("gone"), "notifications");
        assert!(missing.check_access().await.is_err());
    }
}
