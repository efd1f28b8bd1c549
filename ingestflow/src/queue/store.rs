//! Persistence backends for job records.
//!
//! The queue writes through to the store on every transition; the in-memory
//! map stays authoritative while the process runs and the store is only read
//! back by `JobQueue::recover`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::job::Job;
use super::repeat::RepeatDefinition;
use crate::Result;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn delete_job(&self, id: &str) -> Result<()>;
    async fn load_jobs(&self) -> Result<Vec<Job>>;

    async fn save_repeat(&self, def: &RepeatDefinition) -> Result<()>;
    async fn delete_repeat(&self, key: &str) -> Result<()>;
    async fn load_repeats(&self) -> Result<Vec<RepeatDefinition>>;
}

/// Store that keeps everything in memory. Survives queue rebuilds inside one
/// process, which is what tests need.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, Job>,
    repeats: DashMap<String, RepeatDefinition>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.jobs.remove(id);
        Ok(())
    }

    async fn load_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.iter().map(|e| e.value().clone()).collect())
    }

    async fn save_repeat(&self, def: &RepeatDefinition) -> Result<()> {
        self.repeats.insert(def.key.clone(), def.clone());
        Ok(())
    }

    async fn delete_repeat(&self, key: &str) -> Result<()> {
        self.repeats.remove(key);
        Ok(())
    }

    async fn load_repeats(&self) -> Result<Vec<RepeatDefinition>> {
        Ok(self.repeats.iter().map(|e| e.value().clone()).collect())
    }
}

/// Store that writes one JSON document per job under `<root>/jobs` and one per
/// repeat definition under `<root>/repeats`.
pub struct FileJobStore {
    jobs_dir: PathBuf,
    repeats_dir: PathBuf,
}

impl FileJobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let jobs_dir = root.join("jobs");
        let repeats_dir = root.join("repeats");
        tokio::fs::create_dir_all(&jobs_dir).await?;
        tokio::fs::create_dir_all(&repeats_dir).await?;
        debug!(root = %root.display(), "Opened file job store");
        Ok(Self {
            jobs_dir,
            repeats_dir,
        })
    }

    /// Percent-encode `id` into a file name. Unreserved characters are kept,
    /// every other byte (including `%`) is escaped, so distinct ids never
    /// share a file.
    fn file_name(id: &str) -> String {
        let mut name = String::with_capacity(id.len() + 5);
        for byte in id.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
                name.push(byte as char);
            } else {
                name.push_str(&format!("%{byte:02X}"));
            }
        }
        name.push_str(".json");
        name
    }

    async fn write_atomic(dir: &Path, id: &str, bytes: Vec<u8>) -> Result<()> {
        let name = Self::file_name(id);
        let path = dir.join(&name);
        // One tmp file per write; concurrent saves of an id must not share it.
        let tmp = dir.join(format!("{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(dir: &Path, id: &str) -> Result<()> {
        match tokio::fs::remove_file(dir.join(Self::file_name(id))).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut items = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<T>(&bytes) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable job store entry");
                }
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(job)?;
        Self::write_atomic(&self.jobs_dir, &job.id, bytes).await
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        Self::remove(&self.jobs_dir, id).await
    }

    async fn load_jobs(&self) -> Result<Vec<Job>> {
        Self::load_all(&self.jobs_dir).await
    }

    async fn save_repeat(&self, def: &RepeatDefinition) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(def)?;
        Self::write_atomic(&self.repeats_dir, &def.key, bytes).await
    }

    async fn delete_repeat(&self, key: &str) -> Result<()> {
        Self::remove(&self.repeats_dir, key).await
    }

    async fn load_repeats(&self) -> Result<Vec<RepeatDefinition>> {
        Self::load_all(&self.repeats_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BackoffPolicy;

    fn job(id: &str) -> Job {
        Job::new(
            id,
            "scrape",
            "scrape-1",
            serde_json::json!({"url": "https://example.com"}),
            3,
            BackoffPolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        store.save_job(&job("a")).await.unwrap();
        store.save_job(&job("repeat:nightly:1700000000000")).await.unwrap();

        let mut loaded = store.load_jobs().await.unwrap();
        loaded.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].id, "repeat:nightly:1700000000000");

        store.delete_job("a").await.unwrap();
        store.delete_job("a").await.unwrap();
        assert_eq!(store.load_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        store.save_job(&job("good")).await.unwrap();
        tokio::fs::write(dir.path().join("jobs").join("bad.json"), b"{not json")
            .await
            .unwrap();

        let loaded = store.load_jobs().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "good");
    }

    #[test]
    fn test_file_names_are_distinct_per_id() {
        assert_eq!(FileJobStore::file_name("scrape-1.a_b"), "scrape-1.a_b.json");
        assert_eq!(FileJobStore::file_name("a:b"), "a%3Ab.json");
        assert_ne!(FileJobStore::file_name("a:b"), FileJobStore::file_name("a_b"));
        assert_ne!(FileJobStore::file_name("a%3Ab"), FileJobStore::file_name("a:b"));
    }

    #[tokio::test]
    async fn test_file_store_keeps_ids_that_differ_only_in_punctuation() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        store.save_job(&job("a:b")).await.unwrap();
        store.save_job(&job("a_b")).await.unwrap();
        store.save_job(&job("a/b")).await.unwrap();

        let mut ids: Vec<String> = store.load_jobs().await.unwrap().into_iter().map(|j| j.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a/b", "a:b", "a_b"]);

        store.delete_job("a:b").await.unwrap();
        let ids: Vec<String> = store.load_jobs().await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&"a:b".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_saves_of_one_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileJobStore::open(dir.path()).await.unwrap());

        let mut tasks = tokio::task::JoinSet::new();
        for attempt in 0..16u32 {
            let store = store.clone();
            tasks.spawn(async move {
                let mut job = job("shared");
                job.attempts_made = attempt;
                store.save_job(&job).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(store.load_jobs().await.unwrap().len(), 1);
        let mut leftovers = tokio::fs::read_dir(dir.path().join("jobs")).await.unwrap();
        let mut files = 0;
        while let Some(entry) = leftovers.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().ends_with(".tmp"));
            files += 1;
        }
        assert_eq!(files, 1);
    }
}
