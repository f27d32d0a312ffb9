//! Object store abstraction and the in-memory backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Content type used for every JSON object we write.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Minimal object storage surface the store needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write (or overwrite) an object.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> StoreResult<()>;

    /// Create-only write. Returns `false` if the key already exists.
    async fn put_if_absent(&self, key: &str, body: Vec<u8>, content_type: &str) -> StoreResult<bool>;

    /// Read an object; `None` when the key does not exist.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// List keys under a prefix, in lexical order.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// A finalized write, as reported by the change-notification hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectChange {
    pub bucket: String,
    pub key: String,
    pub generation: u64,
    pub content_type: String,
    pub size: usize,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
}

#[derive(Debug)]
struct NotificationSink {
    prefix: String,
    sender: mpsc::UnboundedSender<ObjectChange>,
}

/// In-memory object store for tests and local runs.
///
/// Optionally reports finalized writes under a prefix, the way a bucket
/// notification configuration with an object-name prefix does.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    generation: AtomicUsize,
    write_log: Mutex<Vec<String>>,
    failing_puts: AtomicUsize,
    sink: Option<NotificationSink>,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new("local")
    }
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            generation: AtomicUsize::new(0),
            write_log: Mutex::new(Vec::new()),
            failing_puts: AtomicUsize::new(0),
            sink: None,
        }
    }

    /// Report finalized writes under `prefix` to `sender`.
    pub fn with_notifications(
        mut self,
        prefix: impl Into<String>,
        sender: mpsc::UnboundedSender<ObjectChange>,
    ) -> Self {
        self.sink = Some(NotificationSink {
            prefix: prefix.into(),
            sender,
        });
        self
    }

    /// Make the next `count` writes fail with a backend error.
    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Every key written so far, in write order.
    pub fn written_keys(&self) -> Vec<String> {
        self.write_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Number of writes under a prefix.
    pub fn writes_under(&self, prefix: &str) -> usize {
        self.written_keys()
            .iter()
            .filter(|key| key.starts_with(prefix))
            .count()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record_write(&self, key: &str, content_type: &str, size: usize) {
        if let Ok(mut log) = self.write_log.lock() {
            log.push(key.to_string());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) as u64 + 1;

        if let Some(sink) = &self.sink {
            if key.starts_with(&sink.prefix) {
                let change = ObjectChange {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    generation,
                    content_type: content_type.to_string(),
                    size,
                    time: Utc::now(),
                };
                if sink.sender.send(change).is_err() {
                    warn!(key = %key, "Notification receiver dropped");
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> StoreResult<()> {
        if self.take_injected_failure() {
            return Err(StoreError::backend(format!("injected failure writing {}", key)));
        }

        let size = body.len();
        {
            let mut objects = self.objects.write().await;
            objects.insert(key.to_string(), StoredObject { body });
            // Notify while holding the lock so notifications follow write order
            self.record_write(key, content_type, size);
        }

        debug!("Stored {} bytes at {}", size, key);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, body: Vec<u8>, content_type: &str) -> StoreResult<bool> {
        if self.take_injected_failure() {
            return Err(StoreError::backend(format!("injected failure writing {}", key)));
        }

        let size = body.len();
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), StoredObject { body });
        self.record_write(key, content_type, size);
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let objects = self.objects.read().await;
        Ok(objects.get(key).map(|object| object.body.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryObjectStore::default();
        store.put("a/1", b"one".to_vec(), CONTENT_TYPE_JSON).await.unwrap();

        assert_eq!(store.get("a/1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("a/2").await.unwrap(), None);

        store.delete("a/1").await.unwrap();
        store.delete("a/1").await.unwrap();
        assert_eq!(store.get("a/1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let store = InMemoryObjectStore::default();
        assert!(store.put_if_absent("k", b"1".to_vec(), CONTENT_TYPE_JSON).await.unwrap());
        assert!(!store.put_if_absent("k", b"2".to_vec(), CONTENT_TYPE_JSON).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = InMemoryObjectStore::default();
        for key in ["jobs/queued/a", "jobs/queued/b", "jobs/failed/c", "transcripts/d"] {
            store.put(key, Vec::new(), CONTENT_TYPE_JSON).await.unwrap();
        }

        assert_eq!(
            store.list("jobs/queued/").await.unwrap(),
            vec!["jobs/queued/a".to_string(), "jobs/queued/b".to_string()]
        );
        assert_eq!(store.list("jobs/").await.unwrap().len(), 3);
        assert_eq!(store.writes_under("jobs/"), 3);
    }

    #[tokio::test]
    async fn test_notifications_respect_prefix() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = InMemoryObjectStore::new("bucket").with_notifications("jobs/", tx);

        store.put("transcripts/x.json", b"{}".to_vec(), CONTENT_TYPE_JSON).await.unwrap();
        store.put("jobs/queued/x.json", b"{}".to_vec(), CONTENT_TYPE_JSON).await.unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, "jobs/queued/x.json");
        assert_eq!(change.bucket, "bucket");
        assert_eq!(change.size, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = InMemoryObjectStore::default();
        store.fail_next_puts(1);

        assert!(store.put("k", Vec::new(), CONTENT_TYPE_JSON).await.is_err());
        assert!(store.put("k", Vec::new(), CONTENT_TYPE_JSON).await.is_ok());
        assert_eq!(store.written_keys(), vec!["k".to_string()]);
    }
}
