//! Secondary job index: `job_id -> current snapshot path`.
//!
//! The index is the serialization point for transitions. Whoever swaps the
//! entry from the revision they read to the next one owns that transition.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use tscribe_models::{path, Job, JobId, JobStatus};

use crate::error::StoreResult;

/// Where a job's current snapshot lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub status: JobStatus,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
    /// Path of the snapshot this one replaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<String>,
}

impl IndexEntry {
    /// Entry for a snapshot of `job`.
    pub fn for_job(job: &Job, previous_path: Option<String>) -> Self {
        Self {
            path: path::encode(&job.id, job.status),
            status: job.status,
            revision: job.revision,
            updated_at: job.updated_at,
            previous_path,
        }
    }
}

/// Key-value index with atomic compare-and-swap.
#[async_trait]
pub trait JobIndex: Send + Sync {
    async fn get(&self, job_id: &JobId) -> StoreResult<Option<IndexEntry>>;

    /// Insert if absent. Returns `false` when an entry already exists.
    async fn insert(&self, job_id: &JobId, entry: &IndexEntry) -> StoreResult<bool>;

    /// Replace `expected` with `new`. Returns `false` if the entry changed.
    async fn compare_and_swap(
        &self,
        job_id: &JobId,
        expected: &IndexEntry,
        new: &IndexEntry,
    ) -> StoreResult<bool>;

    /// Remove the entry if it still equals `expected`.
    async fn remove(&self, job_id: &JobId, expected: &IndexEntry) -> StoreResult<bool>;

    /// Bind an idempotency key to a job if it is unbound. Returns the
    /// current owner when the key is already bound.
    async fn reserve_key(&self, key: &str, job_id: &JobId) -> StoreResult<Option<JobId>>;

    /// Unbind a key, only if `job_id` owns it.
    async fn release_key(&self, key: &str, job_id: &JobId) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<JobId, IndexEntry>,
    keys: HashMap<String, JobId>,
}

/// Process-local index.
#[derive(Debug, Default)]
pub struct InMemoryJobIndex {
    state: Mutex<IndexState>,
}

impl InMemoryJobIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobIndex for InMemoryJobIndex {
    async fn get(&self, job_id: &JobId) -> StoreResult<Option<IndexEntry>> {
        Ok(self.state.lock().await.entries.get(job_id).cloned())
    }

    async fn insert(&self, job_id: &JobId, entry: &IndexEntry) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(job_id) {
            return Ok(false);
        }
        state.entries.insert(job_id.clone(), entry.clone());
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        job_id: &JobId,
        expected: &IndexEntry,
        new: &IndexEntry,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.entries.get_mut(job_id) {
            Some(current) if current == expected => {
                *current = new.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, job_id: &JobId, expected: &IndexEntry) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.entries.get(job_id) == Some(expected) {
            state.entries.remove(job_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn reserve_key(&self, key: &str, job_id: &JobId) -> StoreResult<Option<JobId>> {
        let mut state = self.state.lock().await;
        if let Some(owner) = state.keys.get(key) {
            return Ok(Some(owner.clone()));
        }
        state.keys.insert(key.to_string(), job_id.clone());
        Ok(None)
    }

    async fn release_key(&self, key: &str, job_id: &JobId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.keys.get(key) == Some(job_id) {
            state.keys.remove(key);
        }
        Ok(())
    }
}
