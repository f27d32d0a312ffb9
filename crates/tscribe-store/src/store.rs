//! Job state store.
//!
//! Snapshots live at `jobs/<status>/<job_id>.json`. The secondary index
//! records which of those paths is current and serializes transitions
//! through compare-and-swap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use tscribe_models::{path, Job, JobId, JobPatch, JobStatus, TransitionError};

use crate::error::{StoreError, StoreResult};
use crate::index::{IndexEntry, JobIndex};
use crate::object::{ObjectStore, CONTENT_TYPE_JSON};

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Timeout applied to every backend call
    pub io_timeout: Duration,
    /// Keep superseded snapshots as an audit trail
    pub retain_history: bool,
    /// Extra attempts `cancel` makes after losing a race
    pub cancel_retries: u32,
    /// Re-reads while the indexed snapshot is still being written
    pub snapshot_read_retries: u32,
    pub snapshot_read_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(5),
            retain_history: true,
            cancel_retries: 3,
            snapshot_read_retries: 3,
            snapshot_read_backoff: Duration::from_millis(50),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            io_timeout: std::env::var("TSCRIBE_STORE_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.io_timeout),
            retain_history: std::env::var("TSCRIBE_RETAIN_HISTORY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retain_history),
            ..defaults
        }
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_retain_history(mut self, retain: bool) -> Self {
        self.retain_history = retain;
        self
    }
}

/// Durable job snapshots with validated transitions.
#[derive(Clone)]
pub struct JobStateStore {
    objects: Arc<dyn ObjectStore>,
    index: Arc<dyn JobIndex>,
    config: StoreConfig,
}

impl JobStateStore {
    pub fn new(objects: Arc<dyn ObjectStore>, index: Arc<dyn JobIndex>, config: StoreConfig) -> Self {
        Self {
            objects,
            index,
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Persist a new job at its `queued` path.
    pub async fn create(&self, job: Job) -> StoreResult<Job> {
        if job.status != JobStatus::Queued {
            return Err(StoreError::invalid_job(format!(
                "job {} must be created as queued, got {}",
                job.id, job.status
            )));
        }

        if let Some(key) = &job.idempotency_key {
            let owner = self
                .timed("reserve_key", self.index.reserve_key(key, &job.id))
                .await?;
            if let Some(owner) = owner {
                debug!(job_id = %owner, idempotency_key = %key, "Duplicate create");
                return Err(StoreError::AlreadyExists {
                    job_id: owner,
                    idempotency_key: Some(key.clone()),
                });
            }
        }

        let result = self.create_reserved(&job).await;
        if result.is_err() {
            self.release_reservation(&job).await;
        }
        result?;

        info!(job_id = %job.id, request_id = %job.request_id, "Created job");
        Ok(job)
    }

    async fn create_reserved(&self, job: &Job) -> StoreResult<()> {
        let entry = IndexEntry::for_job(job, None);

        let inserted = self
            .timed("index_insert", self.index.insert(&job.id, &entry))
            .await?;
        if !inserted {
            return Err(StoreError::AlreadyExists {
                job_id: job.id.clone(),
                idempotency_key: None,
            });
        }

        if let Err(e) = self.write_snapshot(job).await {
            warn!(job_id = %job.id, error = %e, "Initial snapshot write failed, removing index entry");
            if let Err(rollback) = self.timed("index_remove", self.index.remove(&job.id, &entry)).await {
                warn!(job_id = %job.id, error = %rollback, "Failed to remove index entry");
            }
            return Err(e);
        }

        Ok(())
    }

    async fn release_reservation(&self, job: &Job) {
        if let Some(key) = &job.idempotency_key {
            if let Err(e) = self
                .timed("release_key", self.index.release_key(key, &job.id))
                .await
            {
                warn!(job_id = %job.id, error = %e, "Failed to release idempotency key");
            }
        }
    }

    /// Move a job from `expected` to `to`, merging `patch`.
    pub async fn transition(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        to: JobStatus,
        patch: JobPatch,
    ) -> StoreResult<Job> {
        let (entry, current) = self.load_current(job_id).await?;

        if current.status != expected {
            return Err(StoreError::StateConflict {
                job_id: job_id.clone(),
                expected,
                actual: current.status,
            });
        }

        let next = current
            .advance(to, patch, Utc::now())
            .map_err(|e| StoreError::from_transition(job_id.clone(), e))?;
        let next_entry = IndexEntry::for_job(&next, Some(entry.path.clone()));

        let swapped = self
            .timed("index_cas", self.index.compare_and_swap(job_id, &entry, &next_entry))
            .await?;
        if !swapped {
            let actual = match self.timed("index_get", self.index.get(job_id)).await? {
                Some(latest) => latest.status,
                None => current.status,
            };
            debug!(job_id = %job_id, %expected, %actual, "Lost transition race");
            return Err(StoreError::StateConflict {
                job_id: job_id.clone(),
                expected,
                actual,
            });
        }

        if let Err(e) = self.write_snapshot(&next).await {
            warn!(job_id = %job_id, error = %e, "Snapshot write failed, rolling back index");
            match self
                .timed("index_cas", self.index.compare_and_swap(job_id, &next_entry, &entry))
                .await
            {
                Ok(true) => {}
                Ok(false) => warn!(job_id = %job_id, "Index moved during rollback"),
                Err(rollback) => warn!(job_id = %job_id, error = %rollback, "Index rollback failed"),
            }
            return Err(e);
        }

        if !self.config.retain_history && entry.path != next_entry.path {
            if let Err(e) = self.timed("delete", self.objects.delete(&entry.path)).await {
                warn!(path = %entry.path, error = %e, "Failed to remove superseded snapshot");
            }
        }

        info!(
            job_id = %job_id,
            from = %current.status,
            to = %next.status,
            revision = next.revision,
            "Job transitioned"
        );
        Ok(next)
    }

    /// Most recent snapshot of a job.
    pub async fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        if let Some(entry) = self.timed("index_get", self.index.get(job_id)).await? {
            if let Some(job) = self.read_snapshot(&entry.path).await? {
                return Ok(job);
            }
            // Snapshot for this entry is still being written
            if let Some(previous) = &entry.previous_path {
                if let Some(job) = self.read_snapshot(previous).await? {
                    return Ok(job);
                }
            }
        }

        let latest = self.scan_latest(job_id).await?;
        match latest {
            Some(job) => {
                self.repair_index(&job).await;
                Ok(job)
            }
            None => Err(StoreError::NotFound(job_id.clone())),
        }
    }

    /// Administrative cancel. Retries when a worker moves the job first.
    pub async fn cancel(&self, job_id: &JobId) -> StoreResult<Job> {
        let mut attempt = 0;
        loop {
            let current = self.get(job_id).await?;
            if current.is_terminal() {
                return Err(StoreError::from_transition(
                    job_id.clone(),
                    TransitionError::NotAllowed {
                        from: current.status,
                        to: JobStatus::Cancelled,
                    },
                ));
            }

            match self
                .transition(job_id, current.status, JobStatus::Cancelled, JobPatch::new())
                .await
            {
                Err(e) if (e.is_conflict() || matches!(e, StoreError::SnapshotPending(_)))
                    && attempt < self.config.cancel_retries =>
                {
                    attempt += 1;
                    debug!(job_id = %job_id, attempt, "Cancel raced a transition, retrying");
                }
                other => return other,
            }
        }
    }

    /// Every retained snapshot of a job, oldest first.
    pub async fn history(&self, job_id: &JobId) -> StoreResult<Vec<Job>> {
        let mut snapshots = self.scan_all(job_id).await?;
        if snapshots.is_empty() {
            return Err(StoreError::NotFound(job_id.clone()));
        }
        snapshots.sort_by_key(|job| (job.updated_at, job.revision));
        Ok(snapshots)
    }

    /// Current index entry, if any.
    pub async fn index_entry(&self, job_id: &JobId) -> StoreResult<Option<IndexEntry>> {
        self.timed("index_get", self.index.get(job_id)).await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Index entry plus the snapshot it points at, with matching revisions.
    async fn load_current(&self, job_id: &JobId) -> StoreResult<(IndexEntry, Job)> {
        let mut attempt = 0;
        loop {
            let entry = match self.timed("index_get", self.index.get(job_id)).await? {
                Some(entry) => entry,
                None => {
                    // Rebuilds the entry from the partitions when it was lost
                    self.get(job_id).await?;
                    self.timed("index_get", self.index.get(job_id))
                        .await?
                        .ok_or_else(|| StoreError::NotFound(job_id.clone()))?
                }
            };

            if let Some(job) = self.read_snapshot(&entry.path).await? {
                if job.revision == entry.revision {
                    return Ok((entry, job));
                }
            }

            if attempt >= self.config.snapshot_read_retries {
                return Err(StoreError::SnapshotPending(entry.path));
            }
            attempt += 1;
            tokio::time::sleep(self.config.snapshot_read_backoff).await;
        }
    }

    async fn write_snapshot(&self, job: &Job) -> StoreResult<()> {
        let key = path::encode(&job.id, job.status);
        let body = serde_json::to_vec(job)?;
        self.timed("put", self.objects.put(&key, body, CONTENT_TYPE_JSON))
            .await
    }

    async fn read_snapshot(&self, key: &str) -> StoreResult<Option<Job>> {
        let Some(bytes) = self.timed("get", self.objects.get(key)).await? else {
            return Ok(None);
        };

        let location = path::decode(key).map_err(|e| StoreError::Corrupt {
            path: key.to_string(),
            reason: e.to_string(),
        })?;
        let job: Job = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: key.to_string(),
            reason: e.to_string(),
        })?;

        if job.id != location.job_id || job.status != location.status {
            return Err(StoreError::Corrupt {
                path: key.to_string(),
                reason: format!("snapshot holds {} in status {}", job.id, job.status),
            });
        }

        Ok(Some(job))
    }

    async fn scan_all(&self, job_id: &JobId) -> StoreResult<Vec<Job>> {
        let mut found = Vec::new();
        for status in JobStatus::ALL {
            if let Some(job) = self.read_snapshot(&path::encode(job_id, status)).await? {
                found.push(job);
            }
        }
        Ok(found)
    }

    async fn scan_latest(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        let snapshots = self.scan_all(job_id).await?;
        Ok(snapshots
            .into_iter()
            .max_by_key(|job| (job.updated_at, job.revision)))
    }

    async fn repair_index(&self, job: &Job) {
        let entry = IndexEntry::for_job(job, None);
        match self.timed("index_insert", self.index.insert(&job.id, &entry)).await {
            Ok(true) => info!(job_id = %job.id, status = %job.status, "Rebuilt index entry from snapshots"),
            Ok(false) => {}
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to rebuild index entry"),
        }
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.config.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation,
                timeout_ms: self.config.io_timeout.as_millis() as u64,
            }),
        }
    }
}
