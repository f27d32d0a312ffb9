//! Store error types.

use thiserror::Error;
use tscribe_models::{JobId, JobStatus, TransitionError};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Duplicate creation. `job_id` is the job that already holds the slot.
    #[error("Job already exists: {job_id}")]
    AlreadyExists {
        job_id: JobId,
        idempotency_key: Option<String>,
    },

    #[error("State conflict on job {job_id}: expected {expected}, found {actual}")]
    StateConflict {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Invalid transition on job {job_id}: {source}")]
    InvalidTransition {
        job_id: JobId,
        #[source]
        source: TransitionError,
    },

    /// Patch is incomplete for the target status.
    #[error("Invalid patch on job {job_id}: {source}")]
    InvalidPatch {
        job_id: JobId,
        #[source]
        source: TransitionError,
    },

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Index points at a snapshot that has not landed yet.
    #[error("Snapshot not yet visible: {0}")]
    SnapshotPending(String),

    #[error("Corrupt snapshot at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Failed to configure store: {0}")]
    ConfigError(String),

    #[error("Object store error: {0}")]
    Backend(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }

    /// Split a model-level transition failure into table and patch errors.
    pub fn from_transition(job_id: JobId, source: TransitionError) -> Self {
        match source {
            TransitionError::NotAllowed { .. } => Self::InvalidTransition { job_id, source },
            TransitionError::MissingError | TransitionError::MissingTranscript => {
                Self::InvalidPatch { job_id, source }
            }
        }
    }

    /// Lost an optimistic-concurrency race or the job already moved on.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::StateConflict { .. })
    }

    /// Duplicate signal; callers treat it as success-no-op.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout { .. }
                | StoreError::Backend(_)
                | StoreError::Redis(_)
                | StoreError::SnapshotPending(_)
        )
    }
}
