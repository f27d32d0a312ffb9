//! Worker error types.

use thiserror::Error;

use tscribe_bus::{BusError, GuardError, PublishFailure};
use tscribe_store::StoreError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Metadata resolution failed: {0}")]
    MetadataFailed(String),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    /// The collaborator refused the request; retrying will not help.
    #[error("{service} rejected request: {message}")]
    Rejected { service: &'static str, message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    VendorTimeout { operation: &'static str, timeout_ms: u64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Idempotency guard error: {0}")]
    Guard(#[from] GuardError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishFailure),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn metadata_failed(msg: impl Into<String>) -> Self {
        Self::MetadataFailed(msg.into())
    }

    pub fn inference_failed(msg: impl Into<String>) -> Self {
        Self::InferenceFailed(msg.into())
    }

    pub fn rejected(service: &'static str, msg: impl Into<String>) -> Self {
        Self::Rejected {
            service,
            message: msg.into(),
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::MetadataFailed(_)
            | WorkerError::InferenceFailed(_)
            | WorkerError::VendorTimeout { .. }
            | WorkerError::Bus(_)
            | WorkerError::Guard(_)
            | WorkerError::Http(_) => true,
            WorkerError::Store(e) => e.is_retryable(),
            WorkerError::Publish(PublishFailure::SchemaValidation(_)) => false,
            WorkerError::Publish(_) => true,
            WorkerError::ConfigError(_) | WorkerError::Rejected { .. } => false,
        }
    }

    /// Failures that should fail the job instead of being retried.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(self, WorkerError::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(WorkerError::metadata_failed("502").is_retryable());
        assert!(WorkerError::VendorTimeout {
            operation: "inference",
            timeout_ms: 10
        }
        .is_retryable());

        let rejected = WorkerError::rejected("metadata", "video is private");
        assert!(!rejected.is_retryable());
        assert!(rejected.is_permanent_failure());
        assert_eq!(rejected.to_string(), "metadata rejected request: video is private");
    }

    #[test]
    fn test_store_errors_follow_store_classification() {
        let missing = WorkerError::from(StoreError::NotFound(tscribe_models::JobId::new()));
        assert!(!missing.is_retryable());

        let timeout = WorkerError::from(StoreError::Timeout {
            operation: "put",
            timeout_ms: 5000,
        });
        assert!(timeout.is_retryable());
    }
}
