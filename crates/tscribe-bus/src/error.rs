//! Bus error types.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tscribe_models::{EventValidationError, PathDecodeError};

pub type BusResult<T> = Result<T, BusError>;

/// Transport-level failures of the bus backends.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BusError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

// ============================================================================
// Notification decoding
// ============================================================================

/// A storage notification that cannot be turned into a transition.
#[derive(Debug, Error)]
#[error("notification {}: {kind}", .event_id.as_deref().unwrap_or("<no id>"))]
pub struct CloudEventDecodeError {
    /// Notification id, when it could be read
    pub event_id: Option<String>,
    pub kind: CloudEventErrorKind,
}

#[derive(Debug, Error)]
pub enum CloudEventErrorKind {
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("unsupported specversion {0:?}")]
    UnsupportedSpecVersion(String),

    #[error("unsupported event type {0:?}")]
    UnsupportedType(String),

    #[error(transparent)]
    Path(#[from] PathDecodeError),
}

impl CloudEventDecodeError {
    pub fn new(event_id: Option<String>, kind: CloudEventErrorKind) -> Self {
        Self { event_id, kind }
    }

    /// The object is not a job snapshot at all.
    pub fn is_foreign_object(&self) -> bool {
        match &self.kind {
            CloudEventErrorKind::Path(PathDecodeError::WrongPrefix { .. }) => true,
            CloudEventErrorKind::Path(PathDecodeError::SegmentCount { path, .. }) => {
                !path.starts_with("jobs/")
            }
            _ => false,
        }
    }
}

// ============================================================================
// Message adapter
// ============================================================================

/// A push delivery that does not carry a valid domain event.
#[derive(Debug, Error)]
pub enum MessageDecodingError {
    #[error("malformed push envelope: {0}")]
    Envelope(String),

    #[error("message {message_id}: data is not valid base64: {reason}")]
    InvalidBase64 { message_id: String, reason: String },

    #[error("message {message_id}: payload does not match the event schema: {reason}")]
    Schema { message_id: String, reason: String },

    #[error("message {message_id}: {source}")]
    Invalid {
        message_id: String,
        #[source]
        source: EventValidationError,
    },

    #[error("message {message_id}: attribute {attribute} is {found:?}, payload says {expected:?}")]
    AttributeMismatch {
        message_id: String,
        attribute: &'static str,
        expected: String,
        found: String,
    },
}

/// An event that cannot be published.
#[derive(Debug, Error)]
pub enum MessageEncodingError {
    #[error("event fails validation: {0}")]
    Invalid(#[from] EventValidationError),

    #[error("event cannot be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ============================================================================
// Idempotency
// ============================================================================

pub type GuardResult<T> = Result<T, GuardError>;

#[derive(Debug, Error)]
pub enum GuardError {
    /// Someone already applied (or is applying) this key.
    #[error("Key {key} already claimed at {first_seen_at}")]
    AlreadyClaimed {
        key: String,
        first_seen_at: DateTime<Utc>,
    },

    #[error("Idempotency backend error: {0}")]
    Backend(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl GuardError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn is_already_claimed(&self) -> bool {
        matches!(self, GuardError::AlreadyClaimed { .. })
    }
}

// ============================================================================
// Publishing
// ============================================================================

/// A single failed publish call.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Classified outcome of a failed publish.
#[derive(Debug, Error)]
pub enum PublishFailure {
    /// Event rejected before sending; never retried.
    #[error("schema validation failed: {0}")]
    SchemaValidation(#[source] MessageEncodingError),

    /// Transient failure of one attempt.
    #[error("publish attempt failed: {0}")]
    ClientError(#[source] PublishError),

    #[error("publish gave up after {attempts} attempts: {last_cause}")]
    RetryExceeded {
        attempts: u32,
        #[source]
        last_cause: PublishError,
    },
}

impl PublishFailure {
    /// Label used in metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            PublishFailure::SchemaValidation(_) => "schema_validation",
            PublishFailure::ClientError(_) => "client_error",
            PublishFailure::RetryExceeded { .. } => "retry_exceeded",
        }
    }

    /// Attempts observed before the failure surfaced.
    ///
    /// Schema validation and single-attempt client errors surface on the
    /// first attempt.
    pub fn attempts(&self) -> u32 {
        match self {
            PublishFailure::SchemaValidation(_) | PublishFailure::ClientError(_) => 1,
            PublishFailure::RetryExceeded { attempts, .. } => *attempts,
        }
    }
}
