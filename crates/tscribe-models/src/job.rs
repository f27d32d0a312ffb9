//! Job definitions and the status transition table.

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::media::{MediaMetadata, MediaSource};

/// Unique identifier for a job.
///
/// Always a lowercase hyphenated UUID so that it survives a trip through
/// an object path unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(String);

/// A string that is not a canonical job id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job id: {0:?}")]
pub struct InvalidJobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse and validate an untrusted job id.
    pub fn parse(s: &str) -> Result<Self, InvalidJobId> {
        match Uuid::parse_str(s) {
            Ok(uuid) if uuid.hyphenated().to_string() == s => Ok(Self(s.to_string())),
            _ => Err(InvalidJobId(s.to_string())),
        }
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting for metadata resolution
    #[default]
    Queued,
    /// Media metadata resolved, waiting for a transcription worker
    MetadataReady,
    /// Inference in progress
    Processing,
    /// Transcript written
    Completed,
    /// Gave up; carries an error
    Failed,
    /// Stopped by an administrative action
    Cancelled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::MetadataReady,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::MetadataReady => "metadata_ready",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a path/wire token. Unknown tokens yield `None`.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == token)
    }

    /// Terminal statuses have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The transition table.
    ///
    /// `Processing -> Processing` is the retry self-transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        match self {
            Queued => matches!(next, MetadataReady | Failed | Cancelled),
            MetadataReady => matches!(next, Processing | Failed | Cancelled),
            Processing => matches!(next, Processing | Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobError {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable description
    pub message: String,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Caller hints forwarded to the inference prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TranscriptionContext {
    /// Expected spoken language (BCP-47)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Known speaker names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub speakers: Vec<String>,
    /// Domain vocabulary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub glossary: Vec<String>,
    /// Free-form instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Request metadata attached at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobMetadata {
    #[serde(default)]
    pub priority: JobPriority,
    /// Originating surface (e.g. "web", "api")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

/// Fields a transition may set. Merged shallowly onto the last snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub transcript_id: Option<String>,
    pub error: Option<JobError>,
    pub media_details: Option<MediaMetadata>,
    /// Bump `attempts` by one
    pub increment_attempts: bool,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transcript_id(mut self, transcript_id: impl Into<String>) -> Self {
        self.transcript_id = Some(transcript_id.into());
        self
    }

    pub fn with_error(mut self, error: JobError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_media_details(mut self, details: MediaMetadata) -> Self {
        self.media_details = Some(details);
        self
    }

    pub fn with_attempt(mut self) -> Self {
        self.increment_attempts = true;
        self
    }
}

/// Why a snapshot could not be advanced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("transition {from} -> {to} is not allowed")]
    NotAllowed { from: JobStatus, to: JobStatus },

    #[error("transition to failed requires an error")]
    MissingError,

    #[error("transition to completed requires a transcript id")]
    MissingTranscript,
}

/// A transcription job snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Originating client request
    pub request_id: String,

    /// Caller-supplied dedup key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    pub status: JobStatus,

    /// Number of processing attempts
    #[serde(default)]
    pub attempts: u32,

    /// Source content
    pub media: MediaSource,

    /// Resolved media details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_details: Option<MediaMetadata>,

    /// Result artifact id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_id: Option<String>,

    /// Error (only when failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription_context: Option<TranscriptionContext>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobMetadata>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Snapshot counter, bumped on every write
    #[serde(default)]
    pub revision: u64,
}

impl Job {
    /// Create a new queued job.
    pub fn new(request_id: impl Into<String>, media: MediaSource) -> Self {
        let now = Utc::now();

        Self {
            id: JobId::new(),
            request_id: request_id.into(),
            idempotency_key: None,
            status: JobStatus::Queued,
            attempts: 0,
            media,
            media_details: None,
            transcript_id: None,
            error: None,
            transcription_context: None,
            metadata: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_context(mut self, context: TranscriptionContext) -> Self {
        self.transcription_context = Some(context);
        self
    }

    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Build the next snapshot for `to`, merging `patch`.
    ///
    /// `updated_at` strictly increases even when the clock does not.
    pub fn advance(&self, to: JobStatus, patch: JobPatch, now: DateTime<Utc>) -> Result<Job, TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::NotAllowed {
                from: self.status,
                to,
            });
        }

        let error = match to {
            JobStatus::Failed => Some(patch.error.ok_or(TransitionError::MissingError)?),
            _ => None,
        };

        let transcript_id = patch.transcript_id.or_else(|| self.transcript_id.clone());
        if to == JobStatus::Completed && transcript_id.is_none() {
            return Err(TransitionError::MissingTranscript);
        }

        let updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::milliseconds(1)
        };

        let mut next = self.clone();
        next.status = to;
        next.error = error;
        next.transcript_id = transcript_id;
        if let Some(details) = patch.media_details {
            next.media_details = Some(details);
        }
        if patch.increment_attempts {
            next.attempts += 1;
        }
        next.updated_at = updated_at;
        next.revision = self.revision + 1;

        Ok(next)
    }
}
