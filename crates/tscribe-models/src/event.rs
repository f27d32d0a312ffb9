//! Transition events and domain events.
//!
//! A [`TransitionEvent`] is derived from a storage notification and never
//! stored. A [`DomainEvent`] is what workers exchange over the bus.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobError, JobId, JobStatus};
use crate::media::MediaSource;

/// Object attributes carried by a storage notification (`data` field).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    /// Object path
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// Object generation (string-encoded int64 on the wire)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metageneration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

/// A decoded request to react to a job snapshot write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Notification id; the deduplication key
    pub event_id: String,
    pub event_time: DateTime<Utc>,
    pub source_object: ObjectMetadata,
}

/// Events exchanged between workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A job entered the queue.
    JobQueued {
        job_id: JobId,
        request_id: String,
        media: MediaSource,
        queued_at: DateTime<Utc>,
    },
    /// A job snapshot was written under a new status.
    JobStatusChanged {
        job_id: JobId,
        status: JobStatus,
        /// Notification that observed the change
        event_id: String,
        changed_at: DateTime<Utc>,
    },
    /// A job reached `Failed`.
    JobFailed {
        job_id: JobId,
        error: JobError,
        attempts: u32,
        failed_at: DateTime<Utc>,
    },
    /// A transcript was written and the job completed.
    TranscriptComplete {
        job_id: JobId,
        transcript_id: String,
        turn_count: u32,
        completed_at: DateTime<Utc>,
    },
    /// Instruction for the worker owning `stage` to advance the job.
    WorkMessage {
        job_id: JobId,
        stage: JobStatus,
        /// Job attempts observed when the work was dispatched
        attempt: u32,
        /// Notification that triggered the dispatch
        source_event_id: String,
    },
}

/// Event that fails its schema constraints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventValidationError {
    #[error("{event_type}: job id {job_id:?} is not canonical")]
    InvalidJobId { event_type: &'static str, job_id: String },

    #[error("{event_type}: field {field} must not be empty")]
    EmptyField { event_type: &'static str, field: &'static str },

    #[error("work message for terminal stage {stage}")]
    TerminalStage { stage: JobStatus },
}

impl DomainEvent {
    /// Wire name of the variant.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::JobQueued { .. } => "job_queued",
            DomainEvent::JobStatusChanged { .. } => "job_status_changed",
            DomainEvent::JobFailed { .. } => "job_failed",
            DomainEvent::TranscriptComplete { .. } => "transcript_complete",
            DomainEvent::WorkMessage { .. } => "work_message",
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            DomainEvent::JobQueued { job_id, .. }
            | DomainEvent::JobStatusChanged { job_id, .. }
            | DomainEvent::JobFailed { job_id, .. }
            | DomainEvent::TranscriptComplete { job_id, .. }
            | DomainEvent::WorkMessage { job_id, .. } => job_id,
        }
    }

    /// Content-derived key identifying the effect this event asks for.
    ///
    /// Equal for republished copies of the same event, so consumers can
    /// deduplicate even when the bus assigns a fresh message id.
    pub fn dedup_key(&self) -> String {
        match self {
            DomainEvent::JobQueued { job_id, .. } => format!("queued:{}", job_id),
            DomainEvent::JobStatusChanged {
                job_id, event_id, ..
            } => format!("status:{}:{}", job_id, event_id),
            DomainEvent::JobFailed { job_id, .. } => format!("failed:{}", job_id),
            DomainEvent::TranscriptComplete {
                job_id,
                transcript_id,
                ..
            } => format!("complete:{}:{}", job_id, transcript_id),
            // One unit of work per stage and attempt, whichever notification asked for it
            DomainEvent::WorkMessage {
                job_id,
                stage,
                attempt,
                ..
            } => format!("work:{}:{}:{}", job_id, stage, attempt),
        }
    }

    /// Check constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), EventValidationError> {
        let event_type = self.event_type();

        if JobId::parse(self.job_id().as_str()).is_err() {
            return Err(EventValidationError::InvalidJobId {
                event_type,
                job_id: self.job_id().to_string(),
            });
        }

        let require = |value: &str, field: &'static str| {
            if value.trim().is_empty() {
                Err(EventValidationError::EmptyField { event_type, field })
            } else {
                Ok(())
            }
        };

        match self {
            DomainEvent::JobQueued { request_id, .. } => require(request_id, "request_id"),
            DomainEvent::JobStatusChanged { event_id, .. } => require(event_id, "event_id"),
            DomainEvent::JobFailed { error, .. } => {
                require(&error.code, "error.code")?;
                require(&error.message, "error.message")
            }
            DomainEvent::TranscriptComplete { transcript_id, .. } => {
                require(transcript_id, "transcript_id")
            }
            DomainEvent::WorkMessage {
                stage,
                source_event_id,
                ..
            } => {
                if stage.is_terminal() {
                    return Err(EventValidationError::TerminalStage { stage: *stage });
                }
                require(source_event_id, "source_event_id")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(stage: JobStatus) -> DomainEvent {
        DomainEvent::WorkMessage {
            job_id: JobId::new(),
            stage,
            attempt: 0,
            source_event_id: "evt-1".to_string(),
        }
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let events = [
            work(JobStatus::Queued),
            DomainEvent::JobFailed {
                job_id: JobId::new(),
                error: JobError::new("inference", "boom"),
                attempts: 3,
                failed_at: Utc::now(),
            },
            DomainEvent::TranscriptComplete {
                job_id: JobId::new(),
                transcript_id: "t".to_string(),
                turn_count: 2,
                completed_at: Utc::now(),
            },
        ];

        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }

    #[test]
    fn test_validate() {
        assert!(work(JobStatus::Processing).validate().is_ok());
        assert_eq!(
            work(JobStatus::Completed).validate(),
            Err(EventValidationError::TerminalStage {
                stage: JobStatus::Completed
            })
        );

        let empty = DomainEvent::TranscriptComplete {
            job_id: JobId::new(),
            transcript_id: " ".to_string(),
            turn_count: 0,
            completed_at: Utc::now(),
        };
        assert!(matches!(
            empty.validate(),
            Err(EventValidationError::EmptyField { field: "transcript_id", .. })
        ));

        let bad_id: DomainEvent = serde_json::from_str(
            r#"{"type":"job_status_changed","job_id":"nope","status":"queued","event_id":"e","changed_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(
            bad_id.validate(),
            Err(EventValidationError::InvalidJobId { .. })
        ));
    }

    #[test]
    fn test_dedup_key_is_content_derived() {
        let a = work(JobStatus::Queued);
        let b = a.clone();
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key(), format!("work:{}:queued:0", a.job_id()));
        assert_ne!(a.dedup_key(), work(JobStatus::Queued).dedup_key());

        // Redispatch of the same attempt from another notification
        let redispatched = match a.clone() {
            DomainEvent::WorkMessage {
                job_id, stage, attempt, ..
            } => DomainEvent::WorkMessage {
                job_id,
                stage,
                attempt,
                source_event_id: "other".to_string(),
            },
            other => other,
        };
        assert_eq!(a.dedup_key(), redispatched.dedup_key());
    }
}
