//! Shared data models for the tscribe job choreography.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, statuses and the transition table
//! - Job snapshot paths (`jobs/<status>/<job_id>.json`)
//! - Transition events and bus domain events
//! - Transcripts and LLM execution artifacts

pub mod artifact;
pub mod event;
pub mod job;
pub mod media;
pub mod path;

// Re-export common types
pub use artifact::{DialogueTurn, ExecutionOutcome, LlmExecutionArtifact, ProviderConfig, Transcript};
pub use event::{DomainEvent, EventValidationError, ObjectMetadata, TransitionEvent};
pub use job::{
    InvalidJobId, Job, JobError, JobId, JobMetadata, JobPatch, JobPriority, JobStatus,
    TranscriptionContext, TransitionError,
};
pub use media::{MediaMetadata, MediaSource};
pub use path::{JobLocation, PathDecodeError};
