//! Transcripts and LLM execution artifacts.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobId;

/// One utterance in a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DialogueTurn {
    pub speaker: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<u64>,
}

/// Result artifact of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Transcript {
    pub transcript_id: String,
    pub job_id: JobId,
    pub turns: Vec<DialogueTurn>,
    pub created_at: DateTime<Utc>,
}

impl Transcript {
    pub fn new(job_id: JobId, turns: Vec<DialogueTurn>) -> Self {
        Self {
            transcript_id: Uuid::new_v4().to_string(),
            job_id,
            turns,
            created_at: Utc::now(),
        }
    }

    /// Object path for this transcript.
    pub fn path(&self) -> String {
        transcript_path(&self.transcript_id)
    }
}

/// Inference provider settings used for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderConfig {
    pub provider: String,
    pub model: String,
    pub prompt_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// How an inference call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded { turn_count: u32 },
    Failed { message: String },
}

/// Immutable trace of one inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LlmExecutionArtifact {
    pub execution_id: String,
    pub job_id: JobId,
    pub provider: ProviderConfig,
    /// Job attempt this call belongs to
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub latency_ms: u64,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
}

impl LlmExecutionArtifact {
    pub fn new(
        job_id: JobId,
        provider: ProviderConfig,
        attempt: u32,
        started_at: DateTime<Utc>,
        outcome: ExecutionOutcome,
    ) -> Self {
        let finished_at = Utc::now();
        let latency_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

        Self {
            execution_id: Uuid::new_v4().to_string(),
            job_id,
            provider,
            attempt,
            started_at,
            finished_at,
            latency_ms,
            outcome,
        }
    }

    /// Object path for this artifact.
    pub fn path(&self) -> String {
        llm_artifact_path(&self.job_id, &self.execution_id)
    }
}

/// `transcripts/<transcript_id>.json`
pub fn transcript_path(transcript_id: &str) -> String {
    format!("transcripts/{}.json", transcript_id)
}

/// `artifacts/llm/<job_id>/<execution_id>.json`
pub fn llm_artifact_path(job_id: &JobId, execution_id: &str) -> String {
    format!("artifacts/llm/{}/{}.json", job_id, execution_id)
}
