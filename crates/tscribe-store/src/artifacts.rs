//! Transcript and LLM execution artifact persistence.
//!
//! Artifacts are immutable: every write is create-only.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use tscribe_models::{artifact, JobId, LlmExecutionArtifact, Transcript};

use crate::error::{StoreError, StoreResult};
use crate::object::{ObjectStore, CONTENT_TYPE_JSON};

/// Writes and reads job artifacts through an [`ObjectStore`].
#[derive(Clone)]
pub struct ArtifactStore {
    objects: Arc<dyn ObjectStore>,
    io_timeout: Duration,
}

impl ArtifactStore {
    pub fn new(objects: Arc<dyn ObjectStore>, io_timeout: Duration) -> Self {
        Self { objects, io_timeout }
    }

    /// Store a transcript. Returns its path.
    pub async fn put_transcript(&self, transcript: &Transcript) -> StoreResult<String> {
        let key = transcript.path();
        self.put_once(&key, serde_json::to_vec(transcript)?).await?;
        info!(
            job_id = %transcript.job_id,
            transcript_id = %transcript.transcript_id,
            turns = transcript.turns.len(),
            "Stored transcript"
        );
        Ok(key)
    }

    /// Store an execution record. Returns its path.
    pub async fn put_llm_artifact(&self, record: &LlmExecutionArtifact) -> StoreResult<String> {
        let key = record.path();
        self.put_once(&key, serde_json::to_vec(record)?).await?;
        debug!(job_id = %record.job_id, execution_id = %record.execution_id, "Stored LLM execution artifact");
        Ok(key)
    }

    pub async fn get_transcript(&self, transcript_id: &str) -> StoreResult<Option<Transcript>> {
        let key = artifact::transcript_path(transcript_id);
        match self.timed("get", self.objects.get(&key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every execution record for a job.
    pub async fn list_llm_artifacts(&self, job_id: &JobId) -> StoreResult<Vec<LlmExecutionArtifact>> {
        let prefix = format!("artifacts/llm/{}/", job_id);
        let keys = self.timed("list", self.objects.list(&prefix)).await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.timed("get", self.objects.get(&key)).await? {
                records.push(serde_json::from_slice::<LlmExecutionArtifact>(&bytes)?);
            }
        }
        records.sort_by_key(|record| record.started_at);
        Ok(records)
    }

    async fn put_once(&self, key: &str, body: Vec<u8>) -> StoreResult<()> {
        let created = self
            .timed("put_if_absent", self.objects.put_if_absent(key, body, CONTENT_TYPE_JSON))
            .await?;
        if !created {
            return Err(StoreError::backend(format!("artifact {} already exists", key)));
        }
        Ok(())
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        tokio::time::timeout(self.io_timeout, fut)
            .await
            .unwrap_or(Err(StoreError::Timeout {
                operation,
                timeout_ms: self.io_timeout.as_millis() as u64,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::InMemoryObjectStore;
    use chrono::Utc;
    use tscribe_models::{DialogueTurn, ExecutionOutcome, ProviderConfig};

    fn provider() -> ProviderConfig {
        ProviderConfig {
            provider: "test".into(),
            model: "m".into(),
            prompt_version: "v1".into(),
            temperature: None,
        }
    }

    #[tokio::test]
    async fn test_transcript_round_trip() {
        let objects = Arc::new(InMemoryObjectStore::default());
        let store = ArtifactStore::new(objects.clone(), Duration::from_secs(1));
        let transcript = Transcript::new(
            JobId::new(),
            vec![DialogueTurn {
                speaker: "A".into(),
                text: "hello".into(),
                start_ms: Some(0),
                end_ms: Some(900),
            }],
        );

        let key = store.put_transcript(&transcript).await.unwrap();
        assert_eq!(key, transcript.path());
        assert_eq!(
            store.get_transcript(&transcript.transcript_id).await.unwrap(),
            Some(transcript.clone())
        );

        // Artifacts are never overwritten
        assert!(store.put_transcript(&transcript).await.is_err());
        assert_eq!(objects.writes_under("transcripts/"), 1);
    }

    #[tokio::test]
    async fn test_list_llm_artifacts_per_job() {
        let store = ArtifactStore::new(Arc::new(InMemoryObjectStore::default()), Duration::from_secs(1));
        let job_id = JobId::new();

        for attempt in 1..=2 {
            let record = LlmExecutionArtifact::new(
                job_id.clone(),
                provider(),
                attempt,
                Utc::now(),
                ExecutionOutcome::Failed {
                    message: "boom".into(),
                },
            );
            store.put_llm_artifact(&record).await.unwrap();
        }
        let other = LlmExecutionArtifact::new(
            JobId::new(),
            provider(),
            1,
            Utc::now(),
            ExecutionOutcome::Succeeded { turn_count: 1 },
        );
        store.put_llm_artifact(&other).await.unwrap();

        let records = store.list_llm_artifacts(&job_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.job_id == job_id));
    }
}
