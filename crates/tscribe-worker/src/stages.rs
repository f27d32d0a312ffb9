//! Stage handlers.
//!
//! Each handler takes one delivery to completion and answers with a
//! [`DeliveryOutcome`]. Handlers never mutate a job except through
//! [`JobStateStore::transition`]; the store's status check and the guard's
//! claim are what make redelivery and duplicate dispatch harmless.
//!
//! Flow per topic:
//! - `notifications`: a snapshot landed under `jobs/<status>/`. Publish the
//!   lifecycle events for that status and the work message for the next stage.
//! - `metadata`: resolve media metadata, `queued -> metadata_ready`.
//! - `transcription`: `metadata_ready -> processing`, then run inference and
//!   finish with `completed`, a retry of `processing`, or `failed`.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn, Instrument};

use tscribe_bus::{
    decode_push_json, notification, topics, Delivery, IdempotencyGuard, RetryingPublisher,
};
use tscribe_models::{
    DomainEvent, ExecutionOutcome, JobError, JobId, JobPatch, JobStatus, LlmExecutionArtifact,
    Transcript, TransitionEvent,
};
use tscribe_store::{ArtifactStore, JobStateStore, StoreError};

use crate::collaborators::{InferenceProvider, MetadataResolver};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::prompt::compile_prompt;

/// What the delivery loop does with a handled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Done, or nothing left to do
    Ack,
    /// Transient failure; redeliver
    Retry(String),
    /// Can never be handled
    DeadLetter(String),
}

impl DeliveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Ack => "ack",
            DeliveryOutcome::Retry(_) => "retry",
            DeliveryOutcome::DeadLetter(_) => "dead_letter",
        }
    }
}

/// Topic a work message for `stage` travels on.
pub fn work_topic(stage: JobStatus) -> Option<&'static str> {
    match stage {
        JobStatus::Queued => Some(topics::METADATA),
        JobStatus::MetadataReady | JobStatus::Processing => Some(topics::TRANSCRIPTION),
        JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => None,
    }
}

/// Handlers for every topic a worker can serve.
pub struct StageHandlers {
    store: Arc<JobStateStore>,
    artifacts: ArtifactStore,
    guard: Arc<dyn IdempotencyGuard>,
    publisher: RetryingPublisher,
    resolver: Arc<dyn MetadataResolver>,
    inference: Arc<dyn InferenceProvider>,
    config: WorkerConfig,
}

impl StageHandlers {
    pub fn new(
        store: Arc<JobStateStore>,
        guard: Arc<dyn IdempotencyGuard>,
        publisher: RetryingPublisher,
        resolver: Arc<dyn MetadataResolver>,
        inference: Arc<dyn InferenceProvider>,
        config: WorkerConfig,
    ) -> Self {
        let artifacts = ArtifactStore::new(
            Arc::clone(store.objects()),
            store.config().io_timeout,
        );
        Self {
            store,
            artifacts,
            guard,
            publisher,
            resolver,
            inference,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handle one delivery from any subscription.
    pub async fn handle(&self, delivery: &Delivery) -> DeliveryOutcome {
        match delivery.topic.as_str() {
            topics::NOTIFICATIONS => self.handle_notification(delivery).await,
            topics::METADATA | topics::TRANSCRIPTION => self.handle_work(delivery).await,
            other => DeliveryOutcome::DeadLetter(format!("no handler for topic {}", other)),
        }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    async fn handle_notification(&self, delivery: &Delivery) -> DeliveryOutcome {
        let event = match notification::decode_json(&delivery.payload) {
            Ok(event) => event,
            Err(e) if e.is_foreign_object() => {
                debug!(message_id = %delivery.message_id, error = %e, "Ignoring notification outside jobs/");
                return DeliveryOutcome::Ack;
            }
            Err(e) => {
                warn!(message_id = %delivery.message_id, error = %e, "Undecodable notification");
                return DeliveryOutcome::DeadLetter(e.to_string());
            }
        };

        let key = format!("notification:{}", event.event_id);
        let span = JobLogger::for_status(&event.job_id, event.status).create_span();
        self.claimed(&key, self.dispatch(event)).instrument(span).await
    }

    /// Publish what a snapshot under `event.status` calls for.
    async fn dispatch(&self, event: TransitionEvent) -> WorkerResult<DeliveryOutcome> {
        let job = self.store.get(&event.job_id).await?;
        if job.status != event.status {
            debug!(
                job_id = %job.id,
                event_id = %event.event_id,
                notified = %event.status,
                current = %job.status,
                "Stale notification"
            );
            return Ok(DeliveryOutcome::Ack);
        }

        self.publish(
            topics::EVENTS,
            DomainEvent::JobStatusChanged {
                job_id: job.id.clone(),
                status: job.status,
                event_id: event.event_id.clone(),
                changed_at: event.event_time,
            },
        )
        .await?;

        match job.status {
            JobStatus::Queued => {
                self.publish(
                    topics::EVENTS,
                    DomainEvent::JobQueued {
                        job_id: job.id.clone(),
                        request_id: job.request_id.clone(),
                        media: job.media.clone(),
                        queued_at: job.created_at,
                    },
                )
                .await?;
                self.dispatch_work(&job.id, job.status, job.attempts, &event.event_id).await?;
            }
            JobStatus::MetadataReady | JobStatus::Processing => {
                self.dispatch_work(&job.id, job.status, job.attempts, &event.event_id).await?;
            }
            JobStatus::Completed => {
                if let Some(transcript_id) = job.transcript_id.clone() {
                    let turn_count = match self.artifacts.get_transcript(&transcript_id).await? {
                        Some(transcript) => transcript.turns.len() as u32,
                        None => {
                            warn!(job_id = %job.id, transcript_id = %transcript_id, "Completed job has no transcript object");
                            0
                        }
                    };
                    self.publish(
                        topics::EVENTS,
                        DomainEvent::TranscriptComplete {
                            job_id: job.id.clone(),
                            transcript_id,
                            turn_count,
                            completed_at: job.updated_at,
                        },
                    )
                    .await?;
                }
            }
            JobStatus::Failed => {
                let error = job
                    .error
                    .clone()
                    .unwrap_or_else(|| JobError::new("unknown", "job failed without an error record"));
                self.publish(
                    topics::EVENTS,
                    DomainEvent::JobFailed {
                        job_id: job.id.clone(),
                        error,
                        attempts: job.attempts,
                        failed_at: job.updated_at,
                    },
                )
                .await?;
            }
            JobStatus::Cancelled => {}
        }

        info!(job_id = %job.id, status = %job.status, event_id = %event.event_id, "Dispatched notification");
        Ok(DeliveryOutcome::Ack)
    }

    async fn dispatch_work(
        &self,
        job_id: &JobId,
        stage: JobStatus,
        attempt: u32,
        source_event_id: &str,
    ) -> WorkerResult<()> {
        let Some(topic) = work_topic(stage) else {
            return Ok(());
        };
        self.publish(
            topic,
            DomainEvent::WorkMessage {
                job_id: job_id.clone(),
                stage,
                attempt,
                source_event_id: source_event_id.to_string(),
            },
        )
        .await
    }

    async fn publish(&self, topic: &str, event: DomainEvent) -> WorkerResult<()> {
        if let Err(failure) = self.publisher.publish(topic, &event).await {
            warn!(
                topic = %topic,
                job_id = %event.job_id(),
                event_type = event.event_type(),
                reason = failure.reason(),
                attempts = failure.attempts(),
                "Could not publish event"
            );
            return Err(failure.into());
        }
        Ok(())
    }

    // ========================================================================
    // Work messages
    // ========================================================================

    async fn handle_work(&self, delivery: &Delivery) -> DeliveryOutcome {
        let message = match decode_push_json(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(message_id = %delivery.message_id, error = %e, "Undecodable work message");
                return DeliveryOutcome::DeadLetter(e.to_string());
            }
        };

        let DomainEvent::WorkMessage {
            job_id,
            stage,
            attempt,
            ..
        } = &message.event
        else {
            return DeliveryOutcome::DeadLetter(format!(
                "unexpected {} on {}",
                message.event.event_type(),
                delivery.topic
            ));
        };

        if work_topic(*stage) != Some(delivery.topic.as_str()) {
            return DeliveryOutcome::DeadLetter(format!(
                "work for stage {} does not belong on {}",
                stage, delivery.topic
            ));
        }

        let key = message.event.dedup_key();
        let logger = JobLogger::for_status(job_id, *stage);
        let span = logger.create_span();
        let work = async {
            match stage {
                JobStatus::Queued => self.resolve_metadata(job_id, delivery.delivery_attempt, &logger).await,
                JobStatus::MetadataReady => self.start_processing(job_id, &logger).await,
                _ => self.run_inference(job_id, *attempt, &logger).await,
            }
        };
        self.claimed(&key, work).instrument(span).await
    }

    /// `queued -> metadata_ready` with the resolved media details.
    async fn resolve_metadata(
        &self,
        job_id: &JobId,
        delivery_attempt: u32,
        logger: &JobLogger,
    ) -> WorkerResult<DeliveryOutcome> {
        let job = self.store.get(job_id).await?;
        if job.status != JobStatus::Queued {
            logger.log_warning(&format!("job is {}, skipping metadata", job.status));
            return Ok(DeliveryOutcome::Ack);
        }

        logger.log_start(&format!("resolving {} metadata", job.media.kind()));
        match self.call_vendor("metadata", self.resolver.resolve(&job.media)).await {
            Ok(details) => {
                let next = self
                    .store
                    .transition(
                        job_id,
                        JobStatus::Queued,
                        JobStatus::MetadataReady,
                        JobPatch::new().with_media_details(details),
                    )
                    .await?;
                logger.log_transition(JobStatus::Queued, next.status, next.revision);
                Ok(DeliveryOutcome::Ack)
            }
            Err(e) if e.is_permanent_failure() || delivery_attempt >= self.config.max_deliveries => {
                logger.log_error(&e.to_string());
                self.fail(job_id, JobStatus::Queued, JobError::new("metadata", e.to_string()), logger)
                    .await
            }
            Err(e) => {
                logger.log_warning(&format!("metadata attempt {} failed: {}", delivery_attempt, e));
                Ok(DeliveryOutcome::Retry(e.to_string()))
            }
        }
    }

    /// `metadata_ready -> processing`, opening the first attempt.
    async fn start_processing(&self, job_id: &JobId, logger: &JobLogger) -> WorkerResult<DeliveryOutcome> {
        let job = self.store.get(job_id).await?;
        if job.status != JobStatus::MetadataReady {
            logger.log_warning(&format!("job is {}, not starting processing", job.status));
            return Ok(DeliveryOutcome::Ack);
        }

        let next = self
            .store
            .transition(
                job_id,
                JobStatus::MetadataReady,
                JobStatus::Processing,
                JobPatch::new().with_attempt(),
            )
            .await?;
        logger.log_transition(JobStatus::MetadataReady, next.status, next.revision);
        Ok(DeliveryOutcome::Ack)
    }

    /// One inference attempt. Always leaves an execution artifact behind.
    async fn run_inference(&self, job_id: &JobId, attempt: u32, logger: &JobLogger) -> WorkerResult<DeliveryOutcome> {
        let job = self.store.get(job_id).await?;
        if job.status != JobStatus::Processing || job.attempts != attempt {
            logger.log_warning(&format!(
                "job is {} at attempt {}, dropping work for attempt {}",
                job.status, job.attempts, attempt
            ));
            return Ok(DeliveryOutcome::Ack);
        }

        logger.log_start(&format!("inference attempt {}/{}", attempt, self.config.max_attempts));
        let prompt = compile_prompt(&job);
        let started_at = Utc::now();
        let result = self.call_vendor("inference", self.inference.infer(&prompt)).await;

        let outcome = match &result {
            Ok(turns) => ExecutionOutcome::Succeeded {
                turn_count: turns.len() as u32,
            },
            Err(e) => ExecutionOutcome::Failed {
                message: e.to_string(),
            },
        };
        let record = LlmExecutionArtifact::new(
            job_id.clone(),
            self.inference.provider_config(),
            attempt,
            started_at,
            outcome,
        );
        self.artifacts.put_llm_artifact(&record).await?;

        match result {
            Ok(turns) => {
                let transcript = Transcript::new(job_id.clone(), turns);
                self.artifacts.put_transcript(&transcript).await?;
                logger.log_progress(&format!("transcript {} written", transcript.transcript_id));

                let next = self
                    .store
                    .transition(
                        job_id,
                        JobStatus::Processing,
                        JobStatus::Completed,
                        JobPatch::new().with_transcript_id(transcript.transcript_id.clone()),
                    )
                    .await?;
                logger.log_transition(JobStatus::Processing, next.status, next.revision);
                logger.log_completion(&format!("{} turns", transcript.turns.len()));
                Ok(DeliveryOutcome::Ack)
            }
            Err(e) if job.attempts < self.config.max_attempts && !e.is_permanent_failure() => {
                logger.log_warning(&format!("inference attempt {} failed: {}", attempt, e));
                let next = self
                    .store
                    .transition(
                        job_id,
                        JobStatus::Processing,
                        JobStatus::Processing,
                        JobPatch::new().with_attempt(),
                    )
                    .await?;
                logger.log_transition(JobStatus::Processing, next.status, next.revision);
                Ok(DeliveryOutcome::Ack)
            }
            Err(e) => {
                logger.log_error(&format!("inference gave up after attempt {}: {}", attempt, e));
                self.fail(job_id, JobStatus::Processing, JobError::new("inference", e.to_string()), logger)
                    .await
            }
        }
    }

    async fn fail(
        &self,
        job_id: &JobId,
        from: JobStatus,
        error: JobError,
        logger: &JobLogger,
    ) -> WorkerResult<DeliveryOutcome> {
        let next = self
            .store
            .transition(job_id, from, JobStatus::Failed, JobPatch::new().with_error(error))
            .await?;
        logger.log_transition(from, next.status, next.revision);
        Ok(DeliveryOutcome::Ack)
    }

    async fn call_vendor<T, F>(&self, operation: &'static str, fut: F) -> WorkerResult<T>
    where
        F: Future<Output = WorkerResult<T>>,
    {
        match tokio::time::timeout(self.config.vendor_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::VendorTimeout {
                operation,
                timeout_ms: self.config.vendor_timeout.as_millis() as u64,
            }),
        }
    }

    // ========================================================================
    // Claims
    // ========================================================================

    /// Run `work` under the claim for `key`.
    ///
    /// A held claim means another delivery did or is doing the work. The
    /// claim is kept on `Ack` and released otherwise so redelivery can retry.
    async fn claimed<F>(&self, key: &str, work: F) -> DeliveryOutcome
    where
        F: Future<Output = WorkerResult<DeliveryOutcome>>,
    {
        match self.guard.claim(key).await {
            Ok(_) => {}
            Err(e) if e.is_already_claimed() => {
                debug!(key = %key, "Duplicate delivery suppressed");
                return DeliveryOutcome::Ack;
            }
            Err(e) => return DeliveryOutcome::Retry(e.to_string()),
        }

        let outcome = match work.await {
            Ok(outcome) => outcome,
            Err(e) => classify(e),
        };

        if outcome != DeliveryOutcome::Ack {
            if let Err(e) = self.guard.release(key).await {
                warn!(key = %key, error = %e, "Failed to release claim");
            }
        }
        outcome
    }
}

/// Map a handler error onto a delivery outcome.
fn classify(error: WorkerError) -> DeliveryOutcome {
    match &error {
        // The job moved on while we worked; the winner owns what follows
        WorkerError::Store(StoreError::StateConflict { .. })
        | WorkerError::Store(StoreError::InvalidTransition { .. }) => {
            debug!(error = %error, "Transition lost to a concurrent writer");
            DeliveryOutcome::Ack
        }
        // Notification raced the index; the snapshot may become visible
        WorkerError::Store(StoreError::NotFound(_)) => DeliveryOutcome::Retry(error.to_string()),
        e if e.is_retryable() => {
            warn!(error = %error, "Transient handler failure");
            DeliveryOutcome::Retry(error.to_string())
        }
        _ => {
            warn!(error = %error, "Permanent handler failure");
            DeliveryOutcome::DeadLetter(error.to_string())
        }
    }
}
