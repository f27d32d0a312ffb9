//! Structured job logging.
//!
//! Every line carries the job id and the stage handling it, so one job can be
//! followed across workers with a single filter.

use tracing::{error, info, warn, Span};
use tscribe_models::{JobId, JobStatus};

/// Per-delivery logger bound to one job and stage.
///
/// Stage handlers create one per delivery and log lifecycle lines through
/// it, so the job id and stage never have to be repeated at call sites.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    stage: String,
}

impl JobLogger {
    /// Create a logger for a job and the stage handling it.
    ///
    /// # Arguments
    /// * `job_id` - The job being advanced
    /// * `stage` - The stage name (e.g. "metadata", "transcription")
    pub fn new(job_id: &JobId, stage: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage: stage.to_string(),
        }
    }

    /// Logger for the worker owning `status`.
    pub fn for_status(job_id: &JobId, status: JobStatus) -> Self {
        Self::new(job_id, status.as_str())
    }

    /// Log the start of a stage's work on the job.
    pub fn log_start(&self, message: &str) {
        info!(job_id = %self.job_id, stage = %self.stage, "Stage started: {}", message);
    }

    /// Log a step within the stage, such as a vendor call returning.
    pub fn log_progress(&self, message: &str) {
        info!(job_id = %self.job_id, stage = %self.stage, "Stage progress: {}", message);
    }

    /// Log a recoverable problem; the delivery will be retried or acked.
    pub fn log_warning(&self, message: &str) {
        warn!(job_id = %self.job_id, stage = %self.stage, "Stage warning: {}", message);
    }

    /// Log a failure that ends the job or dead-letters the delivery.
    pub fn log_error(&self, message: &str) {
        error!(job_id = %self.job_id, stage = %self.stage, "Stage error: {}", message);
    }

    /// Log a status write made by this stage.
    pub fn log_transition(&self, from: JobStatus, to: JobStatus, revision: u64) {
        info!(
            job_id = %self.job_id,
            stage = %self.stage,
            from = %from,
            to = %to,
            revision,
            "Job transitioned"
        );
    }

    /// Log the end of the stage's work on the job.
    pub fn log_completion(&self, message: &str) {
        info!(job_id = %self.job_id, stage = %self.stage, "Stage completed: {}", message);
    }

    /// Get the job ID.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Get the stage name.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Create a tracing span for this job and stage.
    ///
    /// Handlers instrument their whole future with it, so lines logged by
    /// the store and bus crates inherit the job context.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("job", job_id = %self.job_id, stage = %self.stage)
    }
}
