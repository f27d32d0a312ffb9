//! Worker configuration.

use std::fmt;
use std::time::Duration;

use tscribe_bus::topics;

/// A subscription the worker process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    /// Turns storage notifications into domain events and work messages
    Dispatcher,
    /// Resolves media metadata for queued jobs
    Metadata,
    /// Runs inference for jobs in `metadata_ready` / `processing`
    Transcription,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 3] = [
        WorkerRole::Dispatcher,
        WorkerRole::Metadata,
        WorkerRole::Transcription,
    ];

    /// Topic this role consumes.
    pub fn topic(&self) -> &'static str {
        match self {
            WorkerRole::Dispatcher => topics::NOTIFICATIONS,
            WorkerRole::Metadata => topics::METADATA,
            WorkerRole::Transcription => topics::TRANSCRIPTION,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Dispatcher => "dispatcher",
            WorkerRole::Metadata => "metadata",
            WorkerRole::Transcription => "transcription",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|role| role.as_str() == name)
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent handlers per subscription
    pub max_handlers: usize,
    /// Inference attempts before a job fails
    pub max_attempts: u32,
    /// Timeout for each metadata or inference call
    pub vendor_timeout: Duration,
    /// Deliveries fetched per receive
    pub receive_batch: usize,
    /// How long a receive waits for messages
    pub receive_wait: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Deliveries of one message before it is dead-lettered
    pub max_deliveries: u32,
    /// How long processed keys are remembered
    pub idempotency_retention: Duration,
    /// Subscriptions this process serves
    pub roles: Vec<WorkerRole>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_handlers: 8,
            max_attempts: 3,
            vendor_timeout: Duration::from_secs(120),
            receive_batch: 10,
            receive_wait: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            max_deliveries: 5,
            idempotency_retention: Duration::from_secs(24 * 3600),
            roles: WorkerRole::ALL.to_vec(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_handlers: std::env::var("WORKER_MAX_HANDLERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_handlers),
            max_attempts: std::env::var("WORKER_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_attempts),
            vendor_timeout: std::env::var("WORKER_VENDOR_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.vendor_timeout),
            receive_batch: std::env::var("WORKER_RECEIVE_BATCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.receive_batch),
            receive_wait: std::env::var("WORKER_RECEIVE_WAIT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.receive_wait),
            shutdown_timeout: std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            max_deliveries: std::env::var("WORKER_MAX_DELIVERIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_deliveries),
            idempotency_retention: std::env::var("TSCRIBE_IDEMPOTENCY_RETENTION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.idempotency_retention),
            roles: std::env::var("WORKER_ROLES")
                .ok()
                .map(|s| parse_roles(&s))
                .filter(|roles| !roles.is_empty())
                .unwrap_or(defaults.roles),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_vendor_timeout(mut self, timeout: Duration) -> Self {
        self.vendor_timeout = timeout;
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }
}

/// Comma-separated role names; unknown names are skipped.
fn parse_roles(value: &str) -> Vec<WorkerRole> {
    let mut roles = Vec::new();
    for role in value.split(',').filter_map(WorkerRole::from_name) {
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    roles
}
