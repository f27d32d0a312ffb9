//! Retry with exponential backoff for outbound publishes.
//!
//! Failures are classified before retrying:
//! - schema validation: the event can never be sent, surfaced immediately
//! - client errors (transport, timeout): retried with backoff
//! - retry exhaustion: terminal, carries the attempt count and last cause

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use tscribe_models::DomainEvent;

use crate::adapter::{to_push_payload, RawMessage};
use crate::error::{PublishError, PublishFailure};
use crate::metrics;
use crate::publisher::MessagePublisher;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Timeout for each publish call
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create policy from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |name: &str, fallback: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            max_retries: std::env::var("TSCRIBE_RETRY_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            initial_delay: millis("TSCRIBE_RETRY_INITIAL_DELAY_MS", defaults.initial_delay),
            backoff_multiplier: std::env::var("TSCRIBE_RETRY_BACKOFF_MULTIPLIER")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|m: &f64| m.is_finite() && *m >= 1.0)
                .unwrap_or(defaults.backoff_multiplier),
            max_delay: millis("TSCRIBE_RETRY_MAX_DELAY_MS", defaults.max_delay),
            attempt_timeout: millis("TSCRIBE_PUBLISH_TIMEOUT_MS", defaults.attempt_timeout),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
    pub attempts: u32,
}

/// Publisher wrapper applying a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryingPublisher {
    inner: Arc<dyn MessagePublisher>,
    policy: RetryPolicy,
}

impl RetryingPublisher {
    pub fn new(inner: Arc<dyn MessagePublisher>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Validate, serialize and publish an event.
    pub async fn publish(&self, topic: &str, event: &DomainEvent) -> Result<PublishReceipt, PublishFailure> {
        let raw = match to_push_payload(event) {
            Ok(raw) => raw,
            Err(e) => {
                let failure = PublishFailure::SchemaValidation(e);
                warn!(topic = %topic, job_id = %event.job_id(), error = %failure, "Refusing to publish invalid event");
                metrics::record_publish_failure(topic, failure.reason());
                return Err(failure);
            }
        };

        let receipt = self.publish_raw(topic, &raw).await?;
        debug!(
            topic = %topic,
            job_id = %event.job_id(),
            event_type = event.event_type(),
            message_id = %receipt.message_id,
            attempts = receipt.attempts,
            "Published event"
        );
        Ok(receipt)
    }

    /// Publish an already-encoded message with retries.
    pub async fn publish_raw(&self, topic: &str, raw: &RawMessage) -> Result<PublishReceipt, PublishFailure> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.publish_once(topic, raw).await {
                Ok(message_id) => {
                    return Ok(PublishReceipt {
                        message_id,
                        attempts: attempt,
                    })
                }
                Err(PublishFailure::ClientError(cause)) if attempt <= self.policy.max_retries => {
                    let delay = self.policy.delay_for_retry(attempt);
                    warn!(
                        topic = %topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        "Publish failed, retrying"
                    );
                    metrics::record_retry(topic, delay.as_millis() as u64);
                    tokio::time::sleep(delay).await;
                }
                Err(PublishFailure::ClientError(cause)) => {
                    let failure = PublishFailure::RetryExceeded {
                        attempts: attempt,
                        last_cause: cause,
                    };
                    warn!(topic = %topic, error = %failure, "Publish retries exhausted");
                    metrics::record_publish_failure(topic, failure.reason());
                    return Err(failure);
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// One attempt, bounded by the attempt timeout.
    pub async fn publish_once(&self, topic: &str, raw: &RawMessage) -> Result<String, PublishFailure> {
        metrics::record_publish_attempt(topic);

        match tokio::time::timeout(self.policy.attempt_timeout, self.inner.publish(topic, raw)).await {
            Ok(Ok(message_id)) => Ok(message_id),
            Ok(Err(e)) => Err(PublishFailure::ClientError(PublishError::Bus(e))),
            Err(_) => Err(PublishFailure::ClientError(PublishError::Timeout {
                timeout_ms: self.policy.attempt_timeout.as_millis() as u64,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BusError, BusResult};
    use crate::publisher::InMemoryPublisher;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::Instant;
    use tscribe_models::{JobId, JobStatus};

    /// Fails the first `failures` calls and records when each call happened.
    struct FlakyPublisher {
        failures: u32,
        calls: Mutex<Vec<Instant>>,
    }

    impl FlakyPublisher {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagePublisher for FlakyPublisher {
        async fn publish(&self, _topic: &str, _message: &RawMessage) -> BusResult<String> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            if calls.len() as u32 <= self.failures {
                return Err(BusError::transport("unavailable"));
            }
            Ok(format!("m-{}", calls.len()))
        }
    }

    struct HangingPublisher;

    #[async_trait]
    impl MessagePublisher for HangingPublisher {
        async fn publish(&self, _topic: &str, _message: &RawMessage) -> BusResult<String> {
            std::future::pending().await
        }
    }

    fn event() -> DomainEvent {
        DomainEvent::JobStatusChanged {
            job_id: JobId::new(),
            status: JobStatus::Queued,
            event_id: "evt".to_string(),
            changed_at: chrono::Utc::now(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_max_delay(Duration::from_millis(250))
    }

    #[test]
    fn test_delay_schedule() {
        let policy = policy();
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(250));
        assert_eq!(policy.delay_for_retry(60), Duration::from_millis(250));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_retries() {
        let inner = Arc::new(FlakyPublisher::new(u32::MAX));
        let publisher = RetryingPublisher::new(inner.clone(), policy());

        let failure = publisher.publish("events", &event()).await.unwrap_err();
        match failure {
            PublishFailure::RetryExceeded {
                attempts,
                last_cause,
            } => {
                assert_eq!(attempts, 4);
                assert!(matches!(last_cause, PublishError::Bus(BusError::Transport(_))));
            }
            other => panic!("expected retry exhaustion, got {other}"),
        }

        let calls = inner.calls();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(250)
            ]
        );
        for pair in gaps.windows(2) {
            let grown = pair[0].mul_f64(2.0).min(Duration::from_millis(250));
            assert!(pair[1] >= grown);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let inner = Arc::new(FlakyPublisher::new(2));
        let publisher = RetryingPublisher::new(inner.clone(), policy());

        let receipt = tokio_test::assert_ok!(publisher.publish("events", &event()).await);
        assert_eq!(receipt.attempts, 3);
        assert_eq!(receipt.message_id, "m-3");
    }

    #[tokio::test]
    async fn test_schema_validation_not_retried() {
        let inner = Arc::new(InMemoryPublisher::new());
        let publisher = RetryingPublisher::new(inner.clone(), policy());

        let invalid = DomainEvent::JobStatusChanged {
            job_id: JobId::new(),
            status: JobStatus::Queued,
            event_id: String::new(),
            changed_at: chrono::Utc::now(),
        };

        let failure = publisher.publish("events", &invalid).await.unwrap_err();
        assert!(matches!(failure, PublishFailure::SchemaValidation(_)));
        assert_eq!(failure.attempts(), 1);
        assert!(inner.published("events").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_client_error() {
        let publisher = RetryingPublisher::new(
            Arc::new(HangingPublisher),
            policy()
                .with_max_retries(1)
                .with_attempt_timeout(Duration::from_secs(1)),
        );

        let failure = publisher.publish("events", &event()).await.unwrap_err();
        assert!(matches!(
            failure,
            PublishFailure::RetryExceeded {
                attempts: 2,
                last_cause: PublishError::Timeout { timeout_ms: 1000 }
            }
        ));
    }

    #[tokio::test]
    async fn test_zero_retries_single_attempt() {
        let inner = Arc::new(InMemoryPublisher::new());
        inner.fail_next_publishes(1);
        let publisher = RetryingPublisher::new(inner, policy().with_max_retries(0));

        let failure = publisher.publish("events", &event()).await.unwrap_err();
        assert!(matches!(failure, PublishFailure::RetryExceeded { attempts: 1, .. }));
        assert_eq!(failure.attempts(), 1);
    }
}
