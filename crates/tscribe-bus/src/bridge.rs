//! Storage notification bridge.
//!
//! [`NotifyingObjectStore`] wraps an object store and appends a finalize
//! CloudEvent to the notifications topic after every successful write under
//! `jobs/`. A write is reported as successful only once its notification is
//! queued, so a failed notification surfaces as a failed write and the
//! store's rollback applies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use tscribe_models::path::JOBS_PREFIX;
use tscribe_store::{ObjectChange, ObjectStore, StoreError, StoreResult};

use crate::metrics;
use crate::notification::cloud_event_for;
use crate::publisher::{topics, NotificationPublisher};
use crate::retry::RetryPolicy;

/// Object store decorator that emits storage notifications.
pub struct NotifyingObjectStore {
    inner: Arc<dyn ObjectStore>,
    notifier: Arc<dyn NotificationPublisher>,
    bucket: String,
    prefix: String,
    policy: RetryPolicy,
    last_generation: AtomicU64,
}

impl NotifyingObjectStore {
    pub fn new(
        inner: Arc<dyn ObjectStore>,
        notifier: Arc<dyn NotificationPublisher>,
        bucket: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner,
            notifier,
            bucket: bucket.into(),
            prefix: format!("{}/", JOBS_PREFIX),
            policy,
            last_generation: AtomicU64::new(0),
        }
    }

    /// Microsecond timestamp, strictly increasing within this process.
    fn next_generation(&self) -> u64 {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        match self
            .last_generation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            }) {
            Ok(last) | Err(last) => now.max(last + 1),
        }
    }

    async fn notify(&self, key: &str, content_type: &str, size: usize) -> StoreResult<()> {
        let change = ObjectChange {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            generation: self.next_generation(),
            content_type: content_type.to_string(),
            size,
            time: Utc::now(),
        };
        let body = serde_json::to_vec(&cloud_event_for(&change))?;
        let topic = topics::NOTIFICATIONS;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            metrics::record_publish_attempt(topic);

            let cause = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.notifier.publish_notification(topic, &body),
            )
            .await
            {
                Ok(Ok(message_id)) => {
                    debug!(key = %key, generation = change.generation, message_id = %message_id, "Queued storage notification");
                    return Ok(());
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}ms", self.policy.attempt_timeout.as_millis()),
            };

            if attempt > self.policy.max_retries {
                warn!(key = %key, attempts = attempt, error = %cause, "Storage notification retries exhausted");
                metrics::record_publish_failure(topic, "retry_exceeded");
                return Err(StoreError::backend(format!(
                    "notification for {} failed after {} attempts: {}",
                    key, attempt, cause
                )));
            }

            let delay = self.policy.delay_for_retry(attempt);
            warn!(key = %key, attempt, delay_ms = delay.as_millis() as u64, error = %cause, "Storage notification failed, retrying");
            metrics::record_retry(topic, delay.as_millis() as u64);
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ObjectStore for NotifyingObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> StoreResult<()> {
        let size = body.len();
        self.inner.put(key, body, content_type).await?;
        if key.starts_with(&self.prefix) {
            self.notify(key, content_type, size).await?;
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, body: Vec<u8>, content_type: &str) -> StoreResult<bool> {
        let size = body.len();
        let created = self.inner.put_if_absent(key, body, content_type).await?;
        if created && key.starts_with(&self.prefix) {
            self.notify(key, content_type, size).await?;
        }
        Ok(created)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.list(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tscribe_models::{Job, JobPatch, JobStatus, MediaSource};
    use tscribe_store::{InMemoryJobIndex, InMemoryObjectStore, JobStateStore, StoreConfig, CONTENT_TYPE_JSON};

    use crate::notification::decode_json;
    use crate::publisher::{InMemoryPublisher, Subscription};

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(2)
            .with_initial_delay(Duration::from_millis(10))
    }

    fn notifying(bus: Arc<InMemoryPublisher>) -> (Arc<InMemoryObjectStore>, NotifyingObjectStore) {
        let objects = Arc::new(InMemoryObjectStore::new("tscribe"));
        let store = NotifyingObjectStore::new(objects.clone(), bus, "tscribe", policy());
        (objects, store)
    }

    #[tokio::test]
    async fn test_create_emits_one_notification() {
        let bus = Arc::new(InMemoryPublisher::new());
        let subscription = bus.subscribe(topics::NOTIFICATIONS);
        let (_, objects) = notifying(bus.clone());
        let store = JobStateStore::new(Arc::new(objects), Arc::new(InMemoryJobIndex::new()), StoreConfig::default());

        let job = store
            .create(Job::new("req-1", MediaSource::youtube("abc")))
            .await
            .unwrap();

        let deliveries = subscription.receive(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(deliveries.len(), 1);

        let event = decode_json(&deliveries[0].payload).unwrap();
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.status, JobStatus::Queued);
        assert_eq!(event.source_object.bucket.as_deref(), Some("tscribe"));
    }

    #[tokio::test]
    async fn test_each_write_gets_distinct_event_id() {
        let bus = Arc::new(InMemoryPublisher::new());
        let (_, objects) = notifying(bus.clone());
        let store = JobStateStore::new(Arc::new(objects), Arc::new(InMemoryJobIndex::new()), StoreConfig::default());

        let job = store
            .create(Job::new("req-1", MediaSource::youtube("abc")))
            .await
            .unwrap();
        store
            .transition(&job.id, JobStatus::Queued, JobStatus::Cancelled, JobPatch::new())
            .await
            .unwrap();

        let events: Vec<_> = bus
            .notifications(topics::NOTIFICATIONS)
            .iter()
            .map(|body| decode_json(body).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].status, JobStatus::Cancelled);
        assert_ne!(events[0].event_id, events[1].event_id);
    }

    #[tokio::test]
    async fn test_only_new_job_objects_notify() {
        let bus = Arc::new(InMemoryPublisher::new());
        let (_, objects) = notifying(bus.clone());

        objects
            .put("transcripts/t.json", b"{}".to_vec(), CONTENT_TYPE_JSON)
            .await
            .unwrap();
        assert!(objects
            .put_if_absent("jobs/queued/x.json", b"{}".to_vec(), CONTENT_TYPE_JSON)
            .await
            .unwrap());
        assert!(!objects
            .put_if_absent("jobs/queued/x.json", b"{}".to_vec(), CONTENT_TYPE_JSON)
            .await
            .unwrap());

        assert_eq!(bus.notifications(topics::NOTIFICATIONS).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_notify_failure_retried() {
        let bus = Arc::new(InMemoryPublisher::new());
        bus.fail_next_publishes(2);
        let (_, objects) = notifying(bus.clone());

        tokio_test::assert_ok!(
            objects
                .put("jobs/queued/x.json", b"{}".to_vec(), CONTENT_TYPE_JSON)
                .await
        );
        assert_eq!(bus.notifications(topics::NOTIFICATIONS).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_notify_fails_write() {
        let bus = Arc::new(InMemoryPublisher::new());
        bus.fail_next_publishes(3);
        let (inner, objects) = notifying(bus.clone());

        let err = objects
            .put("jobs/queued/x.json", b"{}".to_vec(), CONTENT_TYPE_JSON)
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("3 attempts"));
        assert!(bus.notifications(topics::NOTIFICATIONS).is_empty());
        assert_eq!(inner.writes_under("jobs/"), 1);
    }
}
