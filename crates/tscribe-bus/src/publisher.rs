//! Publish/subscribe seams and the in-memory bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use tscribe_models::DomainEvent;

use crate::adapter::{self, RawMessage};
use crate::error::{BusError, BusResult};

/// Topic names used by the choreography.
pub mod topics {
    /// Storage notifications for `jobs/` writes.
    pub const NOTIFICATIONS: &str = "notifications";
    /// Work for the metadata worker.
    pub const METADATA: &str = "metadata";
    /// Work for the transcription worker.
    pub const TRANSCRIPTION: &str = "transcription";
    /// Lifecycle events for external consumers.
    pub const EVENTS: &str = "events";
}

/// Outbound half of the bus.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish to `topic`. Returns the bus-assigned message id.
    async fn publish(&self, topic: &str, message: &RawMessage) -> BusResult<String>;
}

/// Outbound half of the storage notification bridge.
///
/// Notifications travel as raw CloudEvents rather than push envelopes.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Append a CloudEvent body to `topic`. Returns the bus-assigned message id.
    async fn publish_notification(&self, topic: &str, cloud_event: &[u8]) -> BusResult<String>;
}

/// One message handed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub message_id: String,
    /// Request body: a push envelope, or a CloudEvent on the notifications topic
    pub payload: Vec<u8>,
    pub delivery_attempt: u32,
}

/// Inbound half of the bus.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn topic(&self) -> &str;

    /// Wait up to `wait` for at most `max` deliveries.
    async fn receive(&self, max: usize, wait: Duration) -> BusResult<Vec<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> BusResult<()>;

    /// Return the message for redelivery.
    async fn nack(&self, delivery: &Delivery) -> BusResult<()>;

    /// Park a message that can never be handled.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> BusResult<()>;
}

/// A message recorded by [`InMemoryPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub message_id: String,
    pub raw: RawMessage,
    pub published_at: DateTime<Utc>,
}

impl PublishedMessage {
    /// Decode the payload back into an event.
    pub fn event(&self) -> Option<DomainEvent> {
        serde_json::from_slice(&self.raw.data).ok()
    }
}

/// In-memory bus for tests and single-process runs.
///
/// Every published message is recorded; topics with a subscription also get
/// a push-envelope delivery.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    published: StdMutex<Vec<PublishedMessage>>,
    notifications: StdMutex<Vec<(String, Vec<u8>)>>,
    subscriptions: StdMutex<HashMap<String, Arc<InMemorySubscription>>>,
    next_id: AtomicU64,
    failing_publishes: AtomicUsize,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscription for `topic`, created on first use.
    pub fn subscribe(&self, topic: &str) -> Arc<InMemorySubscription> {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            subscriptions
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(InMemorySubscription::new(topic))),
        )
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Everything published to `topic`, in order.
    pub fn published(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .map(|published| {
                published
                    .iter()
                    .filter(|message| message.topic == topic)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Events published to `topic`, in order.
    pub fn events(&self, topic: &str) -> Vec<DomainEvent> {
        self.published(topic)
            .iter()
            .filter_map(PublishedMessage::event)
            .collect()
    }

    /// Raw CloudEvent bodies appended to `topic`, in order.
    pub fn notifications(&self, topic: &str) -> Vec<Vec<u8>> {
        self.notifications
            .lock()
            .map(|notifications| {
                notifications
                    .iter()
                    .filter(|(t, _)| t == topic)
                    .map(|(_, body)| body.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn subscription_for(&self, topic: &str) -> Option<Arc<InMemorySubscription>> {
        self.subscriptions
            .lock()
            .ok()
            .and_then(|subscriptions| subscriptions.get(topic).cloned())
    }
}

#[async_trait]
impl MessagePublisher for InMemoryPublisher {
    async fn publish(&self, topic: &str, message: &RawMessage) -> BusResult<String> {
        if self.take_injected_failure() {
            return Err(BusError::transport(format!("injected failure publishing to {}", topic)));
        }

        let message_id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let published_at = Utc::now();

        if let Ok(mut published) = self.published.lock() {
            published.push(PublishedMessage {
                topic: topic.to_string(),
                message_id: message_id.clone(),
                raw: message.clone(),
                published_at,
            });
        }

        if let Some(subscription) = self.subscription_for(topic) {
            let envelope = adapter::push_envelope(
                message,
                message_id.clone(),
                published_at,
                subscription.name(),
                1,
            );
            subscription.push_with_id(&message_id, serde_json::to_vec(&envelope)?);
        }

        debug!(topic = %topic, message_id = %message_id, "Published message");
        Ok(message_id)
    }
}

#[async_trait]
impl NotificationPublisher for InMemoryPublisher {
    async fn publish_notification(&self, topic: &str, cloud_event: &[u8]) -> BusResult<String> {
        if self.take_injected_failure() {
            return Err(BusError::transport(format!("injected failure notifying {}", topic)));
        }

        if let Ok(mut notifications) = self.notifications.lock() {
            notifications.push((topic.to_string(), cloud_event.to_vec()));
        }

        let message_id = match self.subscription_for(topic) {
            Some(subscription) => subscription.push(cloud_event.to_vec()),
            None => (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string(),
        };
        Ok(message_id)
    }
}

/// In-memory subscription with redelivery on nack.
#[derive(Debug)]
pub struct InMemorySubscription {
    topic: String,
    name: String,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Mutex<mpsc::UnboundedReceiver<Delivery>>,
    next_id: AtomicU64,
    acked: AtomicUsize,
    in_flight: AtomicUsize,
    dead_letters: StdMutex<Vec<(Delivery, String)>>,
}

impl InMemorySubscription {
    pub fn new(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: format!("{}-sub", topic),
            topic,
            sender,
            receiver: Mutex::new(receiver),
            next_id: AtomicU64::new(0),
            acked: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            dead_letters: StdMutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a raw payload. Returns its message id.
    pub fn push(&self, payload: Vec<u8>) -> String {
        let message_id = format!("{}-{}", self.topic, self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.push_with_id(&message_id, payload);
        message_id
    }

    /// Enqueue an exact copy of an earlier delivery, as a redelivering bus would.
    pub fn redeliver(&self, delivery: &Delivery) {
        self.enqueue(Delivery {
            delivery_attempt: delivery.delivery_attempt + 1,
            ..delivery.clone()
        });
    }

    fn push_with_id(&self, message_id: &str, payload: Vec<u8>) {
        self.enqueue(Delivery {
            topic: self.topic.clone(),
            message_id: message_id.to_string(),
            payload,
            delivery_attempt: 1,
        });
    }

    fn enqueue(&self, delivery: Delivery) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(delivery).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!(topic = %self.topic, "Subscription receiver closed");
        }
    }

    fn settle(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Messages enqueued or delivered but not yet settled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn dead_letters(&self) -> Vec<(Delivery, String)> {
        self.dead_letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn receive(&self, max: usize, wait: Duration) -> BusResult<Vec<Delivery>> {
        let mut receiver = self.receiver.lock().await;

        let first = match tokio::time::timeout(wait, receiver.recv()).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) | Err(_) => return Ok(Vec::new()),
        };

        let mut batch = vec![first];
        while batch.len() < max {
            match receiver.try_recv() {
                Ok(delivery) => batch.push(delivery),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    async fn ack(&self, _delivery: &Delivery) -> BusResult<()> {
        self.acked.fetch_add(1, Ordering::SeqCst);
        self.settle();
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> BusResult<()> {
        self.redeliver(delivery);
        self.settle();
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> BusResult<()> {
        if let Ok(mut letters) = self.dead_letters.lock() {
            letters.push((delivery.clone(), reason.to_string()));
        }
        self.settle();
        Ok(())
    }
}
