//! Redis Streams bus backend.
//!
//! Each topic is a stream `<prefix>:<topic>` read through a consumer group.
//! Unacknowledged entries stay pending and are reclaimed once idle.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tracing::{debug, info, warn};

use crate::adapter::{PushEnvelope, PushMessage, RawMessage};
use crate::error::{BusError, BusResult};
use crate::publisher::{Delivery, MessagePublisher, NotificationPublisher, Subscription};

/// Field holding a raw CloudEvent, written by the storage notification bridge.
pub const FIELD_EVENT: &str = "event";
const FIELD_DATA: &str = "data";
const FIELD_ATTRIBUTES: &str = "attributes";

/// Stream bus configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub redis_url: String,
    pub stream_prefix: String,
    pub consumer_group: String,
    pub consumer_name: String,
    /// Pending entries idle this long are reclaimed
    pub claim_idle: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_prefix: "tscribe".to_string(),
            consumer_group: "tscribe:workers".to_string(),
            consumer_name: format!("worker-{}", std::process::id()),
            claim_idle: Duration::from_secs(300),
        }
    }
}

impl StreamConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_prefix: std::env::var("TSCRIBE_STREAM_PREFIX").unwrap_or(defaults.stream_prefix),
            consumer_group: std::env::var("TSCRIBE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            consumer_name: std::env::var("TSCRIBE_CONSUMER_NAME").unwrap_or(defaults.consumer_name),
            claim_idle: std::env::var("TSCRIBE_CLAIM_IDLE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_idle),
        }
    }
}

/// Publisher over Redis Streams; also hands out subscriptions.
#[derive(Clone)]
pub struct RedisStreamBus {
    client: redis::Client,
    conn: MultiplexedConnection,
    config: StreamConfig,
}

impl RedisStreamBus {
    pub async fn connect(config: StreamConfig) -> BusResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            conn,
            config,
        })
    }

    pub fn stream_name(&self, topic: &str) -> String {
        format!("{}:{}", self.config.stream_prefix, topic)
    }

    /// Subscribe to `topic`, creating the consumer group if needed.
    ///
    /// Blocking reads get their own connection so they do not stall publishes.
    pub async fn subscribe(&self, topic: &str) -> BusResult<RedisSubscription> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let stream = self.stream_name(topic);

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group {} on {}", self.config.consumer_group, stream),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists on {}", stream);
            }
            Err(e) => return Err(BusError::Redis(e)),
        }

        Ok(RedisSubscription {
            topic: topic.to_string(),
            stream,
            group: self.config.consumer_group.clone(),
            consumer: self.config.consumer_name.clone(),
            claim_idle: self.config.claim_idle,
            conn,
        })
    }

}

#[async_trait]
impl NotificationPublisher for RedisStreamBus {
    /// Stored under the `event` field; subscribers hand it over untouched.
    async fn publish_notification(&self, topic: &str, cloud_event: &[u8]) -> BusResult<String> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(self.stream_name(topic))
            .arg("*")
            .arg(FIELD_EVENT)
            .arg(cloud_event)
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl MessagePublisher for RedisStreamBus {
    async fn publish(&self, topic: &str, message: &RawMessage) -> BusResult<String> {
        let mut conn = self.conn.clone();
        let attributes = serde_json::to_string(&message.attributes)?;

        let message_id: String = redis::cmd("XADD")
            .arg(self.stream_name(topic))
            .arg("*")
            .arg(FIELD_DATA)
            .arg(STANDARD.encode(&message.data))
            .arg(FIELD_ATTRIBUTES)
            .arg(attributes)
            .query_async(&mut conn)
            .await?;

        debug!(topic = %topic, message_id = %message_id, "Published to stream");
        Ok(message_id)
    }
}

/// Consumer-group reader for one topic.
pub struct RedisSubscription {
    topic: String,
    stream: String,
    group: String,
    consumer: String,
    claim_idle: Duration,
    conn: MultiplexedConnection,
}

impl RedisSubscription {
    /// Take over entries another consumer left pending for too long.
    async fn claim_pending(&self, max: usize) -> BusResult<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let idle_ms = self.claim_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let attempts: BTreeMap<String, u32> = pending
            .ids
            .iter()
            .map(|p| (p.id.clone(), p.times_delivered as u32 + 1))
            .collect();

        let mut claim = redis::cmd("XCLAIM");
        claim
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(idle_ms);
        for id in attempts.keys() {
            claim.arg(id);
        }
        let claimed: StreamClaimReply = claim.query_async(&mut conn).await?;

        let mut deliveries = Vec::new();
        for entry in claimed.ids {
            let attempt = attempts.get(&entry.id).copied().unwrap_or(2);
            info!(topic = %self.topic, message_id = %entry.id, attempt, "Reclaimed pending message");
            if let Some(delivery) = self.to_delivery(&entry, attempt).await? {
                deliveries.push(delivery);
            }
        }
        Ok(deliveries)
    }

    async fn to_delivery(&self, entry: &StreamId, attempt: u32) -> BusResult<Option<Delivery>> {
        let payload = if let Some(event) = entry.get::<Vec<u8>>(FIELD_EVENT) {
            event
        } else if let Some(data) = entry.get::<String>(FIELD_DATA) {
            let attributes = entry
                .get::<String>(FIELD_ATTRIBUTES)
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?
                .unwrap_or_default();
            let envelope = PushEnvelope {
                message: PushMessage {
                    data,
                    message_id: entry.id.clone(),
                    publish_time: publish_time(&entry.id),
                    attributes,
                    delivery_attempt: Some(attempt),
                },
                subscription: self.group.clone(),
            };
            serde_json::to_vec(&envelope)?
        } else {
            warn!(topic = %self.topic, message_id = %entry.id, "Stream entry has no payload, dropping");
            self.ack_id(&entry.id).await?;
            return Ok(None);
        };

        Ok(Some(Delivery {
            topic: self.topic.clone(),
            message_id: entry.id.clone(),
            payload,
            delivery_attempt: attempt,
        }))
    }

    async fn ack_id(&self, message_id: &str) -> BusResult<()> {
        let mut conn = self.conn.clone();

        redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.stream)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn receive(&self, max: usize, wait: Duration) -> BusResult<Vec<Delivery>> {
        let mut deliveries = self.claim_pending(max).await?;
        if deliveries.len() >= max {
            return Ok(deliveries);
        }

        let mut conn = self.conn.clone();
        // BLOCK 0 would wait forever
        let block_ms = (wait.as_millis() as u64).max(1);
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(max - deliveries.len())
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                if let Some(delivery) = self.to_delivery(&entry, 1).await? {
                    deliveries.push(delivery);
                }
            }
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> BusResult<()> {
        self.ack_id(&delivery.message_id).await?;
        debug!(topic = %self.topic, message_id = %delivery.message_id, "Acknowledged");
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> BusResult<()> {
        // Left pending; reclaimed after the idle window
        debug!(topic = %self.topic, message_id = %delivery.message_id, "Left pending for redelivery");
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> BusResult<()> {
        let mut conn = self.conn.clone();

        redis::cmd("XADD")
            .arg(format!("{}:dlq", self.stream))
            .arg("*")
            .arg("payload")
            .arg(delivery.payload.as_slice())
            .arg("error")
            .arg(reason)
            .arg("original_id")
            .arg(&delivery.message_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack_id(&delivery.message_id).await?;
        warn!(topic = %self.topic, message_id = %delivery.message_id, reason = %reason, "Moved message to DLQ");
        Ok(())
    }
}

/// Stream ids start with the append time in milliseconds.
fn publish_time(stream_id: &str) -> DateTime<Utc> {
    stream_id
        .split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_time_from_stream_id() {
        let time = publish_time("1714564800000-0");
        assert_eq!(time.timestamp_millis(), 1_714_564_800_000);
    }

    #[test]
    fn test_config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.stream_prefix, "tscribe");
        assert_eq!(config.claim_idle, Duration::from_secs(300));
    }
}
