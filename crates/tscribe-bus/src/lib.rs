//! Bus plumbing for the tscribe choreography.
//!
//! This crate provides:
//! - Storage notification decoding into transition events
//! - An object store decorator that emits those notifications
//! - Push payload <-> domain event conversion
//! - Idempotency guards (in-memory and Redis)
//! - Publishers and subscriptions (in-memory and Redis Streams)
//! - Publish retry with exponential backoff

pub mod adapter;
pub mod bridge;
pub mod error;
pub mod idempotency;
pub mod metrics;
pub mod notification;
pub mod publisher;
pub mod redis_stream;
pub mod retry;

pub use adapter::{
    decode_push_json, to_domain_event, to_push_payload, DeliveryInfo, DomainMessage, PushEnvelope,
    PushMessage, RawMessage,
};
pub use bridge::NotifyingObjectStore;
pub use error::{
    BusError, BusResult, CloudEventDecodeError, CloudEventErrorKind, GuardError, GuardResult,
    MessageDecodingError, MessageEncodingError, PublishError, PublishFailure,
};
pub use idempotency::{
    Claimed, IdempotencyGuard, IdempotencyRecord, InMemoryIdempotencyGuard, RedisIdempotencyGuard,
};
pub use notification::{cloud_event_for, CloudEvent};
pub use publisher::{
    topics, Delivery, InMemoryPublisher, InMemorySubscription, MessagePublisher,
    NotificationPublisher, PublishedMessage, Subscription,
};
pub use redis_stream::{RedisStreamBus, RedisSubscription, StreamConfig};
pub use retry::{PublishReceipt, RetryPolicy, RetryingPublisher};
