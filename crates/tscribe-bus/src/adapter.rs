//! Push payload <-> domain event conversion.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use schemars::schema::RootSchema;
use serde::{Deserialize, Serialize};

use tscribe_models::DomainEvent;

use crate::error::{MessageDecodingError, MessageEncodingError};

/// Attribute carrying the event variant name.
pub const ATTR_EVENT_TYPE: &str = "event_type";
/// Attribute carrying the job id.
pub const ATTR_JOB_ID: &str = "job_id";

/// Push subscription request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Base64-encoded event JSON
    pub data: String,
    pub message_id: String,
    pub publish_time: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_attempt: Option<u32>,
}

/// Wire form of an outbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub data: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
}

/// Where and how a message was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub message_id: String,
    pub publish_time: DateTime<Utc>,
    /// 1 on first delivery
    pub delivery_attempt: u32,
    pub attributes: BTreeMap<String, String>,
    pub subscription: String,
}

/// A decoded domain event with its delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMessage {
    pub event: DomainEvent,
    pub delivery: DeliveryInfo,
}

/// Decode and validate a push delivery.
pub fn to_domain_event(push: &PushEnvelope) -> Result<DomainMessage, MessageDecodingError> {
    let message = &push.message;
    let message_id = message.message_id.clone();

    let bytes = STANDARD
        .decode(message.data.as_bytes())
        .map_err(|e| MessageDecodingError::InvalidBase64 {
            message_id: message_id.clone(),
            reason: e.to_string(),
        })?;

    let event: DomainEvent =
        serde_json::from_slice(&bytes).map_err(|e| MessageDecodingError::Schema {
            message_id: message_id.clone(),
            reason: e.to_string(),
        })?;

    event
        .validate()
        .map_err(|source| MessageDecodingError::Invalid {
            message_id: message_id.clone(),
            source,
        })?;

    check_attribute(message, ATTR_EVENT_TYPE, event.event_type())?;
    check_attribute(message, ATTR_JOB_ID, event.job_id().as_str())?;

    Ok(DomainMessage {
        delivery: DeliveryInfo {
            message_id,
            publish_time: message.publish_time,
            delivery_attempt: message.delivery_attempt.unwrap_or(1),
            attributes: message.attributes.clone(),
            subscription: push.subscription.clone(),
        },
        event,
    })
}

/// Parse a push request body and decode its event.
pub fn decode_push_json(bytes: &[u8]) -> Result<DomainMessage, MessageDecodingError> {
    let envelope: PushEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| MessageDecodingError::Envelope(e.to_string()))?;
    to_domain_event(&envelope)
}

/// Serialize an event for publishing.
///
/// Equal events produce byte-identical data and attributes.
pub fn to_push_payload(event: &DomainEvent) -> Result<RawMessage, MessageEncodingError> {
    event.validate()?;

    let data = serde_json::to_vec(event)?;
    let attributes = BTreeMap::from([
        (ATTR_EVENT_TYPE.to_string(), event.event_type().to_string()),
        (ATTR_JOB_ID.to_string(), event.job_id().to_string()),
    ]);

    Ok(RawMessage { data, attributes })
}

/// Wrap a raw message the way a push subscription delivers it.
pub fn push_envelope(
    raw: &RawMessage,
    message_id: impl Into<String>,
    publish_time: DateTime<Utc>,
    subscription: impl Into<String>,
    delivery_attempt: u32,
) -> PushEnvelope {
    PushEnvelope {
        message: PushMessage {
            data: STANDARD.encode(&raw.data),
            message_id: message_id.into(),
            publish_time,
            attributes: raw.attributes.clone(),
            delivery_attempt: Some(delivery_attempt),
        },
        subscription: subscription.into(),
    }
}

/// JSON schema of the event payload.
pub fn event_schema() -> RootSchema {
    schemars::schema_for!(DomainEvent)
}

// Attributes are optional; when present they must agree with the payload.
fn check_attribute(
    message: &PushMessage,
    attribute: &'static str,
    expected: &str,
) -> Result<(), MessageDecodingError> {
    match message.attributes.get(attribute) {
        Some(found) if found != expected => Err(MessageDecodingError::AttributeMismatch {
            message_id: message.message_id.clone(),
            attribute,
            expected: expected.to_string(),
            found: found.clone(),
        }),
        _ => Ok(()),
    }
}
