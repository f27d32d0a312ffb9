//! Media source references and resolved media metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Where the content to transcribe lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaSource {
    /// A YouTube video
    #[serde(rename = "youtube")]
    YouTube { video_id: String, url: String },
    /// Any HTTP(S) URL
    RemoteUrl { url: String },
    /// An object in a bucket we can read
    StoredObject { bucket: String, key: String },
}

impl MediaSource {
    pub fn youtube(video_id: impl Into<String>) -> Self {
        let video_id = video_id.into();
        let url = format!("https://www.youtube.com/watch?v={}", video_id);
        Self::YouTube { video_id, url }
    }

    pub fn remote_url(url: impl Into<String>) -> Self {
        Self::RemoteUrl { url: url.into() }
    }

    pub fn stored_object(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::StoredObject {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Variant tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            MediaSource::YouTube { .. } => "youtube",
            MediaSource::RemoteUrl { .. } => "remote_url",
            MediaSource::StoredObject { .. } => "stored_object",
        }
    }
}

/// Structured metadata returned by the media resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MediaMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Detected or declared language
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Provider-specific fields, kept ordered for stable serialization
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}
