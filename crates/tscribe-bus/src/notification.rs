//! Storage notification decoding.
//!
//! Notifications arrive as CloudEvents for `object.finalized`. The object
//! name is decoded with the job path codec into a [`TransitionEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tscribe_models::{path, ObjectMetadata, TransitionEvent};
use tscribe_store::ObjectChange;

use crate::error::{CloudEventDecodeError, CloudEventErrorKind};

/// Event type emitted when an object write completes.
pub const OBJECT_FINALIZED: &str = "google.cloud.storage.object.v1.finalized";

/// Only CloudEvents 1.0 is accepted.
pub const SPEC_VERSION: &str = "1.0";

const SUBJECT_PREFIX: &str = "objects/";

/// CloudEvents 1.0 structured-mode envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub specversion: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ObjectMetadata>,
}

/// Decode a finalize notification into a transition request.
pub fn decode(event: &CloudEvent) -> Result<TransitionEvent, CloudEventDecodeError> {
    if event.id.trim().is_empty() {
        return Err(CloudEventDecodeError::new(
            None,
            CloudEventErrorKind::MissingField("id"),
        ));
    }
    let fail = |kind| CloudEventDecodeError::new(Some(event.id.clone()), kind);

    if event.specversion != SPEC_VERSION {
        return Err(fail(CloudEventErrorKind::UnsupportedSpecVersion(
            event.specversion.clone(),
        )));
    }
    if event.event_type != OBJECT_FINALIZED {
        return Err(fail(CloudEventErrorKind::UnsupportedType(
            event.event_type.clone(),
        )));
    }
    let event_time = event
        .time
        .ok_or_else(|| fail(CloudEventErrorKind::MissingField("time")))?;

    let object_path = object_path(event)
        .ok_or_else(|| fail(CloudEventErrorKind::MissingField("data.name")))?;
    let location = path::decode(&object_path).map_err(|e| fail(e.into()))?;

    let mut source_object = event.data.clone().unwrap_or_default();
    source_object.name = object_path;

    debug!(
        event_id = %event.id,
        job_id = %location.job_id,
        status = %location.status,
        "Decoded storage notification"
    );

    Ok(TransitionEvent {
        job_id: location.job_id,
        status: location.status,
        event_id: event.id.clone(),
        event_time,
        source_object,
    })
}

/// Decode a raw JSON notification.
pub fn decode_json(bytes: &[u8]) -> Result<TransitionEvent, CloudEventDecodeError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| CloudEventDecodeError::new(None, CloudEventErrorKind::Malformed(e.to_string())))?;

    let event_id = value
        .get("id")
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let event: CloudEvent = serde_json::from_value(value)
        .map_err(|e| CloudEventDecodeError::new(event_id, CloudEventErrorKind::Malformed(e.to_string())))?;

    decode(&event)
}

/// `data.name`, falling back to `subject` without its `objects/` prefix.
fn object_path(event: &CloudEvent) -> Option<String> {
    let from_data = event
        .data
        .as_ref()
        .map(|data| data.name.as_str())
        .filter(|name| !name.is_empty());

    let from_subject = || {
        event
            .subject
            .as_deref()
            .map(|subject| subject.strip_prefix(SUBJECT_PREFIX).unwrap_or(subject))
            .filter(|name| !name.is_empty())
    };

    from_data.or_else(from_subject).map(str::to_string)
}

/// Finalize notification for a completed object write.
pub fn cloud_event_for(change: &ObjectChange) -> CloudEvent {
    CloudEvent {
        // Object name plus generation identifies one write across writers
        id: format!("{}/{}#{}", change.bucket, change.key, change.generation),
        source: format!("//storage.googleapis.com/projects/_/buckets/{}", change.bucket),
        specversion: SPEC_VERSION.to_string(),
        event_type: OBJECT_FINALIZED.to_string(),
        subject: Some(format!("{}{}", SUBJECT_PREFIX, change.key)),
        time: Some(change.time),
        datacontenttype: Some("application/json".to_string()),
        data: Some(ObjectMetadata {
            name: change.key.clone(),
            bucket: Some(change.bucket.clone()),
            generation: Some(change.generation.to_string()),
            metageneration: Some("1".to_string()),
            content_type: Some(change.content_type.clone()),
            size: Some(change.size.to_string()),
            time_created: Some(change.time),
            updated: Some(change.time),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tscribe_models::{JobId, JobStatus, PathDecodeError};

    fn finalized(job_id: &JobId, status: JobStatus) -> serde_json::Value {
        json!({
            "id": "1234567890",
            "source": "//storage.googleapis.com/projects/_/buckets/jobs-bucket",
            "specversion": "1.0",
            "type": OBJECT_FINALIZED,
            "subject": format!("objects/{}", path::encode(job_id, status)),
            "time": "2024-05-01T12:00:00Z",
            "data": {
                "name": path::encode(job_id, status),
                "bucket": "jobs-bucket",
                "generation": "1714564800000000",
                "contentType": "application/json",
                "size": "512"
            }
        })
    }

    #[test]
    fn test_decode_finalized() {
        let job_id = JobId::new();
        let raw = finalized(&job_id, JobStatus::MetadataReady);

        let event = decode_json(raw.to_string().as_bytes()).unwrap();
        assert_eq!(event.job_id, job_id);
        assert_eq!(event.status, JobStatus::MetadataReady);
        assert_eq!(event.event_id, "1234567890");
        assert_eq!(event.source_object.bucket.as_deref(), Some("jobs-bucket"));
        assert_eq!(event.event_time.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_subject_fallback() {
        let job_id = JobId::new();
        let mut raw = finalized(&job_id, JobStatus::Failed);
        raw.as_object_mut().unwrap().remove("data");

        let event = decode_json(raw.to_string().as_bytes()).unwrap();
        assert_eq!(event.status, JobStatus::Failed);
        assert_eq!(event.source_object.name, path::encode(&job_id, JobStatus::Failed));
    }

    #[test]
    fn test_failures_carry_event_id() {
        let job_id = JobId::new();

        let mut wrong_type = finalized(&job_id, JobStatus::Queued);
        wrong_type["type"] = json!("google.cloud.storage.object.v1.deleted");
        let err = decode_json(wrong_type.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.event_id.as_deref(), Some("1234567890"));
        assert!(matches!(err.kind, CloudEventErrorKind::UnsupportedType(_)));

        let mut no_time = finalized(&job_id, JobStatus::Queued);
        no_time.as_object_mut().unwrap().remove("time");
        let err = decode_json(no_time.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err.kind, CloudEventErrorKind::MissingField("time")));

        let mut bad_version = finalized(&job_id, JobStatus::Queued);
        bad_version["specversion"] = json!("0.3");
        let err = decode_json(bad_version.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err.kind, CloudEventErrorKind::UnsupportedSpecVersion(_)));

        // Structurally broken but id readable
        let mut bad_time = finalized(&job_id, JobStatus::Queued);
        bad_time["time"] = json!("yesterday");
        let err = decode_json(bad_time.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.event_id.as_deref(), Some("1234567890"));
        assert!(matches!(err.kind, CloudEventErrorKind::Malformed(_)));
    }

    #[test]
    fn test_bad_paths_are_decode_errors() {
        let job_id = JobId::new();
        for name in [
            "jobs/archived/x.json".to_string(),
            format!("jobs/queued/{}.txt", job_id),
            "jobs/queued/.json".to_string(),
            format!("jobs/queued/extra/{}.json", job_id),
        ] {
            let mut raw = finalized(&job_id, JobStatus::Queued);
            raw["data"]["name"] = json!(name);
            let err = decode_json(raw.to_string().as_bytes()).unwrap_err();
            assert!(matches!(err.kind, CloudEventErrorKind::Path(_)), "{name}");
            assert!(!err.is_foreign_object());
        }

        let mut transcript = finalized(&job_id, JobStatus::Queued);
        transcript["data"]["name"] = json!("transcripts/t.json");
        let err = decode_json(transcript.to_string().as_bytes()).unwrap_err();
        assert!(err.is_foreign_object());
    }

    #[test]
    fn test_missing_id_and_garbage() {
        let err = decode_json(b"not json").unwrap_err();
        assert!(err.event_id.is_none());

        let mut raw = finalized(&JobId::new(), JobStatus::Queued);
        raw["id"] = json!("");
        let err = decode_json(raw.to_string().as_bytes()).unwrap_err();
        assert!(err.event_id.is_none());
        assert!(matches!(err.kind, CloudEventErrorKind::MissingField("id")));
    }

    #[test]
    fn test_cloud_event_for_change() {
        let job_id = JobId::new();
        let change = ObjectChange {
            bucket: "local".to_string(),
            key: path::encode(&job_id, JobStatus::Processing),
            generation: 7,
            content_type: "application/json".to_string(),
            size: 100,
            time: Utc::now(),
        };

        let event = decode(&cloud_event_for(&change)).unwrap();
        assert_eq!(event.job_id, job_id);
        assert_eq!(event.status, JobStatus::Processing);
        assert_eq!(event.event_id, format!("local/{}#7", change.key));
        assert_eq!(event.source_object.generation.as_deref(), Some("7"));
    }

    #[test]
    fn test_path_error_is_typed() {
        let mut raw = finalized(&JobId::new(), JobStatus::Queued);
        raw["data"]["name"] = json!("jobs/queued/not-a-uuid.json");
        let err = decode_json(raw.to_string().as_bytes()).unwrap_err();
        assert!(matches!(
            err.kind,
            CloudEventErrorKind::Path(PathDecodeError::InvalidJobId { .. })
        ));
    }
}
