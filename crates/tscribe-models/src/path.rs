//! Job snapshot paths.
//!
//! A job's identity and status are encoded together as
//! `jobs/<status>/<job_id>.json`. Both the store (writer) and the
//! notification decoder (reader) go through [`encode`] and [`decode`].

use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Top-level prefix for job snapshots.
pub const JOBS_PREFIX: &str = "jobs";

/// Snapshot object suffix.
pub const SNAPSHOT_SUFFIX: &str = ".json";

/// Identity and status recovered from a snapshot path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobLocation {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Path that is not a job snapshot location.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathDecodeError {
    #[error("path {path:?} has {segments} segments, expected 3")]
    SegmentCount { path: String, segments: usize },

    #[error("path {path:?} is outside the jobs/ prefix")]
    WrongPrefix { path: String },

    #[error("unknown status segment {token:?}")]
    UnknownStatus { token: String },

    #[error("path {path:?} does not end in .json")]
    MissingSuffix { path: String },

    #[error("invalid job id segment {value:?}")]
    InvalidJobId { value: String },
}

/// Snapshot path for a job in a given status.
pub fn encode(job_id: &JobId, status: JobStatus) -> String {
    format!(
        "{}/{}/{}{}",
        JOBS_PREFIX,
        status.as_str(),
        job_id.as_str(),
        SNAPSHOT_SUFFIX
    )
}

/// Decode an untrusted path.
pub fn decode(path: &str) -> Result<JobLocation, PathDecodeError> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() != 3 {
        return Err(PathDecodeError::SegmentCount {
            path: path.to_string(),
            segments: segments.len(),
        });
    }

    if segments[0] != JOBS_PREFIX {
        return Err(PathDecodeError::WrongPrefix {
            path: path.to_string(),
        });
    }

    let status = JobStatus::from_token(segments[1]).ok_or_else(|| PathDecodeError::UnknownStatus {
        token: segments[1].to_string(),
    })?;

    let id = segments[2]
        .strip_suffix(SNAPSHOT_SUFFIX)
        .ok_or_else(|| PathDecodeError::MissingSuffix {
            path: path.to_string(),
        })?;

    let job_id = JobId::parse(id).map_err(|_| PathDecodeError::InvalidJobId {
        value: id.to_string(),
    })?;

    Ok(JobLocation { job_id, status })
}
