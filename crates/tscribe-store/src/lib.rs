//! Job state store for the tscribe choreography.
//!
//! This crate provides:
//! - Object store backends (in-memory and Cloudflare R2)
//! - The job index (in-memory and Redis) with compare-and-swap
//! - [`JobStateStore`]: status-partitioned snapshots with validated transitions
//! - [`ArtifactStore`]: create-only transcripts and LLM execution records

pub mod artifacts;
pub mod error;
pub mod index;
pub mod object;
pub mod r2;
pub mod redis_index;
pub mod store;

pub use artifacts::ArtifactStore;
pub use error::{StoreError, StoreResult};
pub use index::{InMemoryJobIndex, IndexEntry, JobIndex};
pub use object::{InMemoryObjectStore, ObjectChange, ObjectStore, CONTENT_TYPE_JSON};
pub use r2::{R2Config, R2ObjectStore};
pub use redis_index::RedisJobIndex;
pub use store::{JobStateStore, StoreConfig};
