//! Redis-backed job index.
//!
//! Entries are stored as JSON strings; compare-and-swap runs as a Lua
//! script so the read-compare-write is atomic on the server.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::debug;

use tscribe_models::JobId;

use crate::error::{StoreError, StoreResult};
use crate::index::{IndexEntry, JobIndex};

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

const DELETE_IF_EQUAL_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

// Returns the existing owner, or nil after binding the key
const RESERVE_SCRIPT: &str = r#"
local owner = redis.call('GET', KEYS[1])
if owner then
    return owner
end
redis.call('SET', KEYS[1], ARGV[1])
return false
"#;

/// Job index stored in Redis.
#[derive(Clone)]
pub struct RedisJobIndex {
    conn: MultiplexedConnection,
    key_prefix: String,
    cas: Script,
    delete_if_equal: Script,
    reserve: Script,
}

impl RedisJobIndex {
    /// Connect and build the index.
    pub async fn connect(redis_url: &str, key_prefix: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
            cas: Script::new(CAS_SCRIPT),
            delete_if_equal: Script::new(DELETE_IF_EQUAL_SCRIPT),
            reserve: Script::new(RESERVE_SCRIPT),
        })
    }

    /// Connect using `REDIS_URL` and `TSCRIBE_INDEX_PREFIX`.
    pub async fn from_env() -> StoreResult<Self> {
        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| StoreError::config_error("REDIS_URL not set"))?;
        let prefix =
            std::env::var("TSCRIBE_INDEX_PREFIX").unwrap_or_else(|_| "tscribe".to_string());
        Self::connect(&redis_url, prefix).await
    }

    fn entry_key(&self, job_id: &JobId) -> String {
        format!("{}:index:{}", self.key_prefix, job_id)
    }

    fn idempotency_key(&self, key: &str) -> String {
        format!("{}:idem:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl JobIndex for RedisJobIndex {
    async fn get(&self, job_id: &JobId) -> StoreResult<Option<IndexEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.entry_key(job_id)).await?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn insert(&self, job_id: &JobId, entry: &IndexEntry) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(entry)?;
        let inserted: bool = conn.set_nx(self.entry_key(job_id), payload).await?;
        Ok(inserted)
    }

    async fn compare_and_swap(
        &self,
        job_id: &JobId,
        expected: &IndexEntry,
        new: &IndexEntry,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let swapped: i32 = self
            .cas
            .key(self.entry_key(job_id))
            .arg(serde_json::to_string(expected)?)
            .arg(serde_json::to_string(new)?)
            .invoke_async(&mut conn)
            .await?;

        debug!(job_id = %job_id, swapped = swapped == 1, "Index compare-and-swap");
        Ok(swapped == 1)
    }

    async fn remove(&self, job_id: &JobId, expected: &IndexEntry) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i32 = self
            .delete_if_equal
            .key(self.entry_key(job_id))
            .arg(serde_json::to_string(expected)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn reserve_key(&self, key: &str, job_id: &JobId) -> StoreResult<Option<JobId>> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = self
            .reserve
            .key(self.idempotency_key(key))
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await?;

        match owner {
            None => Ok(None),
            Some(id) => JobId::parse(&id)
                .map(Some)
                .map_err(|e| StoreError::backend(format!("idempotency key {} bound to {}", key, e))),
        }
    }

    async fn release_key(&self, key: &str, job_id: &JobId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i32 = self
            .delete_if_equal
            .key(self.idempotency_key(key))
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
