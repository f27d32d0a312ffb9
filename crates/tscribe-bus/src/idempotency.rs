//! At-most-once application of effects under at-least-once delivery.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{GuardError, GuardResult};
use crate::metrics;

/// Proof that a key was first seen by this claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub first_seen_at: DateTime<Utc>,
}

/// Successful claim on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimed {
    pub record: IdempotencyRecord,
}

#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// `true` if no live record exists for `key`.
    async fn should_process(&self, key: &str) -> GuardResult<bool>;

    /// Record `key`. Returns the record that wins, which may predate this call.
    async fn mark_processed(&self, key: &str) -> GuardResult<IdempotencyRecord>;

    /// Check and record atomically. Exactly one concurrent claimer wins.
    async fn claim(&self, key: &str) -> GuardResult<Claimed>;

    /// Drop a claim whose effect failed, so a redelivery can retry it.
    async fn release(&self, key: &str) -> GuardResult<()>;
}

/// Record count at which new claims first sweep out expired records.
const DEFAULT_SWEEP_THRESHOLD: usize = 4096;

/// Process-local guard.
#[derive(Debug)]
pub struct InMemoryIdempotencyGuard {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    retention: Duration,
    sweep_threshold: usize,
}

impl InMemoryIdempotencyGuard {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            retention,
            sweep_threshold: DEFAULT_SWEEP_THRESHOLD,
        }
    }

    pub fn with_sweep_threshold(mut self, threshold: usize) -> Self {
        self.sweep_threshold = threshold.max(1);
        self
    }

    /// Drop records older than the retention window. Returns how many.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        self.sweep(&mut records, now)
    }

    fn sweep(&self, records: &mut HashMap<String, IdempotencyRecord>, now: DateTime<Utc>) -> usize {
        let before = records.len();
        records.retain(|_, record| !self.is_expired(record, now));
        let purged = before - records.len();
        if purged > 0 {
            info!(purged, "Purged expired idempotency records");
        }
        purged
    }

    /// Make room before inserting once the map has grown past the threshold.
    fn sweep_if_full(&self, records: &mut HashMap<String, IdempotencyRecord>, now: DateTime<Utc>) {
        if records.len() >= self.sweep_threshold {
            self.sweep(records, now);
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    fn is_expired(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.retention) {
            Ok(retention) => record.first_seen_at + retention <= now,
            Err(_) => false,
        }
    }

    fn live<'a>(
        &self,
        records: &'a HashMap<String, IdempotencyRecord>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a IdempotencyRecord> {
        records.get(key).filter(|record| !self.is_expired(record, now))
    }
}

impl Default for InMemoryIdempotencyGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 3600))
    }
}

#[async_trait]
impl IdempotencyGuard for InMemoryIdempotencyGuard {
    async fn should_process(&self, key: &str) -> GuardResult<bool> {
        let records = self.records.lock().await;
        Ok(self.live(&records, key, Utc::now()).is_none())
    }

    async fn mark_processed(&self, key: &str) -> GuardResult<IdempotencyRecord> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        if let Some(existing) = self.live(&records, key, now) {
            return Ok(existing.clone());
        }

        self.sweep_if_full(&mut records, now);
        let record = IdempotencyRecord {
            key: key.to_string(),
            first_seen_at: now,
        };
        records.insert(key.to_string(), record.clone());
        Ok(record)
    }

    async fn claim(&self, key: &str) -> GuardResult<Claimed> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        if let Some(existing) = self.live(&records, key, now) {
            debug!(key = %key, "Duplicate suppressed");
            metrics::record_duplicate();
            return Err(GuardError::AlreadyClaimed {
                key: key.to_string(),
                first_seen_at: existing.first_seen_at,
            });
        }

        self.sweep_if_full(&mut records, now);
        let record = IdempotencyRecord {
            key: key.to_string(),
            first_seen_at: now,
        };
        records.insert(key.to_string(), record.clone());
        Ok(Claimed { record })
    }

    async fn release(&self, key: &str) -> GuardResult<()> {
        self.records.lock().await.remove(key);
        Ok(())
    }
}

/// Redis guard: one `SET NX EX` key per record, expired by Redis.
#[derive(Clone)]
pub struct RedisIdempotencyGuard {
    conn: MultiplexedConnection,
    key_prefix: String,
    retention: Duration,
}

impl RedisIdempotencyGuard {
    pub async fn connect(
        redis_url: &str,
        key_prefix: impl Into<String>,
        retention: Duration,
    ) -> GuardResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
            retention,
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:dedup:{}", self.key_prefix, key)
    }

    async fn set_if_absent(&self, key: &str, record: &IdempotencyRecord) -> GuardResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(record.first_seen_at.to_rfc3339())
            .arg("NX")
            .arg("EX")
            .arg(self.retention.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn first_seen(&self, key: &str) -> GuardResult<Option<DateTime<Utc>>> {
        let mut conn = self.conn.clone();
        let stored: Option<String> = redis::cmd("GET")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await?;

        stored
            .map(|value| {
                DateTime::parse_from_rfc3339(&value)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| GuardError::backend(format!("bad record for {}: {}", key, e)))
            })
            .transpose()
    }
}

#[async_trait]
impl IdempotencyGuard for RedisIdempotencyGuard {
    async fn should_process(&self, key: &str) -> GuardResult<bool> {
        Ok(self.first_seen(key).await?.is_none())
    }

    async fn mark_processed(&self, key: &str) -> GuardResult<IdempotencyRecord> {
        match self.claim(key).await {
            Ok(claimed) => Ok(claimed.record),
            Err(GuardError::AlreadyClaimed { key, first_seen_at }) => {
                Ok(IdempotencyRecord { key, first_seen_at })
            }
            Err(e) => Err(e),
        }
    }

    async fn claim(&self, key: &str) -> GuardResult<Claimed> {
        let record = IdempotencyRecord {
            key: key.to_string(),
            first_seen_at: Utc::now(),
        };

        if self.set_if_absent(key, &record).await? {
            return Ok(Claimed { record });
        }

        debug!(key = %key, "Duplicate suppressed");
        metrics::record_duplicate();
        // Expired between SET and GET; report the attempt time
        let first_seen_at = self.first_seen(key).await?.unwrap_or(record.first_seen_at);
        Err(GuardError::AlreadyClaimed {
            key: key.to_string(),
            first_seen_at,
        })
    }

    async fn release(&self, key: &str) -> GuardResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.redis_key(key))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let guard = Arc::new(InMemoryIdempotencyGuard::default());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = Arc::clone(&guard);
            handles.push(tokio::spawn(async move { guard.claim("evt-1").await }));
        }

        let mut claimed = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => claimed += 1,
                Err(e) if e.is_already_claimed() => duplicates += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(duplicates, 15);
    }

    #[tokio::test]
    async fn test_should_process_and_mark() {
        let guard = InMemoryIdempotencyGuard::default();
        assert!(guard.should_process("k").await.unwrap());

        let first = guard.mark_processed("k").await.unwrap();
        assert!(!guard.should_process("k").await.unwrap());

        // Records are never rewritten
        let second = guard.mark_processed("k").await.unwrap();
        assert_eq!(first, second);

        match guard.claim("k").await {
            Err(GuardError::AlreadyClaimed { first_seen_at, .. }) => {
                assert_eq!(first_seen_at, first.first_seen_at)
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_release_allows_retry() {
        let guard = InMemoryIdempotencyGuard::default();
        assert_ok!(guard.claim("k").await);
        assert_err!(guard.claim("k").await);
        assert_ok!(guard.release("k").await);
        assert_ok!(guard.claim("k").await);
    }

    #[tokio::test]
    async fn test_retention_purge() {
        let guard = InMemoryIdempotencyGuard::new(Duration::from_secs(60));
        guard.claim("old").await.unwrap();
        guard.claim("new").await.unwrap();

        assert_eq!(guard.purge_expired(Utc::now()).await, 0);

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(guard.purge_expired(later).await, 2);
        assert!(guard.is_empty().await);
    }

    #[tokio::test]
    async fn test_claims_sweep_expired_records() {
        let guard = InMemoryIdempotencyGuard::new(Duration::ZERO).with_sweep_threshold(2);
        guard.claim("a").await.unwrap();
        guard.claim("b").await.unwrap();
        assert_eq!(guard.len().await, 2);

        guard.claim("c").await.unwrap();
        assert_eq!(guard.len().await, 1);

        guard.mark_processed("d").await.unwrap();
        assert_eq!(guard.len().await, 2);
    }
}
