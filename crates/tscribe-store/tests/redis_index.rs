//! Redis job index integration tests.

use std::sync::Arc;

use tscribe_models::{JobId, JobPatch, JobStatus, MediaSource};
use tscribe_store::{
    InMemoryObjectStore, IndexEntry, JobIndex, JobStateStore, RedisJobIndex, StoreConfig,
};

async fn connect() -> RedisJobIndex {
    dotenvy::dotenv().ok();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let prefix = format!("tscribe-test-{}", JobId::new());
    RedisJobIndex::connect(&url, prefix)
        .await
        .expect("Failed to connect to Redis")
}

/// Compare-and-swap only succeeds against the stored entry.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_compare_and_swap() {
    let index = connect().await;
    let job = tscribe_models::Job::new("req", MediaSource::remote_url("https://example.com/a.mp3"));
    let entry = IndexEntry::for_job(&job, None);

    assert!(index.insert(&job.id, &entry).await.unwrap());
    assert!(!index.insert(&job.id, &entry).await.unwrap());

    let mut next = entry.clone();
    next.revision = 1;
    assert!(index.compare_and_swap(&job.id, &entry, &next).await.unwrap());
    assert!(!index.compare_and_swap(&job.id, &entry, &next).await.unwrap());
    assert_eq!(index.get(&job.id).await.unwrap(), Some(next.clone()));

    assert!(index.remove(&job.id, &next).await.unwrap());
    assert_eq!(index.get(&job.id).await.unwrap(), None);
}

/// Idempotency keys bind once and release only for their owner.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_reserve_key() {
    let index = connect().await;
    let owner = JobId::new();
    let other = JobId::new();

    assert_eq!(index.reserve_key("k", &owner).await.unwrap(), None);
    assert_eq!(index.reserve_key("k", &other).await.unwrap(), Some(owner.clone()));

    index.release_key("k", &other).await.unwrap();
    assert_eq!(index.reserve_key("k", &other).await.unwrap(), Some(owner.clone()));

    index.release_key("k", &owner).await.unwrap();
    assert_eq!(index.reserve_key("k", &other).await.unwrap(), None);
}

/// Full lifecycle with the index in Redis.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_store_over_redis_index() {
    let store = JobStateStore::new(
        Arc::new(InMemoryObjectStore::default()),
        Arc::new(connect().await),
        StoreConfig::default(),
    );

    let job = store
        .create(tscribe_models::Job::new("req", MediaSource::youtube("abc")))
        .await
        .unwrap();
    store
        .transition(&job.id, JobStatus::Queued, JobStatus::MetadataReady, JobPatch::new())
        .await
        .unwrap();

    let current = store.get(&job.id).await.unwrap();
    assert_eq!(current.status, JobStatus::MetadataReady);
    println!("Job {} at revision {}", current.id, current.revision);
}
