//! End-to-end choreography over in-memory backends.
//!
//! Snapshot writes go through the notifying object store, which appends a
//! finalize CloudEvent to the notifications topic for every `jobs/` write.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;

use tscribe_bus::{
    topics, InMemoryIdempotencyGuard, InMemoryPublisher, InMemorySubscription, NotifyingObjectStore,
    RetryPolicy, RetryingPublisher, Subscription,
};
use tscribe_models::{
    DialogueTurn, DomainEvent, ExecutionOutcome, Job, JobId, JobStatus, MediaMetadata,
    MediaSource, ProviderConfig,
};
use tscribe_store::{ArtifactStore, InMemoryJobIndex, InMemoryObjectStore, JobStateStore, StoreConfig};
use tscribe_worker::{
    CompiledPrompt, DeliveryLoop, InferenceProvider, MetadataResolver, StageHandlers, WorkerConfig,
    WorkerError, WorkerResult,
};

struct StaticResolver;

#[async_trait]
impl MetadataResolver for StaticResolver {
    async fn resolve(&self, _media: &MediaSource) -> WorkerResult<MediaMetadata> {
        Ok(MediaMetadata {
            title: Some("Standup".to_string()),
            duration_ms: Some(30_000),
            ..Default::default()
        })
    }
}

/// Fails the first `failures` calls; optionally parks each call until released.
struct ScriptedInference {
    failures: AtomicUsize,
    calls: AtomicUsize,
    gated: bool,
    started: Notify,
    release: Notify,
}

impl ScriptedInference {
    fn new(failures: usize, gated: bool) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
            gated,
            started: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl InferenceProvider for ScriptedInference {
    async fn infer(&self, _prompt: &CompiledPrompt) -> WorkerResult<Vec<DialogueTurn>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.gated {
            self.started.notify_one();
            self.release.notified().await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WorkerError::inference_failed("provider returned 503"));
        }

        Ok(vec![
            DialogueTurn {
                speaker: "Ada".to_string(),
                text: "Yesterday I shipped the parser.".to_string(),
                start_ms: Some(0),
                end_ms: Some(2_100),
            },
            DialogueTurn {
                speaker: "Grace".to_string(),
                text: "Nice, any blockers?".to_string(),
                start_ms: Some(2_300),
                end_ms: Some(3_400),
            },
        ])
    }

    fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            provider: "scripted".to_string(),
            model: "scripted-1".to_string(),
            prompt_version: tscribe_worker::PROMPT_VERSION.to_string(),
            temperature: Some(0.0),
        }
    }
}

struct World {
    store: Arc<JobStateStore>,
    objects: Arc<InMemoryObjectStore>,
    artifacts: ArtifactStore,
    bus: Arc<InMemoryPublisher>,
    inference: Arc<ScriptedInference>,
    worker: DeliveryLoop,
    subscriptions: Vec<Arc<InMemorySubscription>>,
    run: JoinHandle<WorkerResult<()>>,
}

impl World {
    fn start(inference: ScriptedInference, max_attempts: u32) -> Self {
        let bus = Arc::new(InMemoryPublisher::new());
        let subscriptions = vec![
            bus.subscribe(topics::NOTIFICATIONS),
            bus.subscribe(topics::METADATA),
            bus.subscribe(topics::TRANSCRIPTION),
        ];

        let objects = Arc::new(InMemoryObjectStore::new("tscribe-test"));
        let notifying = NotifyingObjectStore::new(
            objects.clone(),
            bus.clone(),
            "tscribe-test",
            RetryPolicy::default(),
        );
        let store = Arc::new(JobStateStore::new(
            Arc::new(notifying),
            Arc::new(InMemoryJobIndex::new()),
            StoreConfig::default(),
        ));
        let artifacts = ArtifactStore::new(objects.clone(), Duration::from_secs(5));

        let inference = Arc::new(inference);
        let config = WorkerConfig::default()
            .with_max_attempts(max_attempts)
            .with_receive_wait(Duration::from_millis(10))
            .with_vendor_timeout(Duration::from_secs(5));
        let handlers = StageHandlers::new(
            store.clone(),
            Arc::new(InMemoryIdempotencyGuard::default()),
            RetryingPublisher::new(bus.clone(), RetryPolicy::default()),
            Arc::new(StaticResolver),
            inference.clone(),
            config,
        );
        let worker = DeliveryLoop::new(Arc::new(handlers));

        let runner = worker.clone();
        let consumed: Vec<Arc<dyn Subscription>> = subscriptions
            .iter()
            .map(|s| s.clone() as Arc<dyn Subscription>)
            .collect();
        let run = tokio::spawn(async move { runner.run(consumed).await });

        Self {
            store,
            objects,
            artifacts,
            bus,
            inference,
            worker,
            subscriptions,
            run,
        }
    }

    async fn submit(&self) -> JobId {
        let job = Job::new("req-standup", MediaSource::youtube("dQw4w9WgXcQ"));
        assert_ok!(self.store.create(job).await).id
    }

    /// Wait until the job reaches `status`.
    async fn wait_for(&self, job_id: &JobId, status: JobStatus) -> Job {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(job) = self.store.get(job_id).await {
                    if job.status == status {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {} never reached {}", job_id, status))
    }

    /// Wait until no delivery is queued or being handled.
    async fn quiesce(&self) {
        let mut idle_rounds = 0;
        while idle_rounds < 5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let busy = self.worker.in_flight() > 0
                || self.subscriptions.iter().any(|s| s.in_flight() > 0);
            idle_rounds = if busy { 0 } else { idle_rounds + 1 };
        }
    }

    async fn stop(self) {
        self.worker.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), self.run)
            .await
            .expect("delivery loop did not stop")
            .unwrap();
        assert_ok!(result);
    }
}

#[tokio::test]
async fn test_job_runs_to_completion() {
    let world = World::start(ScriptedInference::new(0, false), 3);
    let job_id = world.submit().await;

    let job = world.wait_for(&job_id, JobStatus::Completed).await;
    world.quiesce().await;

    assert_eq!(job.attempts, 1);
    assert!(job.error.is_none());
    assert_eq!(
        job.media_details.as_ref().and_then(|d| d.title.as_deref()),
        Some("Standup")
    );

    let transcript_id = job.transcript_id.clone().expect("transcript id");
    let transcript = world.artifacts.get_transcript(&transcript_id).await.unwrap().unwrap();
    assert_eq!(transcript.job_id, job_id);
    assert_eq!(transcript.turns.len(), 2);

    let executions = world.artifacts.list_llm_artifacts(&job_id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].attempt, 1);
    assert_eq!(executions[0].outcome, ExecutionOutcome::Succeeded { turn_count: 2 });

    let history = world.store.history(&job_id).await.unwrap();
    let statuses: Vec<JobStatus> = history.iter().map(|j| j.status).collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Queued,
            JobStatus::MetadataReady,
            JobStatus::Processing,
            JobStatus::Completed
        ]
    );
    assert!(history.windows(2).all(|w| w[0].updated_at < w[1].updated_at));

    let events = world.bus.events(topics::EVENTS);
    assert!(events.iter().any(|e| matches!(e, DomainEvent::JobQueued { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        DomainEvent::TranscriptComplete { transcript_id: id, turn_count: 2, .. } if *id == transcript_id
    )));
    let status_changes = events
        .iter()
        .filter(|e| matches!(e, DomainEvent::JobStatusChanged { .. }))
        .count();
    assert_eq!(status_changes, 4);

    world.stop().await;
}

#[tokio::test]
async fn test_duplicate_notification_writes_nothing() {
    let world = World::start(ScriptedInference::new(0, false), 3);
    let job_id = world.submit().await;
    world.wait_for(&job_id, JobStatus::Completed).await;
    world.quiesce().await;

    let snapshot_writes = world.objects.writes_under("jobs/");
    let work_published = world.bus.published(topics::METADATA).len();

    // Redeliver every notification seen so far
    let payloads = world.bus.notifications(topics::NOTIFICATIONS);
    assert_eq!(payloads.len(), 4);
    for payload in payloads {
        world.subscriptions[0].push(payload);
    }
    world.quiesce().await;

    assert_eq!(world.objects.writes_under("jobs/"), snapshot_writes);
    assert_eq!(world.bus.published(topics::METADATA).len(), work_published);
    assert_eq!(world.inference.calls.load(Ordering::SeqCst), 1);
    assert!(world.subscriptions[0].dead_letters().is_empty());

    world.stop().await;
}

#[tokio::test]
async fn test_cancel_during_inference_stops_job() {
    let world = World::start(ScriptedInference::new(0, true), 3);
    let job_id = world.submit().await;

    tokio::time::timeout(Duration::from_secs(10), world.inference.started.notified())
        .await
        .expect("inference never started");

    let cancelled = assert_ok!(world.store.cancel(&job_id).await);
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    world.inference.release.notify_one();
    world.quiesce().await;

    let job = world.store.get(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.transcript_id.is_none());

    let history = world.store.history(&job_id).await.unwrap();
    assert!(history.iter().all(|j| j.status != JobStatus::Completed));

    let events = world.bus.events(topics::EVENTS);
    assert!(events.iter().any(|e| matches!(
        e,
        DomainEvent::JobStatusChanged { status: JobStatus::Cancelled, .. }
    )));

    world.stop().await;
}

#[tokio::test]
async fn test_exhausted_attempts_fail_job() {
    let world = World::start(ScriptedInference::new(usize::MAX, false), 2);
    let job_id = world.submit().await;

    let job = world.wait_for(&job_id, JobStatus::Failed).await;
    world.quiesce().await;

    assert_eq!(job.attempts, 2);
    let error = job.error.expect("error recorded");
    assert_eq!(error.code, "inference");
    assert!(error.message.contains("503"));

    let executions = world.artifacts.list_llm_artifacts(&job_id).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert!(executions
        .iter()
        .all(|e| matches!(e.outcome, ExecutionOutcome::Failed { .. })));

    let events = world.bus.events(topics::EVENTS);
    assert!(events.iter().any(|e| matches!(
        e,
        DomainEvent::JobFailed { attempts: 2, .. }
    )));

    world.stop().await;
}
