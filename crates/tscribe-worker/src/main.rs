//! Stage worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tscribe_bus::{
    NotifyingObjectStore, RedisIdempotencyGuard, RedisStreamBus, RetryPolicy, RetryingPublisher,
    StreamConfig, Subscription,
};
use tscribe_store::{JobStateStore, R2ObjectStore, RedisJobIndex, StoreConfig};
use tscribe_worker::{
    DeliveryLoop, HttpInferenceProvider, HttpMetadataResolver, StageHandlers, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing()?;
    init_metrics()?;

    info!("Starting tscribe-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    // Bus and idempotency guard
    let stream_config = StreamConfig::from_env();
    let guard = RedisIdempotencyGuard::connect(
        &stream_config.redis_url,
        stream_config.stream_prefix.clone(),
        config.idempotency_retention,
    )
    .await
    .context("Failed to connect idempotency guard")?;
    let bus = Arc::new(
        RedisStreamBus::connect(stream_config)
            .await
            .context("Failed to connect stream bus")?,
    );
    let retry_policy = RetryPolicy::from_env();
    let publisher = RetryingPublisher::new(bus.clone(), retry_policy.clone());

    // Job state store over R2 snapshots and the Redis index; snapshot writes
    // are announced on the notifications stream
    let r2 = R2ObjectStore::from_env().context("Failed to configure object store")?;
    let bucket = r2.bucket().to_string();
    let objects = Arc::new(NotifyingObjectStore::new(
        Arc::new(r2),
        bus.clone(),
        bucket,
        retry_policy,
    ));
    let index = Arc::new(RedisJobIndex::from_env().await.context("Failed to connect job index")?);
    let store = Arc::new(JobStateStore::new(objects, index, StoreConfig::from_env()));

    // External collaborators
    let resolver = HttpMetadataResolver::from_env().context("Failed to configure metadata resolver")?;
    let inference = HttpInferenceProvider::from_env().context("Failed to configure inference provider")?;

    let mut subscriptions: Vec<Arc<dyn Subscription>> = Vec::new();
    for role in &config.roles {
        let subscription = bus
            .subscribe(role.topic())
            .await
            .with_context(|| format!("Failed to subscribe {} to {}", role, role.topic()))?;
        subscriptions.push(Arc::new(subscription));
    }

    let handlers = StageHandlers::new(
        store,
        Arc::new(guard),
        publisher,
        Arc::new(resolver),
        Arc::new(inference),
        config,
    );
    let worker = DeliveryLoop::new(Arc::new(handlers));

    // Setup signal handler
    let shutdown = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown.shutdown();
    });

    worker.run(subscriptions).await.context("Delivery loop failed")?;

    info!("Worker shutdown complete");
    Ok(())
}

/// Colored output for dev, JSON for production.
fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("tscribe=info".parse()?)
        .add_directive("aws_config=warn".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}

/// Serve Prometheus metrics on `METRICS_ADDR` when set, otherwise only record.
fn init_metrics() -> anyhow::Result<()> {
    match std::env::var("METRICS_ADDR") {
        Ok(addr) => {
            let addr: SocketAddr = addr.parse().context("Invalid METRICS_ADDR")?;
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("Failed to install Prometheus exporter")?;
            info!(%addr, "Serving metrics");
        }
        Err(_) => {
            PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install Prometheus recorder")?;
        }
    }
    Ok(())
}
