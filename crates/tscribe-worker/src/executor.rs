//! Delivery loop.
//!
//! One consumer task per subscription; each delivery is handled on its own
//! task, bounded by a shared semaphore.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tscribe_bus::{metrics, Delivery, Subscription};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::stages::{DeliveryOutcome, StageHandlers};

/// Runs stage handlers over a set of subscriptions.
#[derive(Clone)]
pub struct DeliveryLoop {
    handlers: Arc<StageHandlers>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl DeliveryLoop {
    pub fn new(handlers: Arc<StageHandlers>) -> Self {
        let config = handlers.config().clone();
        let semaphore = Arc::new(Semaphore::new(config.max_handlers));
        let (shutdown, _) = watch::channel(false);

        Self {
            handlers,
            config,
            semaphore,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Consume every subscription until shutdown, then drain in-flight handlers.
    pub async fn run(&self, subscriptions: Vec<Arc<dyn Subscription>>) -> WorkerResult<()> {
        if subscriptions.is_empty() {
            return Err(WorkerError::config_error("No subscriptions to consume"));
        }

        info!(
            "Starting delivery loop on [{}] with {} max concurrent handlers",
            subscriptions
                .iter()
                .map(|s| s.topic())
                .collect::<Vec<_>>()
                .join(", "),
            self.config.max_handlers
        );

        let mut consumers = JoinSet::new();
        for subscription in subscriptions {
            let this = self.clone();
            consumers.spawn(async move { this.consume_loop(subscription).await });
        }
        while consumers.join_next().await.is_some() {}

        info!("Waiting for in-flight handlers to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_handlers())
            .await
            .is_err()
        {
            warn!(in_flight = self.in_flight(), "Shutdown timeout reached with handlers still running");
        }

        info!("Delivery loop stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.config
            .max_handlers
            .saturating_sub(self.semaphore.available_permits())
    }

    async fn consume_loop(&self, subscription: Arc<dyn Subscription>) {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Only the receive races shutdown; deliveries in hand are always dispatched
            let received = tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(topic = subscription.topic(), "Shutdown signal received, stopping consumer");
                        break;
                    }
                    continue;
                }
                result = self.receive(&subscription) => result,
            };

            match received {
                Ok(deliveries) => self.dispatch(&subscription, deliveries).await,
                Err(e) => {
                    error!(topic = subscription.topic(), "Error consuming deliveries: {}", e);
                    // Back off on error
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Receive up to the free handler slots.
    async fn receive(&self, subscription: &Arc<dyn Subscription>) -> WorkerResult<Vec<Delivery>> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            // All slots busy, wait a bit
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Ok(Vec::new());
        }

        let deliveries = subscription
            .receive(available.min(self.config.receive_batch), self.config.receive_wait)
            .await?;
        if !deliveries.is_empty() {
            debug!(topic = subscription.topic(), count = deliveries.len(), "Received deliveries");
        }
        Ok(deliveries)
    }

    /// Spawn a handler per delivery, waiting for a free slot for each.
    ///
    /// A subscription may hand back more deliveries than there were free
    /// slots (reclaimed entries, other consumers sharing the semaphore).
    async fn dispatch(&self, subscription: &Arc<dyn Subscription>, deliveries: Vec<Delivery>) {
        let mut deliveries = deliveries.into_iter();

        while let Some(delivery) = deliveries.next() {
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                warn!(topic = subscription.topic(), "Handler semaphore closed, returning deliveries");
                for unhandled in std::iter::once(delivery).chain(deliveries) {
                    if let Err(e) = subscription.nack(&unhandled).await {
                        error!(topic = subscription.topic(), message_id = %unhandled.message_id, "Failed to nack delivery: {}", e);
                    }
                }
                return;
            };
            let this = self.clone();
            let subscription = Arc::clone(subscription);

            tokio::spawn(async move {
                let _permit = permit;
                this.process(subscription.as_ref(), delivery).await;
            });
        }
    }

    /// Handle one delivery and settle it with the bus.
    pub async fn process(&self, subscription: &dyn Subscription, delivery: Delivery) -> DeliveryOutcome {
        let outcome = match self.handlers.handle(&delivery).await {
            DeliveryOutcome::Retry(reason) if delivery.delivery_attempt >= self.config.max_deliveries => {
                DeliveryOutcome::DeadLetter(format!(
                    "gave up after {} deliveries: {}",
                    delivery.delivery_attempt, reason
                ))
            }
            other => other,
        };

        metrics::record_delivery(subscription.topic(), outcome.label());

        let settled = match &outcome {
            DeliveryOutcome::Ack => subscription.ack(&delivery).await,
            DeliveryOutcome::Retry(reason) => {
                warn!(
                    topic = subscription.topic(),
                    message_id = %delivery.message_id,
                    attempt = delivery.delivery_attempt,
                    reason = %reason,
                    "Delivery will be retried"
                );
                subscription.nack(&delivery).await
            }
            DeliveryOutcome::DeadLetter(reason) => subscription.dead_letter(&delivery, reason).await,
        };

        if let Err(e) = settled {
            error!(
                topic = subscription.topic(),
                message_id = %delivery.message_id,
                outcome = outcome.label(),
                "Failed to settle delivery: {}", e
            );
        }
        outcome
    }

    async fn wait_for_handlers(&self) {
        while self.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
