use futures::StreamExt;
use lapin::{message::Delivery, options::*, types::FieldTable, Channel};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Notify, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::{HandlerError, MessageHandler};
use crate::metrics::Metrics;

pub struct Consumer {
    channel: Channel,
    queue_name: String,
    consumer_tag: String,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<Metrics>,
    concurrency: usize,
}

impl Consumer {
    pub fn new(
        channel: Channel,
        queue_name: String,
        handler: Arc<dyn MessageHandler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let consumer_tag = format!("{}-{}", queue_name, Uuid::new_v4());
        Self {
            channel,
            queue_name,
            consumer_tag,
            handler,
            metrics,
            concurrency: 1,
        }
    }

    /// Maximum number of deliveries handled at the same time.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = clamp_concurrency(concurrency);
        self
    }

    /// Registers the consumer on the broker and starts dispatching deliveries
    /// to the handler in the background.
    pub async fn subscribe(self) -> Result<Subscription, ConsumerError> {
        info!(
            queue = %self.queue_name,
            consumer_tag = %self.consumer_tag,
            "Starting RabbitMQ consumer"
        );

        let stream = self
            .channel
            .basic_consume(
                &self.queue_name,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue = %self.queue_name, "Failed to start consumer");
                ConsumerError::ConsumeFailed(e.to_string())
            })?;

        info!(
            queue = %self.queue_name,
            consumer_tag = %self.consumer_tag,
            concurrency = self.concurrency,
            "Consumer started successfully"
        );

        let shutdown = Arc::new(Notify::new());
        let consumer_tag = self.consumer_tag.clone();
        let handle = tokio::spawn(self.run(stream, shutdown.clone()));

        Ok(Subscription {
            consumer_tag,
            shutdown,
            handle,
        })
    }

    async fn run(self, mut stream: lapin::Consumer, shutdown: Arc<Notify>) {
        let permits = Arc::new(Semaphore::new(self.concurrency));

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!(
                        consumer_tag = %self.consumer_tag,
                        "Shutdown signal received, stopping consumer"
                    );
                    break;
                }

                delivery = stream.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            self.metrics.consumed.inc();

                            let Ok(permit) = permits.clone().acquire_owned().await else {
                                break;
                            };
                            let handler = self.handler.clone();
                            let metrics = self.metrics.clone();
                            let queue = self.queue_name.clone();
                            tokio::spawn(async move {
                                process_delivery(handler.as_ref(), &metrics, &queue, delivery).await;
                                drop(permit);
                            });
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Error receiving message from RabbitMQ");
                        }
                        None => {
                            warn!("Consumer stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(error = %e, consumer_tag = %self.consumer_tag, "Failed to cancel consumer");
        }

        // Wait for in-flight handlers before reporting the consumer as stopped.
        match permits.acquire_many(self.concurrency as u32).await {
            Ok(_drained) => info!(consumer_tag = %self.consumer_tag, "Consumer stopped"),
            Err(e) => warn!(error = %e, consumer_tag = %self.consumer_tag, "Consumer stopped without draining handlers"),
        }
    }
}

/// How a delivery is settled with the broker once the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Requeue,
    Discard,
}

impl Settlement {
    fn for_outcome(outcome: &Result<(), HandlerError>) -> Self {
        match outcome {
            Ok(()) => Self::Ack,
            Err(err) if err.requeue() => Self::Requeue,
            Err(_) => Self::Discard,
        }
    }

    fn status(self) -> &'static str {
        match self {
            Self::Ack => "success",
            Self::Requeue => "transient",
            Self::Discard => "permanent",
        }
    }
}

async fn process_delivery(
    handler: &dyn MessageHandler,
    metrics: &Metrics,
    queue: &str,
    delivery: Delivery,
) {
    let delivery_tag = delivery.delivery_tag;
    let routing_key = delivery.routing_key.as_str();

    debug!(
        delivery_tag,
        routing_key,
        redelivered = delivery.redelivered,
        payload_size = delivery.data.len(),
        "Processing message"
    );

    let start = Instant::now();
    let outcome = handler.handle(routing_key, &delivery.data).await;
    let settlement = Settlement::for_outcome(&outcome);

    metrics
        .handle_duration_seconds
        .with_label_values(&[queue, settlement.status()])
        .observe(start.elapsed().as_secs_f64());

    if let Err(err) = &outcome {
        warn!(delivery_tag, settlement = ?settlement, error = %err, "Handler failed, rejecting message");
    }

    let result = match settlement {
        Settlement::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
        Settlement::Requeue => {
            delivery
                .acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
        }
        Settlement::Discard => {
            delivery
                .acker
                .reject(BasicRejectOptions { requeue: false })
                .await
        }
    };

    match (result, settlement) {
        (Ok(_), Settlement::Ack) => metrics.acknowledged.inc(),
        (Ok(_), _) => metrics.rejected.inc(),
        (Err(e), _) => error!(error = %e, delivery_tag, settlement = ?settlement, "Failed to settle message"),
    }
}

/// Caps the handler concurrency so it fits a semaphore and `acquire_many`.
fn clamp_concurrency(concurrency: usize) -> usize {
    concurrency.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize))
}

/// Handle to a running consumer. Dropping it leaves the consumer running
/// until the channel closes.
pub struct Subscription {
    consumer_tag: String,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Stops the consumer and waits up to `grace` for in-flight handlers.
    pub async fn cancel(self, grace: Duration) {
        self.shutdown.notify_one();

        match tokio::time::timeout(grace, self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, consumer_tag = %self.consumer_tag, "Consumer task failed"),
            Err(_) => warn!(consumer_tag = %self.consumer_tag, "Consumer shutdown timeout"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Failed to start consumer: {0}")]
    ConsumeFailed(String),
}
