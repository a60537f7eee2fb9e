use lapin::{
    options::BasicPublishOptions, publisher_confirm::Confirmation, BasicProperties, Channel,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::metrics::Metrics;

const CONTENT_TYPE: &str = "text/plain";
const CONTENT_ENCODING: &str = "UTF-8";
const PERSISTENT: u8 = 2;

/// Publishes text messages on a confirm-mode channel and records the
/// outcome of every publish.
pub struct Publisher {
    channel: Channel,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(channel: Channel, metrics: Arc<Metrics>) -> Self {
        Self { channel, metrics }
    }

    /// Publishes `body` and waits for the broker confirmation.
    pub async fn publish_text(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &str,
    ) -> Result<(), PublishError> {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_content_encoding(CONTENT_ENCODING.into())
            .with_delivery_mode(PERSISTENT);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                body.as_bytes(),
                properties,
            )
            .await
            .map_err(|e| self.failed(exchange, routing_key, e))?;

        self.metrics.published.inc();

        let confirmation = confirm
            .await
            .map_err(|e| self.failed(exchange, routing_key, e))?;

        match confirmation {
            Confirmation::Nack(_) => {
                self.metrics.not_acknowledged_published.inc();
                error!(exchange, routing_key, "Broker nacked publish");
                Err(PublishError::Nacked {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                })
            }
            Confirmation::Ack(returned) => {
                self.metrics.acknowledged_published.inc();
                if returned.is_some() {
                    self.metrics.unrouted_published.inc();
                    warn!(exchange, routing_key, "Message returned as unroutable");
                }
                debug!(exchange, routing_key, "Publish confirmed");
                Ok(())
            }
            Confirmation::NotRequested => {
                debug!(exchange, routing_key, "Published without confirmation");
                Ok(())
            }
        }
    }

    fn failed(&self, exchange: &str, routing_key: &str, err: lapin::Error) -> PublishError {
        self.metrics.failed_to_publish.inc();
        error!(error = %err, exchange, routing_key, "Failed to publish message");
        PublishError::Failed(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to publish message: {0}")]
    Failed(String),

    #[error("Broker rejected publish to {exchange}/{routing_key}")]
    Nacked {
        exchange: String,
        routing_key: String,
    },
}
