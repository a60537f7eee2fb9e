use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    Channel, ExchangeKind,
};
use tracing::{error, info};

pub const EXCHANGE_NAME: &str = "spring-test-exchange";
pub const QUEUE_NAME: &str = "spring-test-queue";
pub const ROUTING_KEY: &str = "spring-test-routing-key";

/// A topic exchange, one durable queue and the binding between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub exchange: &'static str,
    pub queue: &'static str,
    pub routing_key: &'static str,
}

pub const DEMO_TOPOLOGY: Topology = Topology {
    exchange: EXCHANGE_NAME,
    queue: QUEUE_NAME,
    routing_key: ROUTING_KEY,
};

/// Handle to an exchange that exists on the broker.
#[derive(Debug, Clone)]
pub struct DeclaredExchange {
    pub name: String,
}

impl Topology {
    /// Declares exchange, queue and binding. Declares are idempotent on the
    /// broker as long as the arguments match, so calling this again is a no-op.
    pub async fn declare(&self, channel: &Channel) -> Result<DeclaredExchange, TopologyError> {
        channel
            .exchange_declare(
                self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error("exchange", self.exchange, e))?;

        channel
            .queue_declare(
                self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error("queue", self.queue, e))?;

        channel
            .queue_bind(
                self.queue,
                self.exchange,
                self.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error("binding", self.routing_key, e))?;

        info!(
            exchange = self.exchange,
            queue = self.queue,
            routing_key = self.routing_key,
            "Topology declared"
        );

        Ok(DeclaredExchange {
            name: self.exchange.to_string(),
        })
    }
}

fn declare_error(entity: &'static str, name: &str, err: lapin::Error) -> TopologyError {
    error!(error = %err, entity, name, "Topology declaration failed");

    if is_precondition_failed(&err) {
        TopologyError::Conflict {
            entity,
            name: name.to_string(),
            reason: err.to_string(),
        }
    } else {
        TopologyError::DeclareFailed {
            entity,
            name: name.to_string(),
            reason: err.to_string(),
        }
    }
}

/// The broker answers PRECONDITION_FAILED when a declare disagrees with an
/// existing entity of the same name.
fn is_precondition_failed(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp_error) => matches!(
            amqp_error.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ),
        _ => false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Topology conflict on {entity} {name:?}: {reason}")]
    Conflict {
        entity: &'static str,
        name: String,
        reason: String,
    },

    #[error("Failed to declare {entity} {name:?}: {reason}")]
    DeclareFailed {
        entity: &'static str,
        name: String,
        reason: String,
    },
}
