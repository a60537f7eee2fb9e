use lapin::Channel;
use std::{fmt, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::DemoError;
use crate::gate::CompletionGate;
use crate::listener::TestMessageListener;
use crate::messaging::{
    ChannelProvider, Consumer, PublishError, Publisher, RabbitMqConnection, Topology,
    DEFAULT_PREFETCH, DEMO_TOPOLOGY,
};
use crate::metrics::{server::start_metrics_server, Metrics, CONSUMED_COUNTER};

pub const NUMBER_OF_MESSAGES: usize = 5;
pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(10);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    TopologyDeclared,
    Publishing,
    Waiting,
    Complete,
    TimedOut,
    Reported,
}

impl RunState {
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Init, TopologyDeclared)
                | (TopologyDeclared, Publishing)
                | (Publishing, Waiting)
                | (Waiting, Complete)
                | (Waiting, TimedOut)
                | (Complete, Reported)
                | (TimedOut, Reported)
        )
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(self.can_advance_to(next), "{} -> {}", self, next);
        info!(from = %self, to = %next, "Run state changed");
        *self = next;
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::TopologyDeclared => "TOPOLOGY_DECLARED",
            Self::Publishing => "PUBLISHING",
            Self::Waiting => "WAITING",
            Self::Complete => "COMPLETE",
            Self::TimedOut => "TIMED_OUT",
            Self::Reported => "REPORTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every message arrived; `consumed` is the consumed counter at report time.
    Complete { expected: usize, consumed: Option<f64> },
    TimedOut { expected: usize, remaining: usize },
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

pub fn test_payload(index: usize) -> String {
    format!("message_{}", index)
}

pub fn test_payloads(count: usize) -> impl Iterator<Item = String> {
    (0..count).map(test_payload)
}

/// Sends `count` test messages one after another. Stops at the first failure.
pub async fn publish_test_messages(
    publisher: &Publisher,
    exchange: &str,
    routing_key: &str,
    count: usize,
) -> Result<(), PublishError> {
    for payload in test_payloads(count) {
        publisher.publish_text(exchange, routing_key, &payload).await?;
    }

    info!(count, exchange, routing_key, "Test messages published");
    Ok(())
}

pub fn summary_lines(expected: usize, consumed: Option<f64>) -> [String; 2] {
    let counter = match consumed {
        Some(value) => format!("{:.1}", value),
        None => "not registered".to_string(),
    };

    [
        format!("Expected {} messages. Checking metric registry...", expected),
        format!("Counter returns: {}", counter),
    ]
}

/// Prints the summary on success; on timeout only logs how many are missing.
pub fn report(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Complete { expected, consumed } => {
            for line in summary_lines(*expected, *consumed) {
                println!("{}", line);
            }
        }
        RunOutcome::TimedOut { expected, remaining } => {
            warn!(
                expected,
                remaining,
                timeout_secs = COMPLETION_TIMEOUT.as_secs(),
                "Timed out waiting for test messages"
            );
        }
    }
}

/// Connects, runs the round trip and always closes the connection afterwards.
pub async fn run(config: &Config) -> Result<RunOutcome, DemoError> {
    let metrics = Metrics::new()?;
    let metrics_server = config.metrics_port.map(|port| spawn_metrics_server(metrics.clone(), port));

    let result = match RabbitMqConnection::connect(
        &config.amqp_url(),
        config.redacted_url(),
        metrics.clone(),
    )
    .await
    {
        Ok(connection) => {
            let result = run_on_connection(&connection, &metrics, &DEMO_TOPOLOGY).await;
            if let Err(e) = connection.shutdown().await {
                warn!(error = %e, "Error during shutdown");
            }
            result
        }
        Err(e) => Err(e.into()),
    };

    if let Some(server) = metrics_server {
        server.abort();
    }

    result
}

fn spawn_metrics_server(metrics: Arc<Metrics>, port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics, port).await {
            error!(error = %e, port, "Metrics server error");
        }
    })
}

/// Runs the round trip for `topology` on an open connection. Channels opened
/// here are closed again whether the run succeeds or fails.
pub async fn run_on_connection(
    connection: &RabbitMqConnection,
    metrics: &Arc<Metrics>,
    topology: &Topology,
) -> Result<RunOutcome, DemoError> {
    let consumer_channel = ChannelProvider::create_consumer_channel(
        connection.get_connection(),
        metrics,
        DEFAULT_PREFETCH,
    )
    .await?;
    let publisher_channel =
        match ChannelProvider::create_confirm_channel(connection.get_connection(), metrics).await {
            Ok(channel) => channel,
            Err(e) => {
                close_channels([consumer_channel], metrics).await;
                return Err(e.into());
            }
        };

    let outcome = round_trip(&consumer_channel, &publisher_channel, metrics, topology).await;

    close_channels([publisher_channel, consumer_channel], metrics).await;
    outcome
}

async fn close_channels<const N: usize>(channels: [Channel; N], metrics: &Metrics) {
    for channel in channels {
        if let Err(e) = ChannelProvider::close_channel(channel, metrics).await {
            warn!(error = %e, "Error closing channel");
        }
    }
}

async fn round_trip(
    consumer_channel: &Channel,
    publisher_channel: &Channel,
    metrics: &Arc<Metrics>,
    topology: &Topology,
) -> Result<RunOutcome, DemoError> {
    let mut state = RunState::Init;

    let exchange = topology.declare(consumer_channel).await?;
    state.advance(RunState::TopologyDeclared);

    let gate = Arc::new(CompletionGate::new(NUMBER_OF_MESSAGES));
    let subscription = Consumer::new(
        consumer_channel.clone(),
        topology.queue.to_string(),
        Arc::new(TestMessageListener::new(gate.clone())),
        metrics.clone(),
    )
    .subscribe()
    .await?;
    info!(consumer_tag = subscription.consumer_tag(), queue = topology.queue, "Subscribed");

    state.advance(RunState::Publishing);
    let publisher = Publisher::new(publisher_channel.clone(), metrics.clone());
    let published = publish_test_messages(
        &publisher,
        &exchange.name,
        topology.routing_key,
        NUMBER_OF_MESSAGES,
    )
    .await;

    let outcome = match published {
        Ok(()) => {
            state.advance(RunState::Waiting);
            let outcome = if gate.wait(COMPLETION_TIMEOUT).await {
                state.advance(RunState::Complete);
                RunOutcome::Complete {
                    expected: NUMBER_OF_MESSAGES,
                    consumed: metrics.counter_value(CONSUMED_COUNTER),
                }
            } else {
                state.advance(RunState::TimedOut);
                RunOutcome::TimedOut {
                    expected: NUMBER_OF_MESSAGES,
                    remaining: gate.count(),
                }
            };

            report(&outcome);
            state.advance(RunState::Reported);
            Ok(outcome)
        }
        Err(e) => Err(e.into()),
    };

    subscription.cancel(SHUTDOWN_GRACE).await;
    outcome
}
