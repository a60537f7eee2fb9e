use lapin::options::{QueueDeclareOptions, QueueDeleteOptions};
use lapin::types::FieldTable;
use rabbitmq_metrics_demo::app::{self, publish_test_messages, test_payloads, RunOutcome};
use rabbitmq_metrics_demo::config::Config;
use rabbitmq_metrics_demo::error::DemoError;
use rabbitmq_metrics_demo::gate::CompletionGate;
use rabbitmq_metrics_demo::messaging::{
    ChannelProvider, Consumer, HandlerError, MessageHandler, Publisher, RabbitMqConnection,
    Topology, TopologyError, DEMO_TOPOLOGY,
};
use rabbitmq_metrics_demo::metrics::{Metrics, CONSUMED_COUNTER};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn local_config() -> Config {
    Config::from_env().expect("valid test configuration")
}

struct Recorder {
    gate: Arc<CompletionGate>,
    received: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, _routing_key: &str, body: &[u8]) -> Result<(), HandlerError> {
        self.received
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(body).into_owned());
        self.gate.count_down();
        Ok(())
    }
}

#[tokio::test]
async fn unreachable_broker_fails_before_publishing() {
    let config = Config::from_lookup(|key| match key {
        "RABBITMQ_HOST" => Some("127.0.0.1".to_string()),
        "RABBITMQ_PORT" => Some("1".to_string()),
        _ => None,
    })
    .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), app::run(&config))
        .await
        .expect("connection attempt should not hang");

    assert!(matches!(result, Err(DemoError::Connection(_))));
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn full_run_reports_consumed_messages() {
    let outcome = app::run(&local_config()).await.unwrap();

    match outcome {
        RunOutcome::Complete { expected, consumed } => {
            assert_eq!(expected, app::NUMBER_OF_MESSAGES);
            assert!(consumed.unwrap() >= expected as f64);
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn topology_declare_is_idempotent() {
    let config = local_config();
    let metrics = Metrics::new().unwrap();
    let connection =
        RabbitMqConnection::connect(&config.amqp_url(), config.redacted_url(), metrics.clone())
            .await
            .unwrap();
    let channel = ChannelProvider::create_confirm_channel(connection.get_connection(), &metrics)
        .await
        .unwrap();

    let first = DEMO_TOPOLOGY.declare(&channel).await.unwrap();
    let second = DEMO_TOPOLOGY.declare(&channel).await.unwrap();
    assert_eq!(first.name, second.name);

    connection.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn every_payload_arrives_exactly_once() {
    let config = local_config();
    let metrics = Metrics::new().unwrap();
    let connection =
        RabbitMqConnection::connect(&config.amqp_url(), config.redacted_url(), metrics.clone())
            .await
            .unwrap();

    // Private names so leftover traffic on the demo queue does not interfere.
    let topology = Topology {
        exchange: "metrics-demo-it-exchange",
        queue: "metrics-demo-it-queue",
        routing_key: "metrics-demo-it-key",
    };

    let consumer_channel =
        ChannelProvider::create_consumer_channel(connection.get_connection(), &metrics, 10)
            .await
            .unwrap();
    let exchange = topology.declare(&consumer_channel).await.unwrap();
    consumer_channel
        .queue_purge(topology.queue, Default::default())
        .await
        .unwrap();

    let count = 8;
    let gate = Arc::new(CompletionGate::new(count));
    let recorder = Arc::new(Recorder {
        gate: gate.clone(),
        received: Mutex::new(Vec::new()),
    });

    let subscription = Consumer::new(
        consumer_channel,
        topology.queue.to_string(),
        recorder.clone(),
        metrics.clone(),
    )
    .with_concurrency(4)
    .subscribe()
    .await
    .unwrap();

    let publisher_channel =
        ChannelProvider::create_confirm_channel(connection.get_connection(), &metrics)
            .await
            .unwrap();
    let publisher = Publisher::new(publisher_channel, metrics.clone());
    publish_test_messages(&publisher, &exchange.name, topology.routing_key, count)
        .await
        .unwrap();

    assert!(gate.wait(Duration::from_secs(10)).await);
    subscription.cancel(Duration::from_secs(5)).await;

    let received = recorder.received.lock().unwrap().clone();
    assert_eq!(received.len(), count);
    let unique: HashSet<String> = received.into_iter().collect();
    let sent: HashSet<String> = test_payloads(count).collect();
    assert_eq!(unique, sent);

    assert_eq!(metrics.counter_value(CONSUMED_COUNTER), Some(count as f64));
    assert_eq!(metrics.counter_value("rabbitmq_published"), Some(count as f64));

    connection.shutdown().await.unwrap();
}

/// Fails every payload with `failure` on its first delivery, succeeds after.
struct FailFirst {
    gate: Arc<CompletionGate>,
    failure: fn(String) -> HandlerError,
    attempts: Mutex<HashMap<String, usize>>,
}

impl FailFirst {
    fn new(gate: Arc<CompletionGate>, failure: fn(String) -> HandlerError) -> Self {
        Self {
            gate,
            failure,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn attempts(&self, payload: &str) -> usize {
        self.attempts.lock().unwrap().get(payload).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl MessageHandler for FailFirst {
    async fn handle(&self, _routing_key: &str, body: &[u8]) -> Result<(), HandlerError> {
        let payload = String::from_utf8_lossy(body).into_owned();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let attempt = attempts.entry(payload.clone()).or_insert(0);
            *attempt += 1;
            *attempt
        };

        self.gate.count_down();
        if attempt == 1 {
            Err((self.failure)(payload))
        } else {
            Ok(())
        }
    }
}

async fn connect(metrics: &Arc<Metrics>) -> RabbitMqConnection {
    let config = local_config();
    RabbitMqConnection::connect(&config.amqp_url(), config.redacted_url(), metrics.clone())
        .await
        .unwrap()
}

async fn queue_depth(connection: &RabbitMqConnection, queue: &str) -> u32 {
    let channel = connection.get_connection().create_channel().await.unwrap();
    let depth = channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap()
        .message_count();
    channel.close(200, "done").await.unwrap();
    depth
}

/// Publishes one message to a purged queue consumed by `handler`, waits for
/// the gate and stops the consumer.
async fn settle_one(
    topology: Topology,
    handler: Arc<FailFirst>,
    gate: &CompletionGate,
) -> (RabbitMqConnection, Arc<Metrics>) {
    let metrics = Metrics::new().unwrap();
    let connection = connect(&metrics).await;

    let consumer_channel =
        ChannelProvider::create_consumer_channel(connection.get_connection(), &metrics, 1)
            .await
            .unwrap();
    let exchange = topology.declare(&consumer_channel).await.unwrap();
    consumer_channel
        .queue_purge(topology.queue, Default::default())
        .await
        .unwrap();

    let subscription = Consumer::new(
        consumer_channel,
        topology.queue.to_string(),
        handler,
        metrics.clone(),
    )
    .subscribe()
    .await
    .unwrap();

    let publisher_channel =
        ChannelProvider::create_confirm_channel(connection.get_connection(), &metrics)
            .await
            .unwrap();
    Publisher::new(publisher_channel, metrics.clone())
        .publish_text(&exchange.name, topology.routing_key, "message_0")
        .await
        .unwrap();

    assert!(gate.wait(Duration::from_secs(10)).await);
    // Give a discarded message the chance to come back if it wrongly would.
    tokio::time::sleep(Duration::from_millis(500)).await;
    subscription.cancel(Duration::from_secs(5)).await;

    (connection, metrics)
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn transient_failure_is_requeued_and_redelivered() {
    let topology = Topology {
        exchange: "metrics-demo-it-exchange",
        queue: "metrics-demo-it-requeue-queue",
        routing_key: "metrics-demo-it-requeue-key",
    };
    let gate = Arc::new(CompletionGate::new(2));
    let handler = Arc::new(FailFirst::new(gate.clone(), HandlerError::Transient));

    let (connection, metrics) = settle_one(topology, handler.clone(), &gate).await;

    assert_eq!(handler.attempts("message_0"), 2);
    assert_eq!(metrics.counter_value("rabbitmq_rejected"), Some(1.0));
    assert_eq!(metrics.counter_value("rabbitmq_acknowledged"), Some(1.0));
    assert_eq!(metrics.counter_value(CONSUMED_COUNTER), Some(2.0));
    assert_eq!(queue_depth(&connection, topology.queue).await, 0);

    connection.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn permanent_failure_is_discarded() {
    let topology = Topology {
        exchange: "metrics-demo-it-exchange",
        queue: "metrics-demo-it-discard-queue",
        routing_key: "metrics-demo-it-discard-key",
    };
    let gate = Arc::new(CompletionGate::new(1));
    let handler = Arc::new(FailFirst::new(gate.clone(), HandlerError::Permanent));

    let (connection, metrics) = settle_one(topology, handler.clone(), &gate).await;

    assert_eq!(handler.attempts("message_0"), 1);
    assert_eq!(metrics.counter_value("rabbitmq_rejected"), Some(1.0));
    assert_eq!(metrics.counter_value("rabbitmq_acknowledged"), Some(0.0));
    assert_eq!(metrics.counter_value(CONSUMED_COUNTER), Some(1.0));
    assert_eq!(queue_depth(&connection, topology.queue).await, 0);

    connection.shutdown().await.unwrap();
}

const CONFLICT_TOPOLOGY: Topology = Topology {
    exchange: "metrics-demo-it-conflict-exchange",
    queue: "metrics-demo-it-conflict-queue",
    routing_key: "metrics-demo-it-conflict-key",
};

/// Leaves a non-durable queue under the conflict topology's queue name.
async fn declare_transient_queue(connection: &RabbitMqConnection) {
    let channel = connection.get_connection().create_channel().await.unwrap();
    channel
        .queue_delete(CONFLICT_TOPOLOGY.queue, QueueDeleteOptions::default())
        .await
        .unwrap();
    channel
        .queue_declare(
            CONFLICT_TOPOLOGY.queue,
            QueueDeclareOptions {
                durable: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();
    channel.close(200, "done").await.unwrap();
}

async fn drop_conflict_queue(connection: &RabbitMqConnection) {
    let channel = connection.get_connection().create_channel().await.unwrap();
    channel
        .queue_delete(CONFLICT_TOPOLOGY.queue, QueueDeleteOptions::default())
        .await
        .unwrap();
    channel.close(200, "done").await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn durable_declare_over_transient_queue_conflicts() {
    let metrics = Metrics::new().unwrap();
    let connection = connect(&metrics).await;
    declare_transient_queue(&connection).await;

    let channel = ChannelProvider::create_confirm_channel(connection.get_connection(), &metrics)
        .await
        .unwrap();
    let err = CONFLICT_TOPOLOGY.declare(&channel).await.unwrap_err();
    assert!(matches!(err, TopologyError::Conflict { entity: "queue", .. }));

    drop_conflict_queue(&connection).await;
    connection.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn failed_declare_still_closes_channels() {
    let metrics = Metrics::new().unwrap();
    let connection = connect(&metrics).await;
    declare_transient_queue(&connection).await;

    let result = app::run_on_connection(&connection, &metrics, &CONFLICT_TOPOLOGY).await;

    assert!(matches!(
        result,
        Err(DemoError::Topology(TopologyError::Conflict { .. }))
    ));
    assert_eq!(metrics.channels.get(), 0.0);
    assert_eq!(metrics.counter_value("rabbitmq_published"), Some(0.0));

    drop_conflict_queue(&connection).await;
    connection.shutdown().await.unwrap();
}
