use prometheus::{proto::MetricType, Counter, Gauge, HistogramOpts, HistogramVec, Registry};
use std::sync::Arc;

pub mod server;

/// Name of the counter bumped for every delivery that reaches a consumer.
pub const CONSUMED_COUNTER: &str = "rabbitmq_consumed";

/// Client-side RabbitMQ meters, kept in an explicit registry that is handed to
/// the connection, channels, publisher and consumer.
pub struct Metrics {
    pub connections: Gauge,
    pub channels: Gauge,
    pub published: Counter,
    pub failed_to_publish: Counter,
    pub acknowledged_published: Counter,
    pub not_acknowledged_published: Counter,
    pub unrouted_published: Counter,
    pub consumed: Counter,
    pub acknowledged: Counter,
    pub rejected: Counter,
    pub handle_duration_seconds: HistogramVec,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let connections = Gauge::new("rabbitmq_connections", "Number of open broker connections")?;
        let channels = Gauge::new("rabbitmq_channels", "Number of open channels")?;

        let published = Counter::new(
            "rabbitmq_published",
            "Total number of messages handed to the broker",
        )?;
        let failed_to_publish = Counter::new(
            "rabbitmq_failed_to_publish",
            "Total number of publish calls that failed",
        )?;
        let acknowledged_published = Counter::new(
            "rabbitmq_acknowledged_published",
            "Total number of publishes confirmed by the broker",
        )?;
        let not_acknowledged_published = Counter::new(
            "rabbitmq_not_acknowledged_published",
            "Total number of publishes negatively confirmed by the broker",
        )?;
        let unrouted_published = Counter::new(
            "rabbitmq_unrouted_published",
            "Total number of mandatory publishes returned as unroutable",
        )?;

        let consumed = Counter::new(
            CONSUMED_COUNTER,
            "Total number of deliveries received by consumers",
        )?;
        let acknowledged = Counter::new(
            "rabbitmq_acknowledged",
            "Total number of deliveries acknowledged",
        )?;
        let rejected = Counter::new(
            "rabbitmq_rejected",
            "Total number of deliveries nacked or rejected",
        )?;

        let handle_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "rabbitmq_handle_duration_seconds",
                "Time taken by the message handler",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["queue", "status"],
        )?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(channels.clone()))?;
        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(failed_to_publish.clone()))?;
        registry.register(Box::new(acknowledged_published.clone()))?;
        registry.register(Box::new(not_acknowledged_published.clone()))?;
        registry.register(Box::new(unrouted_published.clone()))?;
        registry.register(Box::new(consumed.clone()))?;
        registry.register(Box::new(acknowledged.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(handle_duration_seconds.clone()))?;

        Ok(Arc::new(Self {
            connections,
            channels,
            published,
            failed_to_publish,
            acknowledged_published,
            not_acknowledged_published,
            unrouted_published,
            consumed,
            acknowledged,
            rejected,
            handle_duration_seconds,
            registry,
        }))
    }

    /// Finds the counter family called `name` and returns its current count,
    /// summed over all label sets. Returns `None` when no counter has that name.
    pub fn counter_value(&self, name: &str) -> Option<f64> {
        self.registry
            .gather()
            .iter()
            .find(|family| {
                family.get_name() == name && family.get_field_type() == MetricType::COUNTER
            })
            .map(|family| {
                family
                    .get_metric()
                    .iter()
                    .map(|metric| metric.get_counter().get_value())
                    .sum()
            })
    }
}
