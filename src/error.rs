use crate::config::ConfigError;
use crate::messaging::{
    ChannelError, ConnectionError, ConsumerError, PublishError, TopologyError,
};

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error("Failed to create metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
}
