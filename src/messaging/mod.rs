pub mod channel;
pub mod connection;
pub mod consumer;
pub mod handler;
pub mod publisher;
pub mod topology;

pub use channel::{ChannelError, ChannelProvider, DEFAULT_PREFETCH};
pub use connection::{ConnectionError, RabbitMqConnection};
pub use consumer::{Consumer, ConsumerError, Subscription};
pub use handler::{HandlerError, MessageHandler};
pub use publisher::{PublishError, Publisher};
pub use topology::{DeclaredExchange, Topology, TopologyError, DEMO_TOPOLOGY};
