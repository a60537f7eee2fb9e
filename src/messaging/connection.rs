use lapin::{Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::metrics::Metrics;

pub struct RabbitMqConnection {
    connection: Connection,
    display_url: String,
    metrics: Arc<Metrics>,
}

impl RabbitMqConnection {
    /// `display_url` is only used for logging so credentials stay out of it.
    pub async fn connect(
        url: &str,
        display_url: String,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConnectionError> {
        info!(url = %display_url, "Connecting to RabbitMQ");

        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                error!(error = %e, url = %display_url, "Failed to connect to RabbitMQ");
                ConnectionError::ConnectionFailed(e.to_string())
            })?;

        metrics.connections.inc();
        info!(url = %display_url, "Successfully connected to RabbitMQ");

        Ok(Self {
            connection,
            display_url,
            metrics,
        })
    }

    pub fn get_connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn shutdown(self) -> Result<(), ConnectionError> {
        info!(url = %self.display_url, "Shutting down RabbitMQ connection");

        self.metrics.connections.dec();
        if !self.is_connected() {
            warn!(url = %self.display_url, "Connection already closed, skipping close handshake");
            return Ok(());
        }

        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to close RabbitMQ connection gracefully");
                ConnectionError::ShutdownFailed(e.to_string())
            })?;

        info!("RabbitMQ connection closed successfully");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to RabbitMQ: {0}")]
    ConnectionFailed(String),

    #[error("Failed to shutdown connection gracefully: {0}")]
    ShutdownFailed(String),
}
