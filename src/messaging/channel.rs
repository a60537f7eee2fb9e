use lapin::{options::ConfirmSelectOptions, Channel, Connection};
use tracing::{error, info};

use crate::metrics::Metrics;

/// Prefetch used for consumer channels.
pub const DEFAULT_PREFETCH: u16 = 250;

pub struct ChannelProvider;

impl ChannelProvider {
    async fn open(connection: &Connection, metrics: &Metrics) -> Result<Channel, ChannelError> {
        info!("Creating RabbitMQ channel");

        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ channel");
            ChannelError::CreationFailed(e.to_string())
        })?;

        metrics.channels.inc();
        info!(channel_id = channel.id(), "Channel created successfully");

        Ok(channel)
    }

    /// Channel for consuming, with QoS set to `prefetch_count`.
    pub async fn create_consumer_channel(
        connection: &Connection,
        metrics: &Metrics,
        prefetch_count: u16,
    ) -> Result<Channel, ChannelError> {
        let channel = Self::open(connection, metrics).await?;

        info!(prefetch_count, "Configuring channel QoS");

        channel
            .basic_qos(prefetch_count, Default::default())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to configure channel QoS");
                ChannelError::QoSConfigurationFailed(e.to_string())
            })?;

        info!(
            channel_id = channel.id(),
            prefetch_count, "Channel QoS configured successfully"
        );

        Ok(channel)
    }

    /// Channel in publisher-confirm mode.
    pub async fn create_confirm_channel(
        connection: &Connection,
        metrics: &Metrics,
    ) -> Result<Channel, ChannelError> {
        let channel = Self::open(connection, metrics).await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to enable publisher confirms");
                ChannelError::ConfirmSelectFailed(e.to_string())
            })?;

        info!(channel_id = channel.id(), "Publisher confirms enabled");

        Ok(channel)
    }

    pub async fn close_channel(channel: Channel, metrics: &Metrics) -> Result<(), ChannelError> {
        let channel_id = channel.id();
        info!(channel_id, "Closing RabbitMQ channel");

        metrics.channels.dec();
        channel.close(200, "Normal shutdown").await.map_err(|e| {
            error!(error = %e, channel_id, "Failed to close channel gracefully");
            ChannelError::CloseFailed(e.to_string())
        })?;

        info!(channel_id, "Channel closed successfully");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to create channel: {0}")]
    CreationFailed(String),

    #[error("Failed to configure channel QoS: {0}")]
    QoSConfigurationFailed(String),

    #[error("Failed to enable publisher confirms: {0}")]
    ConfirmSelectFailed(String),

    #[error("Failed to close channel: {0}")]
    CloseFailed(String),
}
