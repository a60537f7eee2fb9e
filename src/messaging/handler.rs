use async_trait::async_trait;

/// Callback invoked once per delivery. Implementations may be called from
/// several tasks at once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, routing_key: &str, body: &[u8]) -> Result<(), HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Transient error (will requeue): {0}")]
    Transient(String),

    #[error("Permanent error (will not requeue): {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn requeue(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }
}
