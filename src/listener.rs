use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::gate::CompletionGate;
use crate::messaging::{HandlerError, MessageHandler};

/// Prints every test message it receives and counts the gate down.
pub struct TestMessageListener {
    gate: Arc<CompletionGate>,
}

impl TestMessageListener {
    pub fn new(gate: Arc<CompletionGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl MessageHandler for TestMessageListener {
    async fn handle(&self, routing_key: &str, body: &[u8]) -> Result<(), HandlerError> {
        let payload = String::from_utf8_lossy(body);

        println!("Received: {}", payload);
        info!(routing_key, payload = %payload, "Test message received");

        self.gate.count_down();
        Ok(())
    }
}
