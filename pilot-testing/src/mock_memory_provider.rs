//! ABOUTME: MockMemoryProvider — returns a scripted or default memory context

use async_trait::async_trait;
use parking_lot::RwLock;
use pilot_core::traits::MemoryProvider;
use pilot_core::PilotError;
use serde_json::Value;

#[derive(Default)]
pub struct MockMemoryProvider {
    context: RwLock<Option<Value>>,
    delay: RwLock<Option<std::time::Duration>>,
}

impl MockMemoryProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_context(&self, context: Value) {
        *self.context.write() = Some(context);
    }

    /// Simulates a slow memory backend, to exercise the orchestrator's
    /// `memoryLoadTimeoutMs` timeout path.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.write() = Some(delay);
    }
}

#[async_trait]
impl MemoryProvider for MockMemoryProvider {
    async fn load_context(&self, _user_id: &str, _session_id: &str) -> Result<Value, PilotError> {
        if let Some(delay) = *self.delay.read() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.context.read().clone().unwrap_or_else(|| serde_json::json!({})))
    }
}
