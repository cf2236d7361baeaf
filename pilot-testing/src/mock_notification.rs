//! ABOUTME: MockNotificationChannel — records every notification sent during a test run

use async_trait::async_trait;
use parking_lot::RwLock;
use pilot_core::traits::NotificationChannel;
use pilot_core::PilotError;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct SentNotification {
    pub channel_type: String,
    pub channel_config: Value,
    pub payload: Value,
}

#[derive(Default)]
pub struct MockNotificationChannel {
    sent: RwLock<Vec<SentNotification>>,
    fail_next: RwLock<bool>,
}

impl MockNotificationChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.read().clone()
    }

    /// Makes the next `send` call fail, to exercise notification-failure
    /// paths without taking down a whole approval flow.
    pub fn fail_next_send(&self) {
        *self.fail_next.write() = true;
    }
}

#[async_trait]
impl NotificationChannel for MockNotificationChannel {
    async fn send(&self, channel_type: &str, channel_config: &Value, payload: &Value) -> Result<(), PilotError> {
        if std::mem::take(&mut *self.fail_next.write()) {
            return Err(PilotError::Internal { message: "simulated notification failure".to_string() });
        }
        self.sent.write().push(SentNotification {
            channel_type: channel_type.to_string(),
            channel_config: channel_config.clone(),
            payload: payload.clone(),
        });
        Ok(())
    }
}
