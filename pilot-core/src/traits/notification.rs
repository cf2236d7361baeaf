//! ABOUTME: NotificationChannel trait — the external approval-notification collaborator

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Generic `send(channelType, channelConfig, payload)` notification sink
/// (spec.md §6), used by the Orchestrator to notify approvers.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, channel_type: &str, channel_config: &Value, payload: &Value) -> Result<()>;
}
