//! ABOUTME: DurableStore trait — the external persistence collaborator
//! ABOUTME: Consumed by StateManager/Checkpointer; backs the four logical tables in spec.md §6

use crate::types::{ApprovalRequest, StepOutput, TokenUsage};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// One row of `workflow_executions`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub agent_id: String,
    pub status: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub final_output: Option<Value>,
}

/// The durable store (spec.md §6): point-in-time snapshots, no assumed
/// cross-row transactionality. Out of scope for this crate.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn record_execution(&self, record: &ExecutionRecord) -> Result<()>;
    async fn record_step(&self, execution_id: &str, output: &StepOutput) -> Result<()>;
    async fn record_approval(&self, request: &ApprovalRequest) -> Result<()>;
    async fn record_token_usage(
        &self,
        execution_id: &str,
        step_id: &str,
        usage: TokenUsage,
        plugin_equivalent: bool,
    ) -> Result<()>;

    /// Load a previously checkpointed execution context snapshot, for
    /// `resume`. `None` when no checkpoint exists for this execution.
    async fn load_checkpoint(&self, execution_id: &str) -> Result<Option<Value>>;
    async fn save_checkpoint(&self, execution_id: &str, snapshot: Value) -> Result<()>;
}
