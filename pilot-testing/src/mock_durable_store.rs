//! ABOUTME: MockDurableStore — in-memory DurableStore for orchestrator tests

use async_trait::async_trait;
use parking_lot::RwLock;
use pilot_core::traits::{DurableStore, ExecutionRecord};
use pilot_core::{ApprovalRequest, PilotError, StepOutput, TokenUsage};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Default)]
pub struct MockDurableStore {
    executions: RwLock<HashMap<String, ExecutionRecord>>,
    steps: RwLock<Vec<(String, StepOutput)>>,
    approvals: RwLock<Vec<ApprovalRequest>>,
    token_usage: RwLock<Vec<(String, String, TokenUsage, bool)>>,
    checkpoints: RwLock<HashMap<String, Value>>,
}

impl MockDurableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.executions.read().get(execution_id).cloned()
    }

    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.read().len()
    }

    #[must_use]
    pub fn approvals(&self) -> Vec<ApprovalRequest> {
        self.approvals.read().clone()
    }

    #[must_use]
    pub fn token_usage(&self) -> Vec<(String, String, TokenUsage, bool)> {
        self.token_usage.read().clone()
    }
}

#[async_trait]
impl DurableStore for MockDurableStore {
    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), PilotError> {
        self.executions.write().insert(record.execution_id.clone(), record.clone());
        Ok(())
    }

    async fn record_step(&self, execution_id: &str, output: &StepOutput) -> Result<(), PilotError> {
        self.steps.write().push((execution_id.to_string(), output.clone()));
        Ok(())
    }

    async fn record_approval(&self, request: &ApprovalRequest) -> Result<(), PilotError> {
        self.approvals.write().push(request.clone());
        Ok(())
    }

    async fn record_token_usage(&self, execution_id: &str, step_id: &str, usage: TokenUsage, plugin_equivalent: bool) -> Result<(), PilotError> {
        self.token_usage.write().push((execution_id.to_string(), step_id.to_string(), usage, plugin_equivalent));
        Ok(())
    }

    async fn load_checkpoint(&self, execution_id: &str) -> Result<Option<Value>, PilotError> {
        Ok(self.checkpoints.read().get(execution_id).cloned())
    }

    async fn save_checkpoint(&self, execution_id: &str, snapshot: Value) -> Result<(), PilotError> {
        self.checkpoints.write().insert(execution_id.to_string(), snapshot);
        Ok(())
    }
}
