//! ABOUTME: StateManager trait and an in-memory reference Checkpointer
//! ABOUTME: Grounded on llmspell-state-persistence::manager::StateManager

use async_trait::async_trait;
use parking_lot::RwLock;
use pilot_core::{PilotError, StepOutput};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Workflow-level execution status (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// A point-in-time snapshot of per-run state, enough to resume from
/// (spec.md §4.9 "enabling resume from the most recent good state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub execution_id: String,
    pub sequence: u64,
    pub snapshot: Value,
    pub taken_at: chrono::DateTime<chrono::Utc>,
}

/// Creates execution records, logs per-step start/completion/failure with
/// metadata, writes periodic context checkpoints, updates workflow-level
/// status, and supports resumption by loading the most recent checkpoint.
#[async_trait]
pub trait StateManager: Send + Sync {
    async fn create_execution(&self, execution_id: &str, agent_id: &str) -> Result<(), PilotError>;
    async fn set_status(&self, execution_id: &str, status: WorkflowStatus) -> Result<(), PilotError>;
    async fn status(&self, execution_id: &str) -> Result<Option<WorkflowStatus>, PilotError>;

    async fn log_step_start(&self, execution_id: &str, step_id: &str) -> Result<(), PilotError>;
    async fn log_step_result(&self, execution_id: &str, output: &StepOutput) -> Result<(), PilotError>;
    async fn step_status(&self, execution_id: &str, step_id: &str) -> Result<Option<StepStatus>, PilotError>;

    /// Snapshot the current run state. Called after every successful step,
    /// and in a batch after parallel groups (spec.md §4.9).
    async fn checkpoint(&self, execution_id: &str, snapshot: Value) -> Result<(), PilotError>;

    /// Most recent checkpoint for `execution_id`, if any.
    async fn latest_checkpoint(&self, execution_id: &str) -> Result<Option<ContextSnapshot>, PilotError>;
}

#[derive(Default)]
struct ExecutionRow {
    agent_id: String,
    status: WorkflowStatus,
    steps: HashMap<String, StepStatus>,
    checkpoints: Vec<ContextSnapshot>,
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        Self::Running
    }
}

/// In-memory reference `StateManager`. A production deployment swaps this
/// for an adapter over the durable store (spec.md §6); this implementation
/// exists so the orchestrator and its tests don't require one.
pub struct InMemoryStateManager {
    rows: RwLock<HashMap<String, ExecutionRow>>,
}

impl InMemoryStateManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateManager for InMemoryStateManager {
    async fn create_execution(&self, execution_id: &str, agent_id: &str) -> Result<(), PilotError> {
        self.rows.write().insert(
            execution_id.to_string(),
            ExecutionRow {
                agent_id: agent_id.to_string(),
                status: WorkflowStatus::Running,
                steps: HashMap::new(),
                checkpoints: Vec::new(),
            },
        );
        Ok(())
    }

    async fn set_status(&self, execution_id: &str, status: WorkflowStatus) -> Result<(), PilotError> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(execution_id)
            .ok_or_else(|| PilotError::Storage {
                message: format!("unknown execution {execution_id}"),
            })?;
        row.status = status;
        debug!(execution_id, ?status, "workflow status updated");
        Ok(())
    }

    async fn status(&self, execution_id: &str) -> Result<Option<WorkflowStatus>, PilotError> {
        Ok(self.rows.read().get(execution_id).map(|r| r.status))
    }

    async fn log_step_start(&self, execution_id: &str, step_id: &str) -> Result<(), PilotError> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(execution_id)
            .ok_or_else(|| PilotError::Storage {
                message: format!("unknown execution {execution_id}"),
            })?;
        row.steps.insert(step_id.to_string(), StepStatus::Running);
        Ok(())
    }

    async fn log_step_result(&self, execution_id: &str, output: &StepOutput) -> Result<(), PilotError> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(execution_id)
            .ok_or_else(|| PilotError::Storage {
                message: format!("unknown execution {execution_id}"),
            })?;
        let status = if output.metadata.success {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        row.steps.insert(output.step_id.clone(), status);
        Ok(())
    }

    async fn step_status(&self, execution_id: &str, step_id: &str) -> Result<Option<StepStatus>, PilotError> {
        Ok(self
            .rows
            .read()
            .get(execution_id)
            .and_then(|r| r.steps.get(step_id).copied()))
    }

    async fn checkpoint(&self, execution_id: &str, snapshot: Value) -> Result<(), PilotError> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(execution_id)
            .ok_or_else(|| PilotError::Storage {
                message: format!("unknown execution {execution_id}"),
            })?;
        let sequence = row.checkpoints.len() as u64;
        row.checkpoints.push(ContextSnapshot {
            execution_id: execution_id.to_string(),
            sequence,
            snapshot,
            taken_at: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn latest_checkpoint(&self, execution_id: &str) -> Result<Option<ContextSnapshot>, PilotError> {
        Ok(self
            .rows
            .read()
            .get(execution_id)
            .and_then(|r| r.checkpoints.last().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn checkpoint_then_latest_roundtrips() {
        let manager = InMemoryStateManager::new();
        manager.create_execution("exec1", "agent1").await.unwrap();
        manager
            .checkpoint("exec1", serde_json::json!({"completed": ["a"]}))
            .await
            .unwrap();
        manager
            .checkpoint("exec1", serde_json::json!({"completed": ["a", "b"]}))
            .await
            .unwrap();

        let latest = manager.latest_checkpoint("exec1").await.unwrap().unwrap();
        assert_eq!(latest.sequence, 1);
        assert_eq!(latest.snapshot["completed"][1], "b");
    }

    #[tokio::test]
    async fn step_result_updates_status() {
        let manager = InMemoryStateManager::new();
        manager.create_execution("exec1", "agent1").await.unwrap();
        manager.log_step_start("exec1", "s1").await.unwrap();
        assert_eq!(
            manager.step_status("exec1", "s1").await.unwrap(),
            Some(StepStatus::Running)
        );

        let output = StepOutput::success("s1", "system", "delay", serde_json::json!({}), Duration::from_millis(1));
        manager.log_step_result("exec1", &output).await.unwrap();
        assert_eq!(
            manager.step_status("exec1", "s1").await.unwrap(),
            Some(StepStatus::Completed)
        );
    }

    #[tokio::test]
    async fn unknown_execution_is_an_error() {
        let manager = InMemoryStateManager::new();
        let err = manager.set_status("missing", WorkflowStatus::Completed).await;
        assert!(err.is_err());
    }
}
