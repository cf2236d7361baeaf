//! ABOUTME: WorkflowEvent — the five event kinds produced by the Pilot orchestrator
//! ABOUTME: Grounded on llmspell-events' UniversalEvent: language-agnostic, ordered, correlated

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The five event kinds named in spec.md §6 "Event bus (produced)".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StepStarted,
    StepCompleted,
    StepFailed,
    ExecutionCompleted,
    ExecutionError,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionError => "execution_error",
        }
    }
}

/// One emitted event. Carries execution id, agent id, step index, step id,
/// step name, duration, and either `result` or `error` — exactly the
/// attributes spec.md §6 requires of every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub execution_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub step_index: Option<usize>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub step_name: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub sequence: u64,
}

impl WorkflowEvent {
    #[must_use]
    pub fn new(kind: EventKind, execution_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            execution_id: execution_id.into(),
            agent_id: agent_id.into(),
            step_index: None,
            step_id: None,
            step_name: None,
            duration_ms: None,
            result: None,
            error: None,
            timestamp: chrono::Utc::now(),
            sequence: SEQUENCE_COUNTER.fetch_add(1, Ordering::SeqCst),
        }
    }

    #[must_use]
    pub fn with_step(mut self, index: usize, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.step_index = Some(index);
        self.step_id = Some(id.into());
        self.step_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
