//! ABOUTME: StateManager and Checkpointer for the Pilot workflow engine
//! ABOUTME: Grounded on llmspell-state-persistence::manager — per-execution status and checkpoint snapshots

mod manager;
mod retry;

pub use manager::{InMemoryStateManager, StateManager, StepStatus, WorkflowStatus};
pub use retry::write_with_retry;
