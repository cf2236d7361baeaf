//! ABOUTME: Shared types, error taxonomy, and external-collaborator traits for Pilot
//! ABOUTME: Foundation layer: no execution logic lives here, only the data model and seams

pub mod error;
pub mod ids;
pub mod traits;
pub mod types;

pub use error::{ErrorCode, PilotError, Result};
pub use ids::ExecutionId;
pub use types::{
    Agent, ApprovalDecision, ApprovalPolicy, ApprovalRequest, ApprovalResponse, ApprovalStatus,
    GatherConfig, GatherOperation, NormalizationMeta, RetryPolicy, RunMode, ScatterConfig,
    StepKind, StepOutput, StepOutputMetadata, SwitchCase, TimeoutAction, TokenUsage, WorkflowStep,
};
