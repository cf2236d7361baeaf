//! ABOUTME: Error taxonomy for the Pilot workflow engine
//! ABOUTME: Provides PilotError enum, stable ExecutionError codes, and the Result alias

use thiserror::Error;

/// Stable error codes for `PilotError::Execution`, referenced by operators
/// and surfaced verbatim in `StepOutput::metadata.error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    MissingPluginAction,
    UnknownStepType,
    InvalidStepType,
    InvalidInputType,
    MissingCondition,
    MissingOperation,
    MissingInputData,
    UnknownTransformOperation,
    UnknownComparisonOperation,
    SubWorkflowFailed,
    SubWorkflowTimeout,
    ApprovalRejected,
    ExecutionTimeout,
    WorkflowNotFound,
    StepExecutionFailed,
    LlmDecisionFailed,
    MissingParallelExecutor,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingPluginAction => "MISSING_PLUGIN_ACTION",
            Self::UnknownStepType => "UNKNOWN_STEP_TYPE",
            Self::InvalidStepType => "INVALID_STEP_TYPE",
            Self::InvalidInputType => "INVALID_INPUT_TYPE",
            Self::MissingCondition => "MISSING_CONDITION",
            Self::MissingOperation => "MISSING_OPERATION",
            Self::MissingInputData => "MISSING_INPUT_DATA",
            Self::UnknownTransformOperation => "UNKNOWN_TRANSFORM_OPERATION",
            Self::UnknownComparisonOperation => "UNKNOWN_COMPARISON_OPERATION",
            Self::SubWorkflowFailed => "SUB_WORKFLOW_FAILED",
            Self::SubWorkflowTimeout => "SUB_WORKFLOW_TIMEOUT",
            Self::ApprovalRejected => "APPROVAL_REJECTED",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::WorkflowNotFound => "WORKFLOW_NOT_FOUND",
            Self::StepExecutionFailed => "STEP_EXECUTION_FAILED",
            Self::LlmDecisionFailed => "LLM_DECISION_FAILED",
            Self::MissingParallelExecutor => "MISSING_PARALLEL_EXECUTOR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Comprehensive error enum for all Pilot operations.
///
/// `Validation` halts planning before any step runs. `Execution` carries a
/// `step_id` and a stable `code` so operators and the durable store can key
/// on it. `Condition` is raised only by the conditional evaluator.
#[derive(Debug, Error)]
pub enum PilotError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("execution error in step {step_id:?} ({code}): {message}")]
    Execution {
        message: String,
        step_id: Option<String>,
        code: ErrorCode,
    },

    #[error("condition error: {message}")]
    Condition { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("plugin runtime error: {message}")]
    Plugin { message: String },

    #[error("LLM provider error: {message}")]
    Provider { message: String },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl PilotError {
    #[must_use]
    pub fn execution(
        message: impl Into<String>,
        step_id: Option<impl Into<String>>,
        code: ErrorCode,
    ) -> Self {
        Self::Execution {
            message: message.into(),
            step_id: step_id.map(Into::into),
            code,
        }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn condition(message: impl Into<String>) -> Self {
        Self::Condition {
            message: message.into(),
        }
    }

    /// The stable error code, when this is an `Execution` variant.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Execution { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, PilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_displays_code_and_step() {
        let err = PilotError::execution("boom", Some("step1"), ErrorCode::StepExecutionFailed);
        let text = err.to_string();
        assert!(text.contains("STEP_EXECUTION_FAILED"));
        assert!(text.contains("step1"));
        assert_eq!(err.code(), Some(ErrorCode::StepExecutionFailed));
    }

    #[test]
    fn validation_error_has_no_code() {
        let err = PilotError::validation("missing id");
        assert_eq!(err.code(), None);
    }
}
