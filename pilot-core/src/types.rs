//! ABOUTME: Core data model — Agent, WorkflowStep, StepOutput, ApprovalRequest
//! ABOUTME: Tagged-variant definitions matching the closed set of step kinds

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Retry policy applied to a single step.
///
/// Mirrors the teacher's `RetryPolicy` (`llmspell-core::traits::workflow`),
/// generalized with a `retryable_only` flag so the executor can distinguish
/// transient failures (network blips) from ones no amount of retrying fixes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_seconds: u32,
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_seconds: 1,
            exponential_backoff: true,
        }
    }
}

/// Approval policy for `human_approval` steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    Any,
    All,
    Majority,
}

/// Action taken when an `ApprovalRequest` expires without enough responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Approve,
    Reject,
    Escalate,
}

/// Gather operation for `scatter_gather` steps. Per spec.md §9 Open
/// Questions, only `Collect` is specified by the source; see
/// `DESIGN.md` for the recorded decision on extending this set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatherOperation {
    #[default]
    Collect,
}

/// Inner scatter configuration for a `scatter_gather` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatterConfig {
    /// `{{…}}` reference or literal array resolved against the context.
    pub input: Value,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "default_item_name")]
    pub item_name: String,
}

fn default_item_name() -> String {
    "item".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatherConfig {
    #[serde(default)]
    pub operation: GatherOperation,
}

/// Closed set of switch-case targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub when: String,
    pub steps: Vec<String>,
}

/// Kind-specific attributes for each of the fifteen closed step kinds.
///
/// Tagged as an internally-tagged enum (`kind`) so a raw JSON workflow
/// definition deserializes directly into a `StepKind`, matching the
/// "dynamic-structure outputs → tagged variants" design note.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Action {
        plugin: String,
        action: String,
        #[serde(default)]
        params: Value,
    },
    AiProcessing {
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        output_schema: Option<Value>,
    },
    LlmDecision {
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        output_schema: Option<Value>,
    },
    Conditional {
        condition: Value,
        #[serde(default)]
        then_steps: Vec<WorkflowStep>,
        #[serde(default)]
        else_steps: Vec<WorkflowStep>,
    },
    Switch {
        evaluate: String,
        cases: Vec<SwitchCase>,
        #[serde(default)]
        default: Option<Vec<String>>,
    },
    Loop {
        iterate_over: Value,
        loop_steps: Vec<WorkflowStep>,
        #[serde(default)]
        parallel: bool,
        #[serde(default = "default_item_name")]
        item_name: String,
    },
    ParallelGroup {
        steps: Vec<String>,
    },
    ScatterGather {
        scatter: ScatterConfig,
        gather: GatherConfig,
    },
    SubWorkflow {
        #[serde(default)]
        workflow_id: Option<String>,
        #[serde(default)]
        workflow_steps: Option<Vec<WorkflowStep>>,
        #[serde(default)]
        input_mapping: HashMap<String, String>,
        #[serde(default)]
        output_mapping: Option<HashMap<String, String>>,
        #[serde(default)]
        inherit_unmapped_variables: bool,
        #[serde(default)]
        timeout: Option<Duration>,
    },
    HumanApproval {
        approvers: Vec<String>,
        #[serde(default)]
        policy: Option<ApprovalPolicy>,
        title: String,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        timeout_action: Option<TimeoutAction>,
        #[serde(default)]
        escalation_targets: Vec<String>,
    },
    Transform {
        operation: String,
        input: Value,
        #[serde(default)]
        config: Value,
    },
    Delay {
        #[serde(default)]
        duration: Option<Duration>,
    },
    Enrichment {
        #[serde(default)]
        config: Value,
    },
    Validation {
        #[serde(default)]
        schema: Option<Value>,
        #[serde(default)]
        rules: Option<Value>,
    },
    Comparison {
        left: Value,
        right: Value,
        operation: String,
    },
}

impl StepKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Action { .. } => "action",
            Self::AiProcessing { .. } => "ai_processing",
            Self::LlmDecision { .. } => "llm_decision",
            Self::Conditional { .. } => "conditional",
            Self::Switch { .. } => "switch",
            Self::Loop { .. } => "loop",
            Self::ParallelGroup { .. } => "parallel_group",
            Self::ScatterGather { .. } => "scatter_gather",
            Self::SubWorkflow { .. } => "sub_workflow",
            Self::HumanApproval { .. } => "human_approval",
            Self::Transform { .. } => "transform",
            Self::Delay { .. } => "delay",
            Self::Enrichment { .. } => "enrichment",
            Self::Validation { .. } => "validation",
            Self::Comparison { .. } => "comparison",
        }
    }

    /// Whether two steps of this kind, at the same level with no mutual
    /// dependency, may be placed in the same parallel group.
    #[must_use]
    pub fn can_run_in_parallel(&self) -> bool {
        match self {
            Self::Action { .. } | Self::Transform { .. } => true,
            Self::Loop { parallel, .. } => *parallel,
            _ => false,
        }
    }

    /// LLM-bearing step kinds, delegated to the orchestration handler when
    /// orchestration is active (spec.md §4.5 step 2).
    #[must_use]
    pub fn is_llm_bearing(&self) -> bool {
        matches!(self, Self::AiProcessing { .. } | Self::LlmDecision { .. })
    }

    /// Cacheable step kinds (spec.md §4.5 step 1).
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            Self::Action { .. } | Self::Transform { .. } | Self::Validation { .. } | Self::Comparison { .. }
        )
    }
}

/// One step in a workflow: kind-specific attributes plus the common
/// attributes every step carries regardless of kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub execute_if: Option<Value>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    #[serde(default)]
    pub output_variable: Option<String>,
}

impl WorkflowStep {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            dependencies: Vec::new(),
            execute_if: None,
            retry_policy: None,
            continue_on_error: false,
            outputs: HashMap::new(),
            output_variable: None,
        }
    }

    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }
}

/// Run mode, threaded through `ExecutionContext`. `Calibration` pauses on
/// parameter errors instead of failing (spec.md §4.8 "Pause and resume").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Calibration,
    Production,
    BatchCalibration,
}

/// Token usage, either a bare total or a prompt/completion split.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub total: u64,
    pub prompt: u64,
    pub completion: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn total_only(total: u64) -> Self {
        Self {
            total,
            prompt: 0,
            completion: 0,
        }
    }

    #[must_use]
    pub fn add(self, other: Self) -> Self {
        Self {
            total: self.total + other.total,
            prompt: self.prompt + other.prompt,
            completion: self.completion + other.completion,
        }
    }
}

/// Metadata accompanying a `StepOutput`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutputMetadata {
    pub success: bool,
    pub executed_at: chrono::DateTime<chrono::Utc>,
    pub execution_time: Duration,
    #[serde(default)]
    pub item_count: Option<usize>,
    #[serde(default)]
    pub tokens_used: Option<TokenUsage>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// Normalization trace recorded by the `OutputNormalizer`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NormalizationMeta {
    pub normalized: bool,
    #[serde(default)]
    pub key_mappings: HashMap<String, String>,
    #[serde(default)]
    pub wrapped_keys: Vec<String>,
    #[serde(default)]
    pub json_parsed_keys: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// The recorded result of one step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_id: String,
    /// Producing plugin id, or `"system"` for non-plugin step kinds.
    pub plugin: String,
    /// Producing action, or the step kind name.
    pub action: String,
    pub data: Value,
    #[serde(default)]
    pub raw: Option<Value>,
    #[serde(default)]
    pub meta: NormalizationMeta,
    pub metadata: StepOutputMetadata,
}

impl StepOutput {
    #[must_use]
    pub fn success(step_id: impl Into<String>, plugin: impl Into<String>, action: impl Into<String>, data: Value, execution_time: Duration) -> Self {
        Self {
            step_id: step_id.into(),
            plugin: plugin.into(),
            action: action.into(),
            data,
            raw: None,
            meta: NormalizationMeta::default(),
            metadata: StepOutputMetadata {
                success: true,
                executed_at: chrono::Utc::now(),
                execution_time,
                item_count: None,
                tokens_used: None,
                error: None,
                error_code: None,
            },
        }
    }

    #[must_use]
    pub fn failure(
        step_id: impl Into<String>,
        error: impl Into<String>,
        error_code: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            plugin: "system".to_string(),
            action: "error".to_string(),
            data: Value::Object(serde_json::Map::new()),
            raw: None,
            meta: NormalizationMeta::default(),
            metadata: StepOutputMetadata {
                success: false,
                executed_at: chrono::Utc::now(),
                execution_time,
                item_count: None,
                tokens_used: None,
                error: Some(error.into()),
                error_code: Some(error_code.into()),
            },
        }
    }
}

/// An agent: the static, externally-owned workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Legacy fallback list, preferred only when `steps` is empty.
    #[serde(default)]
    pub legacy_steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub output_schema: Option<HashMap<String, String>>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub user_prompt: Option<String>,
}

impl Agent {
    /// The preferred step list per spec.md §4.8 step 3: `steps` if
    /// non-empty, otherwise the legacy fallback.
    #[must_use]
    pub fn preferred_steps(&self) -> &[WorkflowStep] {
        if self.steps.is_empty() {
            &self.legacy_steps
        } else {
            &self.steps
        }
    }
}

/// A single approver's decision on an `ApprovalRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approver_id: String,
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub comment: Option<String>,
    pub responded_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub delegated_from: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
    Escalated,
}

/// A pending human-approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub execution_id: String,
    pub step_id: String,
    pub approvers: Vec<String>,
    pub policy: ApprovalPolicy,
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub context: Value,
    pub status: ApprovalStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub responses: Vec<ApprovalResponse>,
    #[serde(default)]
    pub timeout_action: Option<TimeoutAction>,
    #[serde(default)]
    pub escalation_targets: Vec<String>,
}

impl ApprovalRequest {
    /// Resolve the current status from `policy` and `responses`, per
    /// spec.md §4.8 "Approval policy resolution". Returns `None` while the
    /// policy's threshold cannot yet be determined either way.
    #[must_use]
    pub fn resolve(&self) -> Option<ApprovalStatus> {
        let approvals = self
            .responses
            .iter()
            .filter(|r| r.decision == ApprovalDecision::Approve)
            .count();
        let rejections = self
            .responses
            .iter()
            .filter(|r| r.decision == ApprovalDecision::Reject)
            .count();
        let total = self.approvers.len();

        match self.policy {
            ApprovalPolicy::Any => {
                if approvals >= 1 {
                    Some(ApprovalStatus::Approved)
                } else if rejections == total {
                    Some(ApprovalStatus::Rejected)
                } else {
                    None
                }
            }
            ApprovalPolicy::All => {
                if rejections >= 1 {
                    Some(ApprovalStatus::Rejected)
                } else if approvals == total {
                    Some(ApprovalStatus::Approved)
                } else {
                    None
                }
            }
            ApprovalPolicy::Majority => {
                let threshold = total / 2 + 1;
                if approvals >= threshold {
                    Some(ApprovalStatus::Approved)
                } else if total - rejections < threshold {
                    // Remaining possible approvals can no longer reach the threshold.
                    Some(ApprovalStatus::Rejected)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn respond(id: &str, decision: ApprovalDecision) -> ApprovalResponse {
        ApprovalResponse {
            approver_id: id.to_string(),
            decision,
            comment: None,
            responded_at: chrono::Utc::now(),
            delegated_from: None,
        }
    }

    fn request(policy: ApprovalPolicy, approvers: &[&str]) -> ApprovalRequest {
        ApprovalRequest {
            id: "req1".to_string(),
            execution_id: "exec1".to_string(),
            step_id: "step1".to_string(),
            approvers: approvers.iter().map(|s| s.to_string()).collect(),
            policy,
            title: "Approve?".to_string(),
            message: None,
            context: Value::Null,
            status: ApprovalStatus::Pending,
            created_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now(),
            responses: Vec::new(),
            timeout_action: None,
            escalation_targets: Vec::new(),
        }
    }

    #[test]
    fn any_policy_approves_on_first_approval() {
        let mut req = request(ApprovalPolicy::Any, &["u1", "u2", "u3"]);
        req.responses.push(respond("u1", ApprovalDecision::Approve));
        assert_eq!(req.resolve(), Some(ApprovalStatus::Approved));
    }

    #[test]
    fn any_policy_rejects_when_all_reject() {
        let mut req = request(ApprovalPolicy::Any, &["u1", "u2", "u3"]);
        req.responses.push(respond("u1", ApprovalDecision::Reject));
        req.responses.push(respond("u2", ApprovalDecision::Reject));
        assert_eq!(req.resolve(), None);
        req.responses.push(respond("u3", ApprovalDecision::Reject));
        assert_eq!(req.resolve(), Some(ApprovalStatus::Rejected));
    }

    #[test]
    fn majority_policy_rejects_early_when_unreachable() {
        let mut req = request(ApprovalPolicy::Majority, &["u1", "u2", "u3"]);
        req.responses.push(respond("u1", ApprovalDecision::Reject));
        req.responses.push(respond("u2", ApprovalDecision::Reject));
        assert_eq!(req.resolve(), Some(ApprovalStatus::Rejected));
    }

    #[test]
    fn all_policy_requires_every_approver() {
        let mut req = request(ApprovalPolicy::All, &["u1", "u2"]);
        req.responses.push(respond("u1", ApprovalDecision::Approve));
        assert_eq!(req.resolve(), None);
        req.responses.push(respond("u2", ApprovalDecision::Approve));
        assert_eq!(req.resolve(), Some(ApprovalStatus::Approved));
    }

    #[test]
    fn preferred_steps_falls_back_to_legacy() {
        let agent = Agent {
            id: "a1".to_string(),
            name: "Agent".to_string(),
            steps: Vec::new(),
            legacy_steps: vec![WorkflowStep::new(
                "s1",
                "Step",
                StepKind::Delay { duration: None },
            )],
            output_schema: None,
            system_prompt: None,
            user_prompt: None,
        };
        assert_eq!(agent.preferred_steps().len(), 1);
    }
}
