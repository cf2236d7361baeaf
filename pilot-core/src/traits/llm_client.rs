//! ABOUTME: LlmClient trait — the external LLM invocation collaborator
//! ABOUTME: Consumed by the StepExecutor for ai_processing/llm_decision steps

use crate::types::TokenUsage;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// A tool call the LLM chose to make, echoed back for the caller to
/// interpret (the Pilot only decides whether to hide plugins from the
/// model, per spec.md §4.5; it does not itself execute tool calls here).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LlmResponse {
    pub success: bool,
    pub response: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub tokens_used: TokenUsage,
    #[serde(default)]
    pub error: Option<String>,
}

/// Extra context threaded alongside the prompt: whether plugins are
/// exposed to the model, and the declared output schema (if any).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LlmExtras {
    #[serde(default)]
    pub expose_plugins: bool,
    #[serde(default)]
    pub output_schema: Option<Value>,
}

/// The LLM client (spec.md §6). Model selection is the client's concern;
/// the Pilot only chooses whether to hide plugins.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn run(
        &self,
        user_id: &str,
        agent_id: &str,
        prompt: &str,
        extras: LlmExtras,
        session_id: &str,
    ) -> Result<LlmResponse>;
}
