//! ABOUTME: MockLlmClient — scripted LLM responses for ai_processing/llm_decision tests

use async_trait::async_trait;
use parking_lot::RwLock;
use pilot_core::traits::{LlmClient, LlmExtras, LlmResponse};
use pilot_core::{PilotError, TokenUsage};
use std::collections::VecDeque;

/// Returns scripted responses in order, one per call; once exhausted it
/// falls back to a single-word echo of the prompt.
#[derive(Default)]
pub struct MockLlmClient {
    scripted: RwLock<VecDeque<LlmResponse>>,
    calls: RwLock<Vec<(String, String)>>,
}

impl MockLlmClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, response: LlmResponse) {
        self.scripted.write().push_back(response);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.read().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn run(&self, _user_id: &str, agent_id: &str, prompt: &str, _extras: LlmExtras, _session_id: &str) -> Result<LlmResponse, PilotError> {
        self.calls.write().push((agent_id.to_string(), prompt.to_string()));
        if let Some(response) = self.scripted.write().pop_front() {
            return Ok(response);
        }
        Ok(LlmResponse {
            success: true,
            response: format!("echo: {prompt}"),
            tool_calls: Vec::new(),
            tokens_used: TokenUsage::total_only(10),
            error: None,
        })
    }
}
