//! ABOUTME: MemoryProvider trait — the optional external memory-context collaborator

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Loaded once per execution, under a hard timeout
/// (`memoryLoadTimeoutMs`); failure is non-fatal (spec.md §4.8 step 6).
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn load_context(&self, user_id: &str, session_id: &str) -> Result<Value>;
}
