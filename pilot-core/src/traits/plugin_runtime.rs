//! ABOUTME: PluginRuntime trait — the external plugin execution collaborator
//! ABOUTME: Consumed by the StepExecutor for `action` steps; never implemented in this crate

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// One parameter's JSON-schema-like description, as returned by
/// `PluginRuntime::get_plugin_definition`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActionDefinition {
    pub parameters: std::collections::HashMap<String, ParameterSchema>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PluginDefinition {
    pub actions: std::collections::HashMap<String, ActionDefinition>,
}

/// Outcome of a single plugin invocation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PluginResult {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// The plugin runtime (spec.md §6): executes named `plugin.action(params)`
/// and returns JSON. Out of scope for this crate — only the interface is
/// specified; a real implementation lives in the surrounding product.
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    async fn execute(
        &self,
        user_id: &str,
        plugin: &str,
        action: &str,
        params: Value,
    ) -> Result<PluginResult>;

    async fn get_plugin_definition(&self, plugin: &str) -> Result<PluginDefinition>;
}
