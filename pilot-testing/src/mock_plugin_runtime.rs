//! ABOUTME: MockPluginRuntime — in-memory plugin runtime for workflow tests
//! ABOUTME: Grounded on llmspell-workflows::test_utils::MockStateAccess's tracked-call pattern

use async_trait::async_trait;
use parking_lot::RwLock;
use pilot_core::traits::{PluginDefinition, PluginResult, PluginRuntime};
use pilot_core::PilotError;
use serde_json::Value;
use std::collections::HashMap;

/// A scripted response for one `(plugin, action)` pair.
#[derive(Clone)]
pub struct ScriptedAction {
    pub result: PluginResult,
}

/// Records every call it receives and returns scripted responses,
/// defaulting to a generic success echoing the parameters back.
#[derive(Default)]
pub struct MockPluginRuntime {
    scripted: RwLock<HashMap<(String, String), ScriptedAction>>,
    calls: RwLock<Vec<(String, String, Value)>>,
    definitions: RwLock<HashMap<String, PluginDefinition>>,
}

impl MockPluginRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `""` tool name is treated specially by several upstream tests as an
    /// always-fails sentinel (mirroring the teacher's parallel/loop test
    /// suites), so `script` lets callers simulate both success and failure.
    pub fn script(&self, plugin: &str, action: &str, result: PluginResult) {
        self.scripted
            .write()
            .insert((plugin.to_string(), action.to_string()), ScriptedAction { result });
    }

    pub fn define(&self, plugin: &str, definition: PluginDefinition) {
        self.definitions.write().insert(plugin.to_string(), definition);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<(String, String, Value)> {
        self.calls.read().clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.read().len()
    }
}

#[async_trait]
impl PluginRuntime for MockPluginRuntime {
    async fn execute(
        &self,
        _user_id: &str,
        plugin: &str,
        action: &str,
        params: Value,
    ) -> Result<PluginResult, PilotError> {
        self.calls
            .write()
            .push((plugin.to_string(), action.to_string(), params.clone()));

        if plugin.is_empty() {
            return Ok(PluginResult {
                success: false,
                data: None,
                error: Some("empty plugin name".to_string()),
                message: Some("plugin not found".to_string()),
            });
        }

        if let Some(scripted) = self.scripted.read().get(&(plugin.to_string(), action.to_string())) {
            return Ok(scripted.result.clone());
        }

        Ok(PluginResult {
            success: true,
            data: Some(params),
            error: None,
            message: None,
        })
    }

    async fn get_plugin_definition(&self, plugin: &str) -> Result<PluginDefinition, PilotError> {
        self.definitions
            .read()
            .get(plugin)
            .cloned()
            .ok_or_else(|| PilotError::Plugin {
                message: format!("no definition registered for plugin {plugin}"),
            })
            .or_else(|_| {
                Ok(PluginDefinition {
                    actions: HashMap::new(),
                })
            })
    }
}

/// A bare success result echoing no data back, for tests that only care
/// whether a call was made.
#[must_use]
pub fn ok_result() -> PluginResult {
    PluginResult { success: true, data: None, error: None, message: None }
}

pub use pilot_core::traits::{ActionDefinition, ParameterSchema};
