//! ABOUTME: External-collaborator traits — the narrow seams crossing out of the core
//! ABOUTME: See spec.md §6 "External Interfaces"; none of these are implemented in this crate

pub mod durable_store;
pub mod llm_client;
pub mod memory_provider;
pub mod notification;
pub mod plugin_runtime;

pub use durable_store::{DurableStore, ExecutionRecord};
pub use llm_client::{LlmClient, LlmExtras, LlmResponse, ToolCall};
pub use memory_provider::MemoryProvider;
pub use notification::NotificationChannel;
pub use plugin_runtime::{ActionDefinition, ParameterSchema, PluginDefinition, PluginResult, PluginRuntime};
