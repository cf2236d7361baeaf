//! ABOUTME: pilot-testing - shared mock collaborators and workflow fixtures for Pilot's test suites
//! ABOUTME: Never depended on by non-test code; wired in as a dev-dependency only

pub mod fixtures;
pub mod mock_durable_store;
pub mod mock_llm_client;
pub mod mock_memory_provider;
pub mod mock_notification;
pub mod mock_plugin_runtime;

pub use mock_durable_store::MockDurableStore;
pub use mock_llm_client::MockLlmClient;
pub use mock_memory_provider::MockMemoryProvider;
pub use mock_notification::{MockNotificationChannel, SentNotification};
pub use mock_plugin_runtime::{ok_result, MockPluginRuntime, ScriptedAction};
