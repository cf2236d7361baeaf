//! ABOUTME: Central configuration management for the Pilot workflow engine
//! ABOUTME: TOML file discovery, parsing, and environment variable overrides; grounded on llmspell-config

use pilot_core::PilotError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Configuration file discovery order, relative to the process cwd.
const CONFIG_SEARCH_PATHS: &[&str] = &["pilot.toml", ".pilot.toml", "config/pilot.toml"];

/// Environment variable prefix for overrides, e.g. `PILOT_MAX_PARALLEL_STEPS`.
const ENV_PREFIX: &str = "PILOT_";

/// The exact set of configuration keys spec.md §6 "Configuration" lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PilotConfig {
    #[serde(default = "default_true")]
    pub pilot_enabled: bool,
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enable_caching: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default = "default_true")]
    pub enable_progress_tracking: bool,
    #[serde(default)]
    pub enable_real_time_updates: bool,
    #[serde(default)]
    pub enable_optimizations: bool,
    #[serde(default = "default_memory_load_timeout_ms")]
    pub memory_load_timeout_ms: u64,
    #[serde(default = "default_calculator_tokens_per_plugin")]
    pub calculator_tokens_per_plugin: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_parallel_steps() -> usize {
    3
}
fn default_timeout_secs() -> u64 {
    5 * 60
}
fn default_memory_load_timeout_ms() -> u64 {
    10_000
}
fn default_calculator_tokens_per_plugin() -> u64 {
    400
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            pilot_enabled: default_true(),
            max_parallel_steps: default_max_parallel_steps(),
            default_timeout_secs: default_timeout_secs(),
            enable_caching: default_true(),
            continue_on_error: false,
            enable_progress_tracking: default_true(),
            enable_real_time_updates: false,
            enable_optimizations: false,
            memory_load_timeout_ms: default_memory_load_timeout_ms(),
            calculator_tokens_per_plugin: default_calculator_tokens_per_plugin(),
        }
    }
}

impl PilotConfig {
    #[must_use]
    pub fn default_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.default_timeout_secs)
    }

    #[must_use]
    pub fn memory_load_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.memory_load_timeout_ms)
    }

    /// Load from the first discoverable config file (see
    /// `CONFIG_SEARCH_PATHS`), falling back to defaults if none exist, then
    /// apply environment variable overrides.
    pub fn load() -> Result<Self, PilotError> {
        let mut config = CONFIG_SEARCH_PATHS
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
            .map(Self::from_file)
            .transpose()?
            .unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, PilotError> {
        let text = std::fs::read_to_string(path).map_err(|e| PilotError::Configuration {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        toml::from_str(&text).map_err(|e| PilotError::Configuration {
            message: format!("failed to parse {}: {e}", path.display()),
        })
    }

    /// Overlay `PILOT_*` environment variables onto an already-loaded
    /// config. Unset or unparseable variables are left untouched (a
    /// malformed override should not crash config loading).
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("PILOT_ENABLED") {
            self.pilot_enabled = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_PARALLEL_STEPS") {
            self.max_parallel_steps = v;
        }
        if let Some(v) = env_parse::<u64>("DEFAULT_TIMEOUT_SECS") {
            self.default_timeout_secs = v;
        }
        if let Some(v) = env_bool("ENABLE_CACHING") {
            self.enable_caching = v;
        }
        if let Some(v) = env_bool("CONTINUE_ON_ERROR") {
            self.continue_on_error = v;
        }
        if let Some(v) = env_bool("ENABLE_PROGRESS_TRACKING") {
            self.enable_progress_tracking = v;
        }
        if let Some(v) = env_bool("ENABLE_REAL_TIME_UPDATES") {
            self.enable_real_time_updates = v;
        }
        if let Some(v) = env_bool("ENABLE_OPTIMIZATIONS") {
            self.enable_optimizations = v;
        }
        if let Some(v) = env_parse::<u64>("MEMORY_LOAD_TIMEOUT_MS") {
            self.memory_load_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("CALCULATOR_TOKENS_PER_PLUGIN") {
            self.calculator_tokens_per_plugin = v;
        }
    }
}

fn env_bool(suffix: &str) -> Option<bool> {
    env_parse::<String>(suffix).and_then(|v| match v.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    })
}

fn env_parse<T: std::str::FromStr>(suffix: &str) -> Option<T> {
    let key = format!("{ENV_PREFIX}{suffix}");
    match std::env::var(&key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                debug!(key = %key, raw = %raw, "ignoring unparseable env override");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_match_spec() {
        let config = PilotConfig::default();
        assert!(config.pilot_enabled);
        assert_eq!(config.max_parallel_steps, 3);
        assert_eq!(config.default_timeout_secs, 300);
        assert_eq!(config.memory_load_timeout_ms, 10_000);
        assert_eq!(config.calculator_tokens_per_plugin, 400);
    }

    #[test]
    fn from_file_parses_partial_toml_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "maxParallelSteps = 8").unwrap();
        let config = PilotConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_parallel_steps, 8);
        assert!(config.enable_caching); // untouched key keeps its default
    }

    #[test]
    #[serial]
    fn env_override_takes_precedence() {
        std::env::set_var("PILOT_MAX_PARALLEL_STEPS", "16");
        let mut config = PilotConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.max_parallel_steps, 16);
        std::env::remove_var("PILOT_MAX_PARALLEL_STEPS");
    }

    #[test]
    #[serial]
    fn malformed_env_override_is_ignored() {
        std::env::set_var("PILOT_MAX_PARALLEL_STEPS", "not-a-number");
        let mut config = PilotConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.max_parallel_steps, 3);
        std::env::remove_var("PILOT_MAX_PARALLEL_STEPS");
    }
}
