//! ABOUTME: StepCache — memoizes cacheable step outputs across an execution
//! ABOUTME: Grounded on spec.md §4.5 "caching"; keyed by step id, kind name, and a params fingerprint

use parking_lot::RwLock;
use pilot_core::StepOutput;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// A deterministic fingerprint of a step's effective parameters, used so
/// that re-planning the same step with the same inputs hits the cache
/// even across retries within one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    step_id: String,
    kind: &'static str,
    params_fingerprint: u64,
}

impl CacheKey {
    #[must_use]
    pub fn new(step_id: impl Into<String>, kind: &'static str, params: &serde_json::Value) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        canonical_json(params).hash(&mut hasher);
        Self {
            step_id: step_id.into(),
            kind,
            params_fingerprint: hasher.finish(),
        }
    }
}

/// Renders a `Value` into a key-sorted canonical string so that
/// semantically-identical objects with differently-ordered keys fingerprint
/// identically.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            let body: Vec<String> = entries.iter().map(|(k, v)| format!("{k:?}:{}", canonical_json(v))).collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(arr) => {
            let body: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Bounded, in-memory cache of cacheable step outputs for a single
/// execution (spec.md §4.5: only steps where `StepKind::is_cacheable()`
/// participate). Not shared across executions.
#[derive(Default)]
pub struct StepCache {
    entries: RwLock<HashMap<CacheKey, StepOutput>>,
}

impl StepCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<StepOutput> {
        self.entries.read().get(key).cloned()
    }

    pub fn put(&self, key: CacheKey, output: StepOutput) {
        self.entries.write().insert(key, output);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn same_params_produce_same_key_regardless_of_field_order() {
        let a = CacheKey::new("s1", "Action", &serde_json::json!({"x": 1, "y": 2}));
        let b = CacheKey::new("s1", "Action", &serde_json::json!({"y": 2, "x": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn different_params_produce_different_keys() {
        let a = CacheKey::new("s1", "Action", &serde_json::json!({"x": 1}));
        let b = CacheKey::new("s1", "Action", &serde_json::json!({"x": 2}));
        assert_ne!(a, b);
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = StepCache::new();
        let key = CacheKey::new("s1", "Action", &serde_json::json!({}));
        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), StepOutput::success("s1", "p", "a", serde_json::json!(1), Duration::from_millis(1)));
        assert!(cache.get(&key).is_some());
        assert_eq!(cache.len(), 1);
    }
}
