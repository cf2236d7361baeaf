//! ABOUTME: OutputNormalizer — coerces a plugin/LLM's raw response into StepOutput.data
//! ABOUTME: Grounded on spec.md §4.6; repairs near-miss JSON and excludes routing keys

use pilot_core::NormalizationMeta;
use serde_json::{Map, Value};

/// Keys that exist only to route a plugin's response (not payload), so
/// they are stripped from `data` before downstream steps see it (spec.md
/// §4.6 "routing-key exclusion").
const ROUTING_KEYS: &[&str] = &["__plugin", "__action", "__routing", "success", "error"];

/// Control-flow keys a step may emit to steer the planner (next step
/// overrides, loop continuation) — never part of the declared-outputs
/// payload, so they're stripped before the schema mapping runs (spec.md
/// §4.6 "declared-output mapping").
const CONTROL_KEYS: &[&str] = &["next_step", "is_last_step", "iteration_next_step", "after_loop_next_step"];

pub struct NormalizedOutput {
    pub data: Value,
    pub meta: NormalizationMeta,
}

/// Normalizes a raw plugin/LLM response:
/// 1. If it's already a plain JSON object/array/scalar, strip routing keys.
/// 2. If it's a string, try to parse it as JSON; on failure, attempt a
///    best-effort repair (trim code fences, fix trailing commas) and retry.
/// 3. Falls back to wrapping the raw text under `{"text": ...}`.
#[must_use]
pub fn normalize_step_output(raw: &Value) -> NormalizedOutput {
    match raw {
        Value::String(text) => normalize_string(text),
        Value::Object(map) => {
            let mut cleaned = map.clone();
            let mut meta = NormalizationMeta::default();
            for key in ROUTING_KEYS {
                if cleaned.remove(*key).is_some() {
                    meta.key_mappings.insert((*key).to_string(), String::new());
                    meta.warnings.push(format!("stripped routing key '{key}'"));
                    meta.normalized = true;
                }
            }
            NormalizedOutput {
                data: Value::Object(cleaned),
                meta,
            }
        }
        other => NormalizedOutput {
            data: other.clone(),
            meta: NormalizationMeta::default(),
        },
    }
}

fn normalize_string(text: &str) -> NormalizedOutput {
    let trimmed = text.trim();
    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
        return wrap_parsed(parsed, false, Vec::new());
    }

    let stripped = strip_code_fence(trimmed);
    if stripped != trimmed {
        if let Ok(parsed) = serde_json::from_str::<Value>(&stripped) {
            return wrap_parsed(parsed, true, vec!["stripped markdown code fence".to_string()]);
        }
    }

    let repaired = repair_json(&stripped);
    if repaired != stripped {
        if let Ok(parsed) = serde_json::from_str::<Value>(&repaired) {
            return wrap_parsed(parsed, true, vec!["repaired near-miss JSON (quotes/trailing commas)".to_string()]);
        }
    }

    let mut meta = NormalizationMeta::default();
    meta.normalized = true;
    meta.wrapped_keys.push("text".to_string());
    meta.warnings.push("could not parse as JSON; wrapped raw text".to_string());
    NormalizedOutput {
        data: serde_json::json!({ "text": text }),
        meta,
    }
}

fn wrap_parsed(parsed: Value, repaired: bool, warnings: Vec<String>) -> NormalizedOutput {
    let mut meta = NormalizationMeta {
        normalized: repaired,
        warnings,
        ..NormalizationMeta::default()
    };
    match parsed {
        Value::Object(mut map) => {
            for key in ROUTING_KEYS {
                if map.remove(*key).is_some() {
                    meta.key_mappings.insert((*key).to_string(), String::new());
                    meta.normalized = true;
                }
            }
            NormalizedOutput {
                data: Value::Object(map),
                meta,
            }
        }
        other => NormalizedOutput { data: other, meta },
    }
}

/// Strips a leading/trailing markdown code fence (```json ... ``` or ``` ... ```),
/// which LLMs commonly wrap JSON responses in despite being asked not to.
fn strip_code_fence(text: &str) -> String {
    let mut s = text;
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim().to_string()
}

/// Best-effort repair for near-miss JSON: removes trailing commas before a
/// closing bracket/brace, and converts single-quoted strings to double
/// quotes when the text contains no double quotes at all.
fn repair_json(text: &str) -> String {
    let mut repaired = text.to_string();
    if !repaired.contains('"') && repaired.contains('\'') {
        repaired = repaired.replace('\'', "\"");
    }
    let trailing_comma = regex::Regex::new(r",\s*([}\]])").unwrap();
    trailing_comma.replace_all(&repaired, "$1").into_owned()
}

/// Known aliases a declared output key accepts from a producer's raw
/// payload, beyond an exact name match — covers the shapes `filter`,
/// `group`, and LLM-bearing steps commonly emit (spec.md §4.6 "known
/// runtime keys").
fn runtime_aliases_for(declared_key: &str) -> &'static [&'static str] {
    match declared_key {
        "items" => &["items", "filtered", "values", "records", "results", "data"],
        "filtered" => &["filtered", "items"],
        "count" => &["count", "length", "total"],
        "total" => &["total", "count", "sum"],
        "groups" => &["groups", "grouped"],
        "grouped" => &["grouped", "groups"],
        "summary" => &["summary", "text", "content", "result"],
        "classification" => &["classification", "category", "label", "result"],
        "extracted" => &["extracted", "data", "result"],
        "analysis" => &["analysis", "result", "text"],
        "generated" => &["generated", "text", "content", "result"],
        "translated" => &["translated", "text", "result"],
        "enriched" => &["enriched", "data", "result"],
        "result" => &["result", "output", "value"],
        _ => &[],
    }
}

/// Maps a step's raw output onto its declared `outputs` schema
/// (`WorkflowStep.outputs`, spec.md §4.6). Runs the generic JSON-repair
/// normalization first, strips control-flow keys, then resolves each
/// declared key by: exact match, known runtime alias, first unused
/// non-underscore key, and finally — when nothing at all resolved and
/// exactly one key is declared — the whole remaining object.
#[must_use]
pub fn map_to_declared_outputs(raw: &Value, declared: &[String]) -> NormalizedOutput {
    let NormalizedOutput { data, mut meta } = normalize_step_output(raw);
    if declared.is_empty() {
        return NormalizedOutput { data, meta };
    }
    let mapped = match data {
        Value::Object(mut map) => {
            for key in CONTROL_KEYS {
                if map.remove(*key).is_some() {
                    meta.normalized = true;
                }
            }
            map_object_onto_declared(map, declared, &mut meta)
        }
        Value::Null => {
            let mut out = Map::new();
            for key in declared {
                out.insert(key.clone(), Value::Null);
            }
            Value::Object(out)
        }
        other => map_scalar_onto_declared(other, declared, &mut meta),
    };
    NormalizedOutput { data: mapped, meta }
}

fn map_object_onto_declared(mut map: Map<String, Value>, declared: &[String], meta: &mut NormalizationMeta) -> Value {
    let mut out = Map::new();
    let mut missing: Vec<String> = Vec::new();
    for key in declared {
        if let Some(v) = map.remove(key) {
            out.insert(key.clone(), v);
        } else {
            missing.push(key.clone());
        }
    }

    missing.retain(|key| {
        for alias in runtime_aliases_for(key) {
            if let Some(v) = map.remove(*alias) {
                meta.key_mappings.insert((*alias).to_string(), key.clone());
                meta.normalized = true;
                out.insert(key.clone(), v);
                return false;
            }
        }
        true
    });

    if !missing.is_empty() {
        let leftover_keys: Vec<String> = map.keys().filter(|k| !k.starts_with('_')).cloned().collect();
        let mut leftover_iter = leftover_keys.into_iter();
        missing.retain(|key| {
            if let Some(source_key) = leftover_iter.next() {
                if let Some(v) = map.remove(&source_key) {
                    meta.key_mappings.insert(source_key, key.clone());
                    meta.normalized = true;
                    out.insert(key.clone(), v);
                    return false;
                }
            }
            true
        });
    }

    if missing.len() == declared.len() && declared.len() == 1 {
        out.insert(declared[0].clone(), Value::Object(map));
        return Value::Object(out);
    }

    for key in missing {
        meta.warnings.push(format!("could not resolve declared output '{key}'"));
        out.insert(key, Value::Null);
    }
    Value::Object(out)
}

fn map_scalar_onto_declared(value: Value, declared: &[String], meta: &mut NormalizationMeta) -> Value {
    let mut out = Map::new();
    if let Some((first, rest)) = declared.split_first() {
        out.insert(first.clone(), value);
        if !rest.is_empty() {
            meta.warnings.push("scalar or array result mapped only to the first declared output key".to_string());
        }
        for key in rest {
            out.insert(key.clone(), Value::Null);
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_passthrough_strips_routing_keys() {
        let raw = serde_json::json!({"__plugin": "http", "success": true, "value": 42});
        let out = normalize_step_output(&raw);
        assert_eq!(out.data, serde_json::json!({"value": 42}));
        assert!(out.meta.key_mappings.contains_key("__plugin"));
        assert!(out.meta.normalized);
    }

    #[test]
    fn parses_valid_json_string() {
        let raw = Value::String(r#"{"value": 1}"#.to_string());
        let out = normalize_step_output(&raw);
        assert_eq!(out.data, serde_json::json!({"value": 1}));
        assert!(!out.meta.normalized);
    }

    #[test]
    fn strips_markdown_code_fence() {
        let raw = Value::String("```json\n{\"value\": 2}\n```".to_string());
        let out = normalize_step_output(&raw);
        assert_eq!(out.data, serde_json::json!({"value": 2}));
        assert!(out.meta.normalized);
        assert!(!out.meta.warnings.is_empty());
    }

    #[test]
    fn repairs_trailing_comma() {
        let raw = Value::String(r#"{"a": 1, "b": 2,}"#.to_string());
        let out = normalize_step_output(&raw);
        assert_eq!(out.data, serde_json::json!({"a": 1, "b": 2}));
        assert!(out.meta.normalized);
    }

    #[test]
    fn falls_back_to_text_wrapper_on_unparseable_input() {
        let raw = Value::String("not json at all { broken".to_string());
        let out = normalize_step_output(&raw);
        assert_eq!(out.data, serde_json::json!({"text": "not json at all { broken"}));
        assert_eq!(out.meta.wrapped_keys, vec!["text".to_string()]);
    }

    #[test]
    fn scalar_passthrough() {
        let raw = serde_json::json!(42);
        let out = normalize_step_output(&raw);
        assert_eq!(out.data, serde_json::json!(42));
        assert!(!out.meta.normalized);
    }

    #[test]
    fn declared_outputs_exact_match_passes_through() {
        let raw = serde_json::json!({"summary": "ok", "extra": 1});
        let out = map_to_declared_outputs(&raw, &["summary".to_string()]);
        assert_eq!(out.data, serde_json::json!({"summary": "ok"}));
    }

    #[test]
    fn declared_outputs_resolve_via_runtime_alias() {
        let raw = serde_json::json!({"filtered": [1, 2], "count": 2});
        let out = map_to_declared_outputs(&raw, &["items".to_string(), "total".to_string()]);
        assert_eq!(out.data["items"], serde_json::json!([1, 2]));
        assert_eq!(out.data["total"], serde_json::json!(2));
        assert!(out.meta.key_mappings.contains_key("filtered"));
    }

    #[test]
    fn declared_outputs_strip_control_flow_keys_before_mapping() {
        let raw = serde_json::json!({"result": "done", "next_step": "s2", "is_last_step": false});
        let out = map_to_declared_outputs(&raw, &["result".to_string()]);
        assert_eq!(out.data, serde_json::json!({"result": "done"}));
    }

    #[test]
    fn declared_outputs_fallback_to_first_unused_key() {
        let raw = serde_json::json!({"weird_producer_key": 99});
        let out = map_to_declared_outputs(&raw, &["value".to_string()]);
        assert_eq!(out.data, serde_json::json!({"value": 99}));
    }

    #[test]
    fn declared_outputs_single_key_wraps_whole_object_when_nothing_else_matches() {
        let raw = serde_json::json!({"__plugin": "http"});
        let out = map_to_declared_outputs(&raw, &["payload".to_string()]);
        assert_eq!(out.data, serde_json::json!({"payload": {}}));
    }

    #[test]
    fn declared_outputs_scalar_maps_to_first_declared_key() {
        let raw = serde_json::json!(42);
        let out = map_to_declared_outputs(&raw, &["count".to_string(), "label".to_string()]);
        assert_eq!(out.data["count"], serde_json::json!(42));
        assert_eq!(out.data["label"], Value::Null);
    }

    #[test]
    fn declared_outputs_array_wraps_under_single_key() {
        let raw = serde_json::json!([1, 2, 3]);
        let out = map_to_declared_outputs(&raw, &["items".to_string()]);
        assert_eq!(out.data, serde_json::json!({"items": [1, 2, 3]}));
    }
}
