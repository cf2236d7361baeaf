//! ABOUTME: DataOperations — the Transform step's data-shaping engine
//! ABOUTME: Grounded on spec.md §4.4; unwraps a step's envelope to find its working
//! ABOUTME: collection, applies one operation, then the caller wraps the result per
//! ABOUTME: the step's declared output keys (spec.md §4.4 "Result wrapping")

use crate::context::{render_simple, render_simple_json_escaped, resolve_reference, ExecutionContext};
use pilot_core::{ErrorCode, PilotError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Priority order used to find "the collection" inside an arbitrary input
/// object when no explicit `input_path` is given (spec.md §4.4 "unwrap").
const UNWRAP_PRIORITY: &[&str] = &[
    "items",
    "filtered",
    "deduplicated",
    "groups",
    "values",
    "records",
    "emails",
    "files",
    "rows",
];

/// Finds the working array/value for a transform: an explicit array input
/// wins; otherwise the first key present from `UNWRAP_PRIORITY`;
/// otherwise the whole object (spec.md §4.4 "unwrap").
#[must_use]
pub fn unwrap_input(input: &Value) -> Value {
    if let Value::Array(_) = input {
        return input.clone();
    }
    if let Value::Object(map) = input {
        for key in UNWRAP_PRIORITY {
            if let Some(v) = map.get(*key) {
                return v.clone();
            }
        }
    }
    input.clone()
}

fn as_array(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(arr) => arr.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Result wrapping (spec.md §4.4): if the step declares exactly one
/// output key, wrap the result as `{ <key>: result }` unless it already
/// has that shape. Otherwise the raw result passes through unchanged.
#[must_use]
pub fn wrap_result(result: Value, declared_keys: &[String]) -> Value {
    if let [only_key] = declared_keys {
        if let Value::Object(map) = &result {
            if map.contains_key(only_key) {
                return result;
            }
        }
        let mut wrapped = Map::new();
        wrapped.insert(only_key.clone(), result);
        return Value::Object(wrapped);
    }
    result
}

fn field_of<'a>(item: &'a Value, field: &str) -> Option<&'a Value> {
    item.pointer(&format!("/{}", field.replace('.', "/")))
        .or_else(|| item.as_object().and_then(|m| m.get(field)))
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn value_as_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Detects a 2-D row array whose first row is a header (an array of
/// strings), returning `(header, data_rows)`. Used by `group` and
/// `deduplicate` so a column name resolves to the matching index
/// (spec.md §4.4 "for 2-D arrays, preserve and use the header row").
fn as_2d_with_header(working: &Value) -> Option<(Vec<String>, Vec<Vec<Value>>)> {
    let Value::Array(rows) = working else { return None };
    if rows.len() < 2 {
        return None;
    }
    let Some(Value::Array(header_row)) = rows.first() else {
        return None;
    };
    if header_row.is_empty() || !header_row.iter().all(Value::is_string) {
        return None;
    }
    let header: Vec<String> = header_row.iter().map(|v| v.as_str().unwrap().to_string()).collect();
    let data_rows: Vec<Vec<Value>> = rows[1..]
        .iter()
        .map(|row| match row {
            Value::Array(cells) => cells.clone(),
            other => vec![other.clone()],
        })
        .collect();
    Some((header, data_rows))
}

/// Binds a single local variable named `item` (with snake/camel aliases
/// applied, spec.md §4.2) for per-item expression/condition evaluation.
fn item_locals(item: &Value) -> HashMap<String, Value> {
    let mut locals = HashMap::new();
    locals.insert("item".to_string(), crate::context::bind_iteration_item(item.clone()));
    locals
}

/// Resolves a single mapping value: a whole-string `{{…}}` reference
/// resolves to its typed value; a string containing embedded `{{…}}`
/// renders as a template; anything else passes through as a literal.
fn resolve_mapping_value(ctx: &ExecutionContext, locals: &HashMap<String, Value>, value: &Value) -> Value {
    let Value::String(s) = value else {
        return value.clone();
    };
    let trimmed = s.trim();
    if let Some(inner) = trimmed.strip_prefix("{{").and_then(|r| r.strip_suffix("}}")) {
        if !inner.contains("{{") {
            if let Ok(resolved) = resolve_reference(ctx, locals, inner) {
                return resolved;
            }
            return Value::Null;
        }
    }
    if s.contains("{{") {
        return Value::String(render_simple(ctx, locals, s));
    }
    value.clone()
}

/// Executes one transform operation against `input` and returns the raw
/// (unwrapped) result; the caller applies `wrap_result` per the step's
/// declared outputs.
pub fn execute_operation(operation: &str, input: &Value, config: &Value, ctx: &ExecutionContext) -> Result<Value> {
    let working = unwrap_input(input);
    match operation {
        "set" => Ok(working),
        "map" => execute_map(&working, config, ctx),
        "filter" => execute_filter(&working, config, ctx),
        "reduce" => execute_reduce(&working, config),
        "sort" => execute_sort(&working, config),
        "group" => execute_group(&working, config),
        "aggregate" => execute_aggregate(&working, config),
        "format" => execute_format(&working, config, ctx),
        "deduplicate" => execute_deduplicate(&working, config),
        "flatten" => execute_flatten(&working, config),
        "join" => Err(PilotError::execution(
            "join is not implemented in this revision",
            None::<String>,
            ErrorCode::UnknownTransformOperation,
        )),
        "pivot" => execute_pivot(&working, config),
        "split" => execute_split(&working, config),
        "expand" => execute_expand(&working, config),
        other => Err(PilotError::execution(
            format!("unknown transform operation '{other}'"),
            None::<String>,
            ErrorCode::UnknownTransformOperation,
        )),
    }
}

fn execute_map(working: &Value, config: &Value, ctx: &ExecutionContext) -> Result<Value> {
    let items = as_array(working);

    if let Some(columns) = config.get("columns").and_then(Value::as_array) {
        let names: Vec<String> = columns
            .iter()
            .map(|c| match c {
                Value::String(s) => s.clone(),
                Value::Object(o) => o
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                other => other.to_string(),
            })
            .collect();
        let fields: Vec<String> = columns
            .iter()
            .map(|c| match c {
                Value::Object(o) => o.get("field").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .enumerate()
            .map(|(i, f)| f.unwrap_or_else(|| names[i].clone()))
            .collect();

        let mut rows = Vec::with_capacity(items.len() + 1);
        if config.get("header").and_then(Value::as_bool).unwrap_or(true) {
            rows.push(Value::Array(names.iter().cloned().map(Value::String).collect()));
        }
        for item in &items {
            let row: Vec<Value> = fields.iter().map(|f| field_of(item, f).cloned().unwrap_or(Value::Null)).collect();
            rows.push(Value::Array(row));
        }
        return Ok(Value::Array(rows));
    }

    if let Some(template) = config.pointer("/mapping/template").and_then(Value::as_str) {
        let rendered: Vec<Value> = items
            .iter()
            .map(|item| Value::String(render_simple(ctx, &item_locals(item), template)))
            .collect();
        return Ok(Value::Array(rendered));
    }

    if let Some(mapping) = config.get("mapping").and_then(Value::as_object) {
        let mapped: Vec<Value> = items
            .iter()
            .map(|item| {
                let locals = item_locals(item);
                let mut out = Map::new();
                for (key, expr) in mapping {
                    out.insert(key.clone(), resolve_mapping_value(ctx, &locals, expr));
                }
                Value::Object(out)
            })
            .collect();
        return Ok(Value::Array(mapped));
    }

    Ok(Value::Array(items))
}

/// Returns the structured, backward-compatible shape S3 requires:
/// `{items, filtered, removed, originalCount, count, length, "0": first, ...}`.
fn execute_filter(working: &Value, config: &Value, ctx: &ExecutionContext) -> Result<Value> {
    let items = as_array(working);
    let original_count = items.len();

    let condition_value = config
        .get("condition")
        .cloned()
        .ok_or_else(|| PilotError::execution("filter requires a 'condition'", None::<String>, ErrorCode::MissingCondition))?;
    let condition: crate::conditions::Condition =
        serde_json::from_value(condition_value).map_err(|e| PilotError::condition(format!("invalid filter condition: {e}")))?;

    let mut filtered = Vec::new();
    for item in &items {
        let locals = item_locals(item);
        if crate::conditions::ConditionalEvaluator::evaluate(&condition, ctx, &locals)? {
            filtered.push(item.clone());
        }
    }

    let mut out = Map::new();
    out.insert("items".to_string(), Value::Array(filtered.clone()));
    out.insert("filtered".to_string(), Value::Array(filtered.clone()));
    out.insert("removed".to_string(), Value::from(original_count - filtered.len()));
    out.insert("originalCount".to_string(), Value::from(original_count));
    out.insert("count".to_string(), Value::from(filtered.len()));
    out.insert("length".to_string(), Value::from(filtered.len()));
    for (idx, item) in filtered.iter().enumerate() {
        out.insert(idx.to_string(), item.clone());
    }
    Ok(Value::Object(out))
}

fn execute_reduce(working: &Value, config: &Value) -> Result<Value> {
    let field = config.get("field").and_then(Value::as_str);
    let operation = config.get("operation").and_then(Value::as_str).unwrap_or("sum");
    let items = as_array(working);

    Ok(match operation {
        "sum" => {
            let total: f64 = items
                .iter()
                .filter_map(|item| match field {
                    Some(f) => field_of(item, f).and_then(Value::as_f64),
                    None => item.as_f64(),
                })
                .sum();
            serde_json::json!(total)
        }
        "count" => serde_json::json!(items.len()),
        "concat" => {
            let mut initial = config.get("initial").and_then(Value::as_str).unwrap_or("").to_string();
            for item in &items {
                let text = match field {
                    Some(f) => field_of(item, f).map(value_as_key).unwrap_or_default(),
                    None => value_as_key(item),
                };
                initial.push_str(&text);
            }
            Value::String(initial)
        }
        "merge" => {
            let mut merged = config.get("initial").and_then(Value::as_object).cloned().unwrap_or_default();
            for item in &items {
                if let Value::Object(map) = item {
                    for (k, v) in map {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        other => {
            return Err(PilotError::execution(
                format!("unknown reduce builtin '{other}'"),
                None::<String>,
                ErrorCode::UnknownTransformOperation,
            ))
        }
    })
}

fn execute_sort(working: &Value, config: &Value) -> Result<Value> {
    let field = config.get("field").and_then(Value::as_str);
    let descending = config.get("descending").and_then(Value::as_bool).unwrap_or(false);
    let mut items = as_array(working);
    items.sort_by(|a, b| {
        let (av, bv) = match field {
            Some(f) => (
                field_of(a, f).cloned().unwrap_or(Value::Null),
                field_of(b, f).cloned().unwrap_or(Value::Null),
            ),
            None => (a.clone(), b.clone()),
        };
        let ord = compare_values(&av, &bv);
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
    Ok(Value::Array(items))
}

/// `{grouped, groups:[{key,items,count}], keys, count}`; `grouped`'s keys
/// are also available at the top level for backward-compatible consumers
/// (spec.md §4.4 "group").
fn execute_group(working: &Value, config: &Value) -> Result<Value> {
    let field = config
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| PilotError::execution("group requires a 'field'", None::<String>, ErrorCode::MissingOperation))?;

    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Vec<Value>> = HashMap::new();

    if let Some((header, rows)) = as_2d_with_header(working) {
        let idx = header.iter().position(|h| h == field);
        for row in rows {
            let key = idx.and_then(|i| row.get(i)).map(value_as_key).unwrap_or_else(|| "null".to_string());
            if !buckets.contains_key(&key) {
                order.push(key.clone());
            }
            buckets.entry(key).or_default().push(Value::Array(row));
        }
    } else {
        for item in as_array(working) {
            let key = field_of(&item, field).map(value_as_key).unwrap_or_else(|| "null".to_string());
            if !buckets.contains_key(&key) {
                order.push(key.clone());
            }
            buckets.entry(key).or_default().push(item);
        }
    }

    let mut grouped = Map::new();
    let mut groups = Vec::with_capacity(order.len());
    for key in &order {
        let items = buckets.remove(key).unwrap_or_default();
        grouped.insert(key.clone(), Value::Array(items.clone()));
        groups.push(serde_json::json!({"key": key, "items": items, "count": items.len()}));
    }

    let mut out = Map::new();
    out.insert("grouped".to_string(), Value::Object(grouped.clone()));
    out.insert("groups".to_string(), Value::Array(groups));
    out.insert("keys".to_string(), Value::Array(order.iter().cloned().map(Value::String).collect()));
    out.insert("count".to_string(), Value::from(order.len()));
    for (key, value) in grouped {
        out.entry(key).or_insert(value);
    }
    Ok(Value::Object(out))
}

fn execute_aggregate(working: &Value, config: &Value) -> Result<Value> {
    let ops = config
        .as_array()
        .cloned()
        .or_else(|| config.get("operations").and_then(Value::as_array).cloned())
        .ok_or_else(|| PilotError::execution("aggregate requires a list of operations", None::<String>, ErrorCode::MissingOperation))?;
    let items = as_array(working);

    let mut out = Map::new();
    for op in ops {
        let field = op.get("field").and_then(Value::as_str);
        let operation = op
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| PilotError::execution("aggregate op missing 'operation'", None::<String>, ErrorCode::MissingOperation))?;
        let alias = op
            .get("alias")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_{operation}", field.unwrap_or("value")));

        let numbers: Vec<f64> = items
            .iter()
            .filter_map(|item| match field {
                Some(f) => field_of(item, f).and_then(Value::as_f64),
                None => item.as_f64(),
            })
            .collect();

        let result = match operation {
            "sum" => numbers.iter().sum::<f64>(),
            "avg" => {
                if numbers.is_empty() {
                    0.0
                } else {
                    numbers.iter().sum::<f64>() / numbers.len() as f64
                }
            }
            "min" => numbers.iter().cloned().fold(f64::INFINITY, f64::min),
            "max" => numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            "count" => items.len() as f64,
            other => {
                return Err(PilotError::execution(
                    format!("unknown aggregate operation '{other}'"),
                    None::<String>,
                    ErrorCode::UnknownTransformOperation,
                ))
            }
        };
        out.insert(alias, serde_json::json!(result));
    }
    Ok(Value::Object(out))
}

fn execute_format(working: &Value, config: &Value, ctx: &ExecutionContext) -> Result<Value> {
    let template = config
        .pointer("/mapping/template")
        .and_then(Value::as_str)
        .ok_or_else(|| PilotError::execution("format requires 'mapping.template'", None::<String>, ErrorCode::MissingOperation))?;
    let json_escape = config.get("json_escape").and_then(Value::as_bool).unwrap_or(false);

    let render_one = |object: &Value| -> Value {
        let locals = match object {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            other => {
                let mut m = HashMap::new();
                m.insert("this".to_string(), other.clone());
                m
            }
        };
        let rendered = if json_escape {
            render_simple_json_escaped(ctx, &locals, template)
        } else {
            render_simple(ctx, &locals, template)
        };
        if json_escape {
            if let Ok(parsed) = serde_json::from_str::<Value>(&rendered) {
                return parsed;
            }
        }
        Value::String(rendered)
    };

    match working {
        Value::Array(items) => Ok(Value::Array(items.iter().map(render_one).collect())),
        other => Ok(render_one(other)),
    }
}

/// `keep: first|last` chooses the survivor; an optional `sort_field`
/// pre-sorts; dedupe key is `field` (2-D arrays preserve the header row);
/// without a key, dedupe on the serialized form of each item.
fn execute_deduplicate(working: &Value, config: &Value) -> Result<Value> {
    let field = config.get("field").and_then(Value::as_str);
    let keep_last = config.get("keep").and_then(Value::as_str) == Some("last");

    if let Some((header, rows)) = as_2d_with_header(working) {
        let idx = field.and_then(|f| header.iter().position(|h| h == f));
        let mut order: Vec<String> = Vec::new();
        let mut survivors: HashMap<String, Vec<Value>> = HashMap::new();
        for row in rows {
            let key = idx.and_then(|i| row.get(i)).map(value_as_key).unwrap_or_else(|| format!("{row:?}"));
            if !survivors.contains_key(&key) {
                order.push(key.clone());
            }
            if !survivors.contains_key(&key) || keep_last {
                survivors.insert(key, row);
            }
        }
        let mut out_rows = vec![Value::Array(header.into_iter().map(Value::String).collect())];
        out_rows.extend(order.into_iter().filter_map(|k| survivors.remove(&k)).map(Value::Array));
        return Ok(Value::Array(out_rows));
    }

    let mut items = as_array(working);
    if let Some(sort_field) = config.get("sort_field").and_then(Value::as_str) {
        items.sort_by(|a, b| compare_values(
            field_of(a, sort_field).unwrap_or(&Value::Null),
            field_of(b, sort_field).unwrap_or(&Value::Null),
        ));
    }

    let mut order: Vec<String> = Vec::new();
    let mut survivors: HashMap<String, Value> = HashMap::new();
    for item in items {
        let key = match field {
            Some(f) => field_of(&item, f).map(value_as_key).unwrap_or_else(|| "null".to_string()),
            None => serde_json::to_string(&item).unwrap_or_default(),
        };
        if !survivors.contains_key(&key) {
            order.push(key.clone());
        }
        if !survivors.contains_key(&key) || keep_last {
            survivors.insert(key, item);
        }
    }
    Ok(Value::Array(order.into_iter().filter_map(|k| survivors.remove(&k)).collect()))
}

fn execute_flatten(working: &Value, config: &Value) -> Result<Value> {
    let depth = config.get("depth").and_then(Value::as_u64).unwrap_or(1);
    let mut current = as_array(working);
    for _ in 0..depth.max(1) {
        let mut next = Vec::with_capacity(current.len());
        for item in current {
            match item {
                Value::Array(inner) => next.extend(inner),
                other => next.push(other),
            }
        }
        current = next;
    }
    Ok(Value::Array(current))
}

fn execute_pivot(working: &Value, config: &Value) -> Result<Value> {
    let row_key = config
        .get("rowKey")
        .and_then(Value::as_str)
        .ok_or_else(|| PilotError::execution("pivot requires 'rowKey'", None::<String>, ErrorCode::MissingOperation))?;
    let column_key = config
        .get("columnKey")
        .and_then(Value::as_str)
        .ok_or_else(|| PilotError::execution("pivot requires 'columnKey'", None::<String>, ErrorCode::MissingOperation))?;
    let value_key = config.get("valueKey").and_then(Value::as_str);

    let mut order: Vec<String> = Vec::new();
    let mut rows: HashMap<String, Map<String, Value>> = HashMap::new();
    for item in as_array(working) {
        let row_value = field_of(&item, row_key).map(value_as_key).unwrap_or_default();
        let col_value = field_of(&item, column_key).map(value_as_key).unwrap_or_default();
        let cell_value = value_key.and_then(|f| field_of(&item, f)).cloned().unwrap_or(Value::Bool(true));

        if !rows.contains_key(&row_value) {
            order.push(row_value.clone());
        }
        let row = rows.entry(row_value.clone()).or_insert_with(|| {
            let mut m = Map::new();
            m.insert(row_key.to_string(), Value::String(row_value.clone()));
            m
        });
        row.insert(col_value, cell_value);
    }

    let pivoted: Vec<Value> = order.into_iter().filter_map(|k| rows.remove(&k)).map(Value::Object).collect();
    Ok(Value::Array(pivoted))
}

/// Normalizes a bucket key the way `split` requires: lowercased, spaces
/// turned to underscores, and `null` mapped to `"unknown"` (spec.md §4.4).
fn normalize_bucket_key(value: &Value) -> String {
    if value.is_null() {
        return "unknown".to_string();
    }
    value_as_key(value).to_lowercase().replace(' ', "_")
}

fn execute_split(working: &Value, config: &Value) -> Result<Value> {
    if let Some(field) = config.get("field").and_then(Value::as_str) {
        let mut order: Vec<String> = Vec::new();
        let mut buckets: HashMap<String, Vec<Value>> = HashMap::new();
        for item in as_array(working) {
            let key = normalize_bucket_key(field_of(&item, field).unwrap_or(&Value::Null));
            if !buckets.contains_key(&key) {
                order.push(key.clone());
            }
            buckets.entry(key).or_default().push(item);
        }
        let mut out = Map::new();
        for key in order {
            if let Some(items) = buckets.remove(&key) {
                out.insert(key, Value::Array(items));
            }
        }
        return Ok(Value::Object(out));
    }

    let items = as_array(working);
    let chunk_size = if let Some(size) = config.get("size").and_then(Value::as_u64) {
        size.max(1) as usize
    } else if let Some(count) = config.get("count").and_then(Value::as_u64) {
        let count = count.max(1) as usize;
        (items.len() + count - 1).max(1) / count.max(1).max(1)
    } else {
        items.len().max(1)
    };
    let chunks: Vec<Value> = items
        .chunks(chunk_size.max(1))
        .map(|chunk| Value::Array(chunk.to_vec()))
        .collect();
    Ok(Value::Array(chunks))
}

fn flatten_object(prefix: &str, value: &Value, delimiter: &str, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}{delimiter}{k}") };
                flatten_object(&key, v, delimiter, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

fn execute_expand(working: &Value, config: &Value) -> Result<Value> {
    let delimiter = config.get("delimiter").and_then(Value::as_str).unwrap_or(".");
    let expand_one = |object: &Value| -> Value {
        let mut out = Map::new();
        flatten_object("", object, delimiter, &mut out);
        Value::Object(out)
    };
    match working {
        Value::Array(items) => Ok(Value::Array(items.iter().map(expand_one).collect())),
        other => Ok(expand_one(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::RunMode;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("e", "a", "u", "s", Value::Null, RunMode::Production)
    }

    #[test]
    fn unwrap_prefers_items_key() {
        let input = serde_json::json!({"items": [1, 2, 3], "values": [9]});
        assert_eq!(unwrap_input(&input), serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn unwrap_falls_back_to_whole_object() {
        let input = serde_json::json!({"foo": "bar"});
        assert_eq!(unwrap_input(&input), input);
    }

    #[test]
    fn s3_filter_transform_matches_literal_scenario() {
        let ctx = ctx();
        let input = serde_json::json!([{"x": 1}, {"x": 2}, {"x": 3}]);
        let config = serde_json::json!({"condition": {"field": "item.x", "operator": ">", "value": 1}});
        let out = execute_operation("filter", &input, &config, &ctx).unwrap();
        assert_eq!(out["items"], serde_json::json!([{"x": 2}, {"x": 3}]));
        assert_eq!(out["filtered"], serde_json::json!([{"x": 2}, {"x": 3}]));
        assert_eq!(out["removed"], 1);
        assert_eq!(out["originalCount"], 3);
        assert_eq!(out["count"], 2);
        assert_eq!(out["length"], 2);
        assert_eq!(out["0"], serde_json::json!({"x": 2}));
    }

    #[test]
    fn map_with_key_value_mapping_resolves_item_references() {
        let ctx = ctx();
        let input = serde_json::json!({"items": [{"name": "Ada"}]});
        let config = serde_json::json!({"mapping": {"greeting": "{{item.name}}"}});
        let out = execute_operation("map", &input, &config, &ctx).unwrap();
        assert_eq!(out, serde_json::json!([{"greeting": "Ada"}]));
    }

    #[test]
    fn map_with_columns_produces_2d_rows_with_header() {
        let ctx = ctx();
        let input = serde_json::json!({"items": [{"name": "Ada", "age": 30}]});
        let config = serde_json::json!({"columns": ["name", "age"]});
        let out = execute_operation("map", &input, &config, &ctx).unwrap();
        assert_eq!(out, serde_json::json!([["name", "age"], ["Ada", 30]]));
    }

    #[test]
    fn reduce_sum_and_merge() {
        let ctx = ctx();
        let input = serde_json::json!({"items": [{"amount": 10}, {"amount": 15}]});
        let out = execute_operation("reduce", &input, &serde_json::json!({"field": "amount", "operation": "sum"}), &ctx).unwrap();
        assert_eq!(out, serde_json::json!(25.0));

        let input = serde_json::json!({"items": [{"a": 1}, {"b": 2}]});
        let out = execute_operation("reduce", &input, &serde_json::json!({"operation": "merge"}), &ctx).unwrap();
        assert_eq!(out, serde_json::json!({"a": 1, "b": 2}));
    }

    #[test]
    fn group_returns_spec_shape_with_backcompat_keys() {
        let ctx = ctx();
        let input = serde_json::json!({"items": [{"type": "a", "n": 1}, {"type": "b", "n": 2}, {"type": "a", "n": 3}]});
        let out = execute_operation("group", &input, &serde_json::json!({"field": "type"}), &ctx).unwrap();
        assert_eq!(out["count"], 2);
        assert_eq!(out["keys"], serde_json::json!(["a", "b"]));
        assert_eq!(out["grouped"]["a"].as_array().unwrap().len(), 2);
        assert_eq!(out["a"].as_array().unwrap().len(), 2);
        assert_eq!(out["groups"][0]["key"], "a");
        assert_eq!(out["groups"][0]["count"], 2);
    }

    #[test]
    fn aggregate_computes_declared_operations() {
        let ctx = ctx();
        let input = serde_json::json!({"items": [{"amount": 10}, {"amount": 20}]});
        let config = serde_json::json!([{"field": "amount", "operation": "sum", "alias": "total"}, {"field": "amount", "operation": "avg"}]);
        let out = execute_operation("aggregate", &input, &config, &ctx).unwrap();
        assert_eq!(out["total"], 30.0);
        assert_eq!(out["amount_avg"], 15.0);
    }

    #[test]
    fn format_renders_template_against_object_fields() {
        let ctx = ctx();
        let input = serde_json::json!({"name": "Ada", "role": "engineer"});
        let config = serde_json::json!({"mapping": {"template": "{{name}} is an {{role}}"}});
        let out = execute_operation("format", &input, &config, &ctx).unwrap();
        assert_eq!(out, serde_json::json!("Ada is an engineer"));
    }

    #[test]
    fn format_json_escape_parses_result_as_json() {
        let ctx = ctx();
        let input = serde_json::json!({"name": "Ada"});
        let config = serde_json::json!({"mapping": {"template": "{\"n\": \"{{name}}\"}"}, "json_escape": true});
        let out = execute_operation("format", &input, &config, &ctx).unwrap();
        assert_eq!(out, serde_json::json!({"n": "Ada"}));
    }

    #[test]
    fn deduplicate_keep_last_survivor() {
        let ctx = ctx();
        let input = serde_json::json!({"items": [{"id": 1, "v": "old"}, {"id": 1, "v": "new"}]});
        let out = execute_operation("deduplicate", &input, &serde_json::json!({"field": "id", "keep": "last"}), &ctx).unwrap();
        assert_eq!(out, serde_json::json!([{"id": 1, "v": "new"}]));
    }

    #[test]
    fn deduplicate_without_key_uses_serialized_form() {
        let ctx = ctx();
        let input = serde_json::json!({"items": [{"a": 1}, {"a": 1}, {"a": 2}]});
        let out = execute_operation("deduplicate", &input, &Value::Null, &ctx).unwrap();
        assert_eq!(out.as_array().unwrap().len(), 2);
    }

    #[test]
    fn flatten_merges_nested_arrays_to_depth() {
        let ctx = ctx();
        let input = serde_json::json!({"items": [[1, 2], [3], 4]});
        let out = execute_operation("flatten", &input, &Value::Null, &ctx).unwrap();
        assert_eq!(out, serde_json::json!([1, 2, 3, 4]));
    }

    #[test]
    fn join_operation_is_explicitly_rejected() {
        let ctx = ctx();
        let err = execute_operation("join", &Value::Null, &Value::Null, &ctx).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnknownTransformOperation));
    }

    #[test]
    fn pivot_produces_row_wise_array() {
        let ctx = ctx();
        let input = serde_json::json!({"items": [
            {"region": "east", "product": "a", "sales": 10},
            {"region": "east", "product": "b", "sales": 5},
            {"region": "west", "product": "a", "sales": 7},
        ]});
        let config = serde_json::json!({"rowKey": "region", "columnKey": "product", "valueKey": "sales"});
        let out = execute_operation("pivot", &input, &config, &ctx).unwrap();
        let rows = out.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["region"], "east");
        assert_eq!(rows[0]["a"], 10);
        assert_eq!(rows[0]["b"], 5);
    }

    #[test]
    fn split_buckets_by_normalized_field_value() {
        let ctx = ctx();
        let input = serde_json::json!({"items": [{"status": "In Progress"}, {"status": null}, {"status": "in progress"}]});
        let out = execute_operation("split", &input, &serde_json::json!({"field": "status"}), &ctx).unwrap();
        assert_eq!(out["in_progress"].as_array().unwrap().len(), 2);
        assert_eq!(out["unknown"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn split_chunks_by_size_without_field() {
        let ctx = ctx();
        let input = serde_json::json!({"items": [1, 2, 3, 4, 5]});
        let out = execute_operation("split", &input, &serde_json::json!({"size": 2}), &ctx).unwrap();
        assert_eq!(out, serde_json::json!([[1, 2], [3, 4], [5]]));
    }

    #[test]
    fn expand_flattens_nested_object_to_dotted_keys() {
        let ctx = ctx();
        let input = serde_json::json!({"a": {"b": {"c": 1}}, "d": 2});
        let out = execute_operation("expand", &input, &Value::Null, &ctx).unwrap();
        assert_eq!(out, serde_json::json!({"a.b.c": 1, "d": 2}));
    }

    #[test]
    fn unknown_operation_is_a_stable_error_code() {
        let ctx = ctx();
        let err = execute_operation("bogus", &Value::Null, &Value::Null, &ctx).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnknownTransformOperation));
    }

    #[test]
    fn wrap_result_wraps_under_single_declared_key() {
        let result = serde_json::json!([1, 2, 3]);
        let wrapped = wrap_result(result, &["items".to_string()]);
        assert_eq!(wrapped, serde_json::json!({"items": [1, 2, 3]}));
    }

    #[test]
    fn wrap_result_passes_through_when_already_shaped() {
        let result = serde_json::json!({"items": [1, 2]});
        let wrapped = wrap_result(result.clone(), &["items".to_string()]);
        assert_eq!(wrapped, result);
    }

    #[test]
    fn wrap_result_passes_through_for_multiple_or_no_declared_keys() {
        let result = serde_json::json!([1, 2]);
        assert_eq!(wrap_result(result.clone(), &[]), result);
        assert_eq!(
            wrap_result(result.clone(), &["a".to_string(), "b".to_string()]),
            result
        );
    }
}
