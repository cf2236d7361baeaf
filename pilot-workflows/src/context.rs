//! ABOUTME: ExecutionContext — per-run state and the `{{…}}` variable resolver
//! ABOUTME: Grounded on spec.md §4.2; state lives behind a single RwLock so parallel step
//! ABOUTME: commits funnel through one lock (spec.md §5 "single commit point")

use pilot_core::{PilotError, Result, RunMode, StepOutput, TokenUsage};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

fn template_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap())
}

#[derive(Debug, Default)]
struct State {
    step_outputs: HashMap<String, StepOutput>,
    step_order: Vec<String>,
    variables: HashMap<String, Value>,
    completed: Vec<String>,
    failed: Vec<String>,
    skipped: Vec<String>,
    current_step: Option<String>,
    cumulative_time: Duration,
    cumulative_tokens: TokenUsage,
    memory_context: Option<Value>,
    cancelled: bool,
}

struct Inner {
    execution_id: String,
    agent_id: String,
    user_id: String,
    session_id: String,
    input: Value,
    run_mode: RunMode,
    state: RwLock<State>,
}

/// Per-run mutable state, cheaply cloneable (an `Arc` handle) so it can be
/// shared across spawned parallel-step tasks.
#[derive(Clone)]
pub struct ExecutionContext(Arc<Inner>);

impl ExecutionContext {
    #[must_use]
    pub fn new(
        execution_id: impl Into<String>,
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        input: Value,
        run_mode: RunMode,
    ) -> Self {
        Self(Arc::new(Inner {
            execution_id: execution_id.into(),
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            input,
            run_mode,
            state: RwLock::new(State::default()),
        }))
    }

    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.0.execution_id
    }

    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.0.agent_id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.0.user_id
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.0.session_id
    }

    #[must_use]
    pub fn input(&self) -> &Value {
        &self.0.input
    }

    #[must_use]
    pub fn run_mode(&self) -> RunMode {
        self.0.run_mode
    }

    /// Idempotent for retries: the latest call for a given step id wins,
    /// but its position in insertion order is set only on first write.
    pub fn set_step_output(&self, step_id: impl Into<String>, output: StepOutput) {
        let step_id = step_id.into();
        let mut state = self.0.state.write();
        if !state.step_outputs.contains_key(&step_id) {
            state.step_order.push(step_id.clone());
        }
        state.step_outputs.insert(step_id, output);
    }

    #[must_use]
    pub fn get_step_output(&self, step_id: &str) -> Option<StepOutput> {
        self.0.state.read().step_outputs.get(step_id).cloned()
    }

    /// Insertion-ordered, for "last step" fallback output-building semantics.
    #[must_use]
    pub fn get_all_step_outputs(&self) -> Vec<(String, StepOutput)> {
        let state = self.0.state.read();
        state
            .step_order
            .iter()
            .filter_map(|id| state.step_outputs.get(id).map(|o| (id.clone(), o.clone())))
            .collect()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.0.state.write().variables.insert(name.into(), value);
    }

    #[must_use]
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.0.state.read().variables.get(name).cloned()
    }

    /// A snapshot of every bound variable, for `sub_workflow`'s
    /// `inheritUnmappedVariables`.
    #[must_use]
    pub fn variables(&self) -> HashMap<String, Value> {
        self.0.state.read().variables.clone()
    }

    pub fn mark_completed(&self, step_id: impl Into<String>) {
        self.0.state.write().completed.push(step_id.into());
    }

    pub fn mark_failed(&self, step_id: impl Into<String>) {
        self.0.state.write().failed.push(step_id.into());
    }

    pub fn mark_skipped(&self, step_id: impl Into<String>) {
        self.0.state.write().skipped.push(step_id.into());
    }

    #[must_use]
    pub fn completed_steps(&self) -> Vec<String> {
        self.0.state.read().completed.clone()
    }

    #[must_use]
    pub fn failed_steps(&self) -> Vec<String> {
        self.0.state.read().failed.clone()
    }

    #[must_use]
    pub fn skipped_steps(&self) -> Vec<String> {
        self.0.state.read().skipped.clone()
    }

    pub fn set_current_step(&self, step_id: impl Into<String>) {
        self.0.state.write().current_step = Some(step_id.into());
    }

    pub fn add_execution_time(&self, duration: Duration) {
        self.0.state.write().cumulative_time += duration;
    }

    #[must_use]
    pub fn cumulative_execution_time(&self) -> Duration {
        self.0.state.read().cumulative_time
    }

    pub fn add_tokens(&self, usage: TokenUsage) {
        let mut state = self.0.state.write();
        state.cumulative_tokens = state.cumulative_tokens.add(usage);
    }

    #[must_use]
    pub fn cumulative_tokens(&self) -> TokenUsage {
        self.0.state.read().cumulative_tokens
    }

    pub fn set_memory_context(&self, context: Value) {
        self.0.state.write().memory_context = Some(context);
    }

    #[must_use]
    pub fn memory_context(&self) -> Option<Value> {
        self.0.state.read().memory_context.clone()
    }

    pub fn cancel(&self) {
        self.0.state.write().cancelled = true;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.state.read().cancelled
    }

    /// A JSON snapshot of everything needed to resume this execution
    /// (spec.md §4.9 "in-memory checkpoints ... snapshot context").
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let state = self.0.state.read();
        let outputs: HashMap<&str, &StepOutput> = state
            .step_outputs
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        serde_json::json!({
            "execution_id": self.0.execution_id,
            "agent_id": self.0.agent_id,
            "user_id": self.0.user_id,
            "session_id": self.0.session_id,
            "input": self.0.input,
            "run_mode": self.0.run_mode,
            "step_order": state.step_order,
            "step_outputs": outputs,
            "variables": state.variables,
            "completed": state.completed,
            "failed": state.failed,
            "skipped": state.skipped,
            "cumulative_time_ms": state.cumulative_time.as_millis() as u64,
            "cumulative_tokens": state.cumulative_tokens,
        })
    }

    /// Rebuild a context from a prior `snapshot()`, for `resume`.
    pub fn from_snapshot(snapshot: &Value) -> Result<Self> {
        let get_str = |key: &str| -> Result<String> {
            snapshot
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| PilotError::Storage {
                    message: format!("checkpoint missing field {key}"),
                })
        };
        let run_mode: RunMode = snapshot
            .get("run_mode")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| PilotError::Storage { message: e.to_string() })?
            .unwrap_or(RunMode::Production);

        let ctx = Self::new(
            get_str("execution_id")?,
            get_str("agent_id")?,
            get_str("user_id")?,
            get_str("session_id")?,
            snapshot.get("input").cloned().unwrap_or(Value::Null),
            run_mode,
        );

        {
            let mut state = ctx.0.state.write();
            if let Some(order) = snapshot.get("step_order").and_then(Value::as_array) {
                state.step_order = order.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
            }
            if let Some(outputs) = snapshot.get("step_outputs").and_then(Value::as_object) {
                for (id, raw) in outputs {
                    if let Ok(output) = serde_json::from_value::<StepOutput>(raw.clone()) {
                        state.step_outputs.insert(id.clone(), output);
                    }
                }
            }
            if let Some(vars) = snapshot.get("variables").and_then(Value::as_object) {
                for (k, v) in vars {
                    state.variables.insert(k.clone(), v.clone());
                }
            }
            let to_vec = |key: &str| -> Vec<String> {
                snapshot
                    .get(key)
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default()
            };
            state.completed = to_vec("completed");
            state.failed = to_vec("failed");
            state.skipped = to_vec("skipped");
        }
        Ok(ctx)
    }
}

/// A `.`/`[n]` path segment.
#[derive(Debug, Clone)]
enum PathSegment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let mut rest = part;
        if let Some(bracket) = rest.find('[') {
            let key = &rest[..bracket];
            if !key.is_empty() {
                segments.push(PathSegment::Key(key.to_string()));
            }
            rest = &rest[bracket..];
            while let Some(stripped) = rest.strip_prefix('[') {
                if let Some(end) = stripped.find(']') {
                    if let Ok(idx) = stripped[..end].parse::<usize>() {
                        segments.push(PathSegment::Index(idx));
                    }
                    rest = &stripped[end + 1..];
                } else {
                    break;
                }
            }
        } else {
            segments.push(PathSegment::Key(rest.to_string()));
        }
    }
    segments
}

fn navigate(value: &Value, segments: &[PathSegment]) -> Result<Value> {
    let mut current = value.clone();
    for segment in segments {
        current = match (segment, &current) {
            (PathSegment::Key(key), Value::Object(map)) => map
                .get(key)
                .cloned()
                .ok_or_else(|| PilotError::Execution {
                    message: format!("missing key '{key}' in resolved value"),
                    step_id: None,
                    code: pilot_core::ErrorCode::MissingInputData,
                })?,
            (PathSegment::Index(idx), Value::Array(arr)) => arr
                .get(*idx)
                .cloned()
                .ok_or_else(|| PilotError::Execution {
                    message: format!("index {idx} out of bounds"),
                    step_id: None,
                    code: pilot_core::ErrorCode::MissingInputData,
                })?,
            _ => {
                return Err(PilotError::Execution {
                    message: "cannot navigate into scalar value".to_string(),
                    step_id: None,
                    code: pilot_core::ErrorCode::MissingInputData,
                })
            }
        };
    }
    Ok(current)
}

/// Resolves a single `{{…}}` reference body (without the braces) against
/// the context and a set of transient local bindings (iteration
/// variables, `this`, `@index`).
pub fn resolve_reference(ctx: &ExecutionContext, locals: &HashMap<String, Value>, reference: &str) -> Result<Value> {
    let reference = reference.trim();
    let segments = parse_path(reference);
    let Some(first) = segments.first() else {
        return Err(PilotError::Execution {
            message: "empty reference".to_string(),
            step_id: None,
            code: pilot_core::ErrorCode::MissingInputData,
        });
    };
    let PathSegment::Key(first_key) = first else {
        return Err(PilotError::Execution {
            message: "reference cannot start with an index".to_string(),
            step_id: None,
            code: pilot_core::ErrorCode::MissingInputData,
        });
    };

    if first_key == "input" {
        return navigate(ctx.input(), &segments[1..]);
    }
    if first_key == "var" {
        let PathSegment::Key(name) = segments.get(1).ok_or_else(|| PilotError::Execution {
            message: "var reference missing variable name".to_string(),
            step_id: None,
            code: pilot_core::ErrorCode::MissingInputData,
        })?
        else {
            return Err(PilotError::Execution {
                message: "var reference missing variable name".to_string(),
                step_id: None,
                code: pilot_core::ErrorCode::MissingInputData,
            });
        };
        let value = ctx.get_variable(name).or_else(|| locals.get(name).cloned()).ok_or_else(|| {
            PilotError::Execution {
                message: format!("unknown variable '{name}'"),
                step_id: None,
                code: pilot_core::ErrorCode::MissingInputData,
            }
        })?;
        return navigate(&value, &segments[2..]);
    }
    if let Some(local) = locals.get(first_key) {
        return navigate(local, &segments[1..]);
    }
    if let Some(step_id) = first_key.strip_prefix("step") {
        if let Some(output) = ctx.get_step_output(step_id) {
            return resolve_step_fields(&output, &segments[1..]);
        }
        return Err(PilotError::Execution {
            message: format!("unknown step reference 'step{step_id}'"),
            step_id: None,
            code: pilot_core::ErrorCode::MissingInputData,
        });
    }
    if let Some(output) = ctx.get_step_output(first_key) {
        return resolve_step_fields(&output, &segments[1..]);
    }

    Err(PilotError::Execution {
        message: format!("unresolvable reference '{reference}'"),
        step_id: None,
        code: pilot_core::ErrorCode::MissingInputData,
    })
}

fn resolve_step_fields(output: &StepOutput, rest: &[PathSegment]) -> Result<Value> {
    match rest.first() {
        Some(PathSegment::Key(key)) if key == "data" => navigate(&output.data, &rest[1..]),
        Some(PathSegment::Key(key)) if key == "metadata" => {
            navigate(&serde_json::to_value(&output.metadata).unwrap_or(Value::Null), &rest[1..])
        }
        None => Ok(output.data.clone()),
        _ => Err(PilotError::Execution {
            message: "step reference must use '.data' or '.metadata'".to_string(),
            step_id: None,
            code: pilot_core::ErrorCode::MissingInputData,
        }),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn json_escape(value: &Value) -> String {
    match value {
        Value::String(s) => {
            let quoted = serde_json::to_string(s).unwrap_or_default();
            quoted[1..quoted.len().saturating_sub(1)].to_string()
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Simple substitution: every `{{x}}` (not a block helper) is replaced by
/// its stringified resolved value. Missing keys fall back to an empty
/// string (spec.md §4.2 "templates fall back to empty string").
#[must_use]
pub fn render_simple(ctx: &ExecutionContext, locals: &HashMap<String, Value>, template: &str) -> String {
    render_with(ctx, locals, template, stringify)
}

/// Same as `render_simple` but escapes inserted string values so the
/// result is safe to embed inside a JSON string literal.
#[must_use]
pub fn render_simple_json_escaped(ctx: &ExecutionContext, locals: &HashMap<String, Value>, template: &str) -> String {
    render_with(ctx, locals, template, json_escape)
}

fn render_with(
    ctx: &ExecutionContext,
    locals: &HashMap<String, Value>,
    template: &str,
    stringifier: fn(&Value) -> String,
) -> String {
    let rendered_blocks = render_blocks(ctx, locals, template);
    template_token_re()
        .replace_all(&rendered_blocks, |caps: &regex::Captures| {
            let expr = caps[1].trim();
            if expr.starts_with('#') || expr.starts_with('/') || expr == "else" {
                return caps[0].to_string();
            }
            match resolve_in_scope(ctx, locals, expr) {
                Ok(value) => stringifier(&value),
                Err(_) => String::new(),
            }
        })
        .into_owned()
}

fn resolve_in_scope(ctx: &ExecutionContext, locals: &HashMap<String, Value>, expr: &str) -> Result<Value> {
    if expr == "this" {
        return locals.get("this").cloned().ok_or_else(|| PilotError::Execution {
            message: "no implicit 'this' in scope".to_string(),
            step_id: None,
            code: pilot_core::ErrorCode::MissingInputData,
        });
    }
    if expr == "@index" {
        return locals.get("@index").cloned().ok_or_else(|| PilotError::Execution {
            message: "no '@index' in scope".to_string(),
            step_id: None,
            code: pilot_core::ErrorCode::MissingInputData,
        });
    }
    match resolve_reference(ctx, locals, expr) {
        Ok(value) => Ok(value),
        Err(err) => {
            if let Some(this) = locals.get("this") {
                navigate(this, &parse_path(expr)).map_err(|_| err)
            } else {
                Err(err)
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Finds the first top-level block helper and expands it, recursing into
/// its body; returns the template unchanged if there is no block helper
/// at all. Supports `{{#each}}`, `{{#if}}`, `{{#unless}}`, `{{#with}}`.
fn render_blocks(ctx: &ExecutionContext, locals: &HashMap<String, Value>, template: &str) -> String {
    let open_re = Regex::new(r"\{\{#(each|if|unless|with)\s+([^{}]+?)\}\}").unwrap();
    let Some(open) = open_re.find(template) else {
        return template.to_string();
    };
    let caps = open_re.captures(template).unwrap();
    let helper = caps[1].to_string();
    let expr = caps[2].trim().to_string();
    let close_tag = format!("{{{{/{helper}}}}}");
    let open_tag_re = Regex::new(&format!(r"\{{\{{#{helper}\b")).unwrap();

    let after_open = &template[open.end()..];
    let mut depth = 1usize;
    let mut search_from = 0usize;
    let mut close_start = None;
    while let Some(rel) = after_open[search_from..].find(&close_tag) {
        let close_pos = search_from + rel;
        let before = &after_open[search_from..close_pos];
        depth += open_tag_re.find_iter(before).count();
        depth -= 1;
        if depth == 0 {
            close_start = Some(close_pos);
            break;
        }
        search_from = close_pos + close_tag.len();
    }
    let Some(close_start) = close_start else {
        return template.to_string();
    };

    let body = &after_open[..close_start];
    let tail = &after_open[close_start + close_tag.len()..];
    let prefix = &template[..open.start()];

    let (then_body, else_body) = split_top_level_else(body, &helper);

    let expanded = match helper.as_str() {
        "each" => render_each(ctx, locals, &expr, then_body, else_body),
        "if" => {
            if resolve_in_scope(ctx, locals, &expr).map(|v| truthy(&v)).unwrap_or(false) {
                render_blocks(ctx, locals, then_body)
            } else {
                else_body.map(|b| render_blocks(ctx, locals, b)).unwrap_or_default()
            }
        }
        "unless" => {
            if !resolve_in_scope(ctx, locals, &expr).map(|v| truthy(&v)).unwrap_or(false) {
                render_blocks(ctx, locals, then_body)
            } else {
                else_body.map(|b| render_blocks(ctx, locals, b)).unwrap_or_default()
            }
        }
        "with" => match resolve_in_scope(ctx, locals, &expr) {
            Ok(value) => {
                let mut inner = locals.clone();
                inner.insert("this".to_string(), value);
                render_blocks(ctx, &inner, then_body)
            }
            Err(_) => else_body.map(|b| render_blocks(ctx, locals, b)).unwrap_or_default(),
        },
        _ => String::new(),
    };

    format!("{prefix}{expanded}{}", render_blocks(ctx, locals, tail))
}

fn split_top_level_else<'a>(body: &'a str, helper: &str) -> (&'a str, Option<&'a str>) {
    let else_tag = "{{else}}";
    let open_tag = format!("{{{{#{helper}");
    let close_tag = format!("{{{{/{helper}}}}}");
    let mut depth = 0i32;
    let mut i = 0usize;
    while i < body.len() {
        if body[i..].starts_with(&open_tag) {
            depth += 1;
            i += open_tag.len();
        } else if body[i..].starts_with(&close_tag) {
            depth -= 1;
            i += close_tag.len();
        } else if depth == 0 && body[i..].starts_with(else_tag) {
            return (&body[..i], Some(&body[i + else_tag.len()..]));
        } else {
            i += 1;
        }
    }
    (body, None)
}

fn render_each(ctx: &ExecutionContext, locals: &HashMap<String, Value>, expr: &str, body: &str, empty_body: Option<&str>) -> String {
    let Ok(collection) = resolve_in_scope(ctx, locals, expr) else {
        return empty_body.map(|b| render_blocks(ctx, locals, b)).unwrap_or_default();
    };
    let items: Vec<Value> = match collection {
        Value::Array(a) => a,
        Value::Object(map) => map.into_values().collect(),
        other => vec![other],
    };
    if items.is_empty() {
        return empty_body.map(|b| render_blocks(ctx, locals, b)).unwrap_or_default();
    }
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let mut inner = locals.clone();
            inner.insert("this".to_string(), bind_iteration_item(item.clone()));
            inner.insert("@index".to_string(), Value::from(index));
            render_blocks(ctx, &inner, body)
        })
        .collect()
}

/// Binds an iteration variable with both snake_case and camelCase aliases
/// for every top-level object key, so downstream templates/conditions
/// authored in either convention resolve regardless of producer casing
/// (spec.md §4.2 "Key normalization in iteration binding").
#[must_use]
pub fn bind_iteration_item(value: Value) -> Value {
    let Value::Object(map) = value else {
        return value;
    };
    let mut out = serde_json::Map::with_capacity(map.len() * 2);
    for (key, v) in map {
        let snake = to_snake_case(&key);
        let camel = to_camel_case(&key);
        out.insert(key, v.clone());
        out.entry(snake).or_insert_with(|| v.clone());
        out.entry(camel).or_insert(v);
    }
    Value::Object(out)
}

fn to_snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, ch) in s.chars().enumerate() {
        if ch.is_uppercase() {
            if i != 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn to_camel_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut capitalize_next = false;
    for ch in s.chars() {
        if ch == '_' || ch == '-' {
            capitalize_next = true;
        } else if capitalize_next {
            out.extend(ch.to_uppercase());
            capitalize_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("exec1", "agent1", "user1", "session1", serde_json::json!({"name": "Ada"}), RunMode::Production)
    }

    #[test]
    fn resolves_input_reference() {
        let ctx = ctx();
        let value = resolve_reference(&ctx, &HashMap::new(), "input.name").unwrap();
        assert_eq!(value, Value::String("Ada".to_string()));
    }

    #[test]
    fn resolves_step_data_reference() {
        let ctx = ctx();
        ctx.set_step_output(
            "1",
            StepOutput::success("1", "system", "delay", serde_json::json!({"score": 85}), StdDuration::from_millis(1)),
        );
        let value = resolve_reference(&ctx, &HashMap::new(), "step1.data.score").unwrap();
        assert_eq!(value, serde_json::json!(85));
    }

    #[test]
    fn whole_data_object_returned_without_path() {
        let ctx = ctx();
        ctx.set_step_output(
            "1",
            StepOutput::success("1", "system", "delay", serde_json::json!({"score": 85}), StdDuration::from_millis(1)),
        );
        let value = resolve_reference(&ctx, &HashMap::new(), "step1.data").unwrap();
        assert_eq!(value, serde_json::json!({"score": 85}));
    }

    #[test]
    fn set_step_output_is_idempotent_and_preserves_order() {
        let ctx = ctx();
        ctx.set_step_output("a", StepOutput::success("a", "s", "k", Value::Null, StdDuration::from_millis(1)));
        ctx.set_step_output("b", StepOutput::success("b", "s", "k", Value::Null, StdDuration::from_millis(1)));
        ctx.set_step_output("a", StepOutput::success("a", "s", "k", serde_json::json!({"x": 1}), StdDuration::from_millis(2)));

        let all = ctx.get_all_step_outputs();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "a");
        assert_eq!(all[1].0, "b");
        assert_eq!(all[0].1.data, serde_json::json!({"x": 1}));
    }

    #[test]
    fn missing_key_is_recoverable_error() {
        let ctx = ctx();
        let err = resolve_reference(&ctx, &HashMap::new(), "input.missing").unwrap_err();
        assert!(err.to_string().contains("missing key"));
    }

    #[test]
    fn simple_template_substitution() {
        let ctx = ctx();
        let rendered = render_simple(&ctx, &HashMap::new(), "Hello {{input.name}}!");
        assert_eq!(rendered, "Hello Ada!");
    }

    #[test]
    fn missing_reference_falls_back_to_empty_string() {
        let ctx = ctx();
        let rendered = render_simple(&ctx, &HashMap::new(), "Hello {{input.missing}}!");
        assert_eq!(rendered, "Hello !");
    }

    #[test]
    fn each_block_renders_items_with_index() {
        let ctx = ctx();
        let mut locals = HashMap::new();
        locals.insert("list".to_string(), serde_json::json!(["x", "y"]));
        let rendered = render_simple(&ctx, &locals, "{{#each list}}[{{@index}}:{{this}}]{{/each}}");
        assert_eq!(rendered, "[0:x][1:y]");
    }

    #[test]
    fn if_else_block_picks_branch() {
        let ctx = ctx();
        let mut locals = HashMap::new();
        locals.insert("flag".to_string(), Value::Bool(true));
        let rendered = render_simple(&ctx, &locals, "{{#if flag}}yes{{else}}no{{/if}}");
        assert_eq!(rendered, "yes");
        locals.insert("flag".to_string(), Value::Bool(false));
        let rendered = render_simple(&ctx, &locals, "{{#if flag}}yes{{else}}no{{/if}}");
        assert_eq!(rendered, "no");
    }

    #[test]
    fn json_escape_variant_escapes_quotes() {
        let ctx = ctx();
        let mut locals = HashMap::new();
        locals.insert("text".to_string(), Value::String("say \"hi\"".to_string()));
        let rendered = render_simple_json_escaped(&ctx, &locals, "{\"msg\": \"{{text}}\"}");
        assert_eq!(rendered, "{\"msg\": \"say \\\"hi\\\"\"}");
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["msg"], "say \"hi\"");
    }

    #[test]
    fn bind_iteration_item_adds_case_aliases() {
        let bound = bind_iteration_item(serde_json::json!({"order_id": 7}));
        assert_eq!(bound["order_id"], 7);
        assert_eq!(bound["orderId"], 7);
    }

    #[test]
    fn snapshot_roundtrips_through_from_snapshot() {
        let ctx = ctx();
        ctx.set_step_output("a", StepOutput::success("a", "s", "k", serde_json::json!({"x": 1}), StdDuration::from_millis(1)));
        ctx.set_variable("v", serde_json::json!(42));
        ctx.mark_completed("a");

        let snap = ctx.snapshot();
        let restored = ExecutionContext::from_snapshot(&snap).unwrap();
        assert_eq!(restored.execution_id(), "exec1");
        assert_eq!(restored.get_variable("v"), Some(serde_json::json!(42)));
        assert_eq!(restored.completed_steps(), vec!["a".to_string()]);
        assert_eq!(restored.get_step_output("a").unwrap().data, serde_json::json!({"x": 1}));
    }
}
