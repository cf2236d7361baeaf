//! ABOUTME: StepExecutor — dispatches one step to its plugin/LLM/local engine
//! ABOUTME: Grounded on spec.md §4.5; never panics across the step boundary, always returns a StepOutput

use crate::cache::{CacheKey, StepCache};
use crate::conditions::{evaluate_binary, Condition, ConditionalEvaluator};
use crate::context::{bind_iteration_item, render_simple, resolve_reference, ExecutionContext};
use crate::normalizer::map_to_declared_outputs;
use crate::parallel::ParallelExecutor;
use crate::transforms::{execute_operation, wrap_result};
use pilot_core::traits::{LlmClient, LlmExtras, PluginRuntime};
use pilot_core::{ErrorCode, PilotError, Result, StepKind, StepOutput, TokenUsage, WorkflowStep};
use pilot_state::StateManager;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_SCHEMA_RETRIES: u32 = 2;

/// Executes a single `WorkflowStep` against its declared kind, handling
/// caching, parameter resolution, declared-output normalization, and state
/// logging. `loop` and `scatter_gather` fan out through the injected
/// `ParallelExecutor`; `sub_workflow`, `human_approval`, and `parallel_group`
/// are driven by the orchestrator directly and are not expected to reach
/// `execute_step`.
pub struct StepExecutor {
    plugin_runtime: Option<Arc<dyn PluginRuntime>>,
    llm_client: Option<Arc<dyn LlmClient>>,
    state_manager: Arc<dyn StateManager>,
    cache: Arc<StepCache>,
    enable_caching: bool,
    /// Set once by the orchestrator after both collaborators exist, since
    /// `ParallelExecutor` holds a `StepExecutor` to run its inner steps.
    parallel_executor: OnceLock<Weak<ParallelExecutor>>,
}

impl StepExecutor {
    #[must_use]
    pub fn new(
        plugin_runtime: Option<Arc<dyn PluginRuntime>>,
        llm_client: Option<Arc<dyn LlmClient>>,
        state_manager: Arc<dyn StateManager>,
        cache: Arc<StepCache>,
        enable_caching: bool,
    ) -> Self {
        Self {
            plugin_runtime,
            llm_client,
            state_manager,
            cache,
            enable_caching,
            parallel_executor: OnceLock::new(),
        }
    }

    /// Late-bind the `ParallelExecutor` used for `scatter_gather` dispatch.
    /// Calling this a second time is a no-op; the first binding wins.
    pub fn bind_parallel_executor(&self, parallel: Weak<ParallelExecutor>) {
        let _ = self.parallel_executor.set(parallel);
    }

    fn parallel_executor(&self) -> Option<Arc<ParallelExecutor>> {
        self.parallel_executor.get().and_then(Weak::upgrade)
    }

    /// Runs one step to completion (including its own retries) and returns
    /// a `StepOutput` that is always populated, success or failure.
    pub async fn execute_step(&self, step: &WorkflowStep, ctx: &ExecutionContext, cancellation: &CancellationToken) -> StepOutput {
        self.execute_step_with_locals(step, ctx, &HashMap::new(), cancellation).await
    }

    /// Like `execute_step`, but with extra transient bindings in scope —
    /// used by `loop`/`scatter_gather` to expose the current iteration item
    /// to the step's `{{…}}` references without polluting shared variables.
    pub(crate) async fn execute_step_with_locals(
        &self,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
        locals: &HashMap<String, Value>,
        cancellation: &CancellationToken,
    ) -> StepOutput {
        let cache_key = if self.enable_caching && step.kind.is_cacheable() {
            Some(CacheKey::new(step.id.clone(), step.kind.name(), &kind_fingerprint(&step.kind)))
        } else {
            None
        };

        if let Some(key) = &cache_key {
            if let Some(cached) = self.cache.get(key) {
                debug!(step_id = %step.id, "cache hit");
                return cached;
            }
        }

        if let Err(e) = self.state_manager.log_step_start(ctx.execution_id(), &step.id).await {
            warn!(step_id = %step.id, error = %e, "failed to log step start");
        }
        ctx.set_current_step(step.id.clone());

        let max_attempts = step.retry_policy.as_ref().map_or(1, |p| p.max_attempts.max(1));
        let mut attempt = 0;
        let started = Instant::now();
        let mut output = loop {
            attempt += 1;
            if cancellation.is_cancelled() {
                break StepOutput::failure(step.id.clone(), "execution cancelled", ErrorCode::ExecutionTimeout.as_str(), started.elapsed());
            }
            match self.dispatch(step, ctx, locals, cancellation).await {
                Ok(data) => {
                    break self.finish_success(step, data, started.elapsed());
                }
                Err(e) => {
                    if attempt >= max_attempts {
                        break StepOutput::failure(step.id.clone(), e.to_string(), error_code_of(&e).as_str(), started.elapsed());
                    }
                    let policy = step.retry_policy.as_ref().expect("max_attempts > 1 implies a retry policy");
                    let backoff = if policy.exponential_backoff {
                        policy.backoff_seconds.saturating_mul(1 << (attempt - 1).min(16))
                    } else {
                        policy.backoff_seconds
                    };
                    warn!(step_id = %step.id, attempt, error = %e, "step failed, retrying");
                    tokio::time::sleep(Duration::from_secs(u64::from(backoff))).await;
                }
            }
        };

        ctx.add_execution_time(output.metadata.execution_time);
        if let Some(tokens) = output.metadata.tokens_used {
            ctx.add_tokens(tokens);
        }

        if let Err(e) = self.state_manager.log_step_result(ctx.execution_id(), &output).await {
            warn!(step_id = %step.id, error = %e, "failed to log step result");
        }

        if output.metadata.success {
            ctx.mark_completed(step.id.clone());
            if let (Some(key), true) = (&cache_key, self.enable_caching) {
                self.cache.put(key.clone(), output.clone());
            }
        } else {
            ctx.mark_failed(step.id.clone());
        }

        if let Some(var) = &step.output_variable {
            ctx.set_variable(var.clone(), output.data.clone());
        }
        ctx.set_step_output(step.id.clone(), output.clone());
        output
    }

    fn finish_success(&self, step: &WorkflowStep, data: Value, elapsed: Duration) -> StepOutput {
        let declared: Vec<String> = step.outputs.keys().cloned().collect();
        let normalized = if declared.is_empty() {
            crate::normalizer::normalize_step_output(&data)
        } else {
            map_to_declared_outputs(&data, &declared)
        };
        let mut out = StepOutput::success(step.id.clone(), plugin_name_of(&step.kind), step.kind.name(), normalized.data, elapsed);
        out.raw = Some(data);
        out.meta = normalized.meta;
        out
    }

    async fn dispatch(
        &self,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
        locals: &HashMap<String, Value>,
        cancellation: &CancellationToken,
    ) -> Result<Value> {
        match &step.kind {
            StepKind::Action { plugin, action, params } => self.dispatch_action(step, ctx, locals, plugin, action, params).await,
            StepKind::AiProcessing { prompt, output_schema } => self.dispatch_llm(step, ctx, locals, prompt.as_deref(), output_schema.as_ref(), false).await,
            StepKind::LlmDecision { prompt, output_schema } => self.dispatch_llm(step, ctx, locals, prompt.as_deref(), output_schema.as_ref(), true).await,
            StepKind::Conditional { condition, then_steps, else_steps } => {
                self.dispatch_conditional(step, ctx, locals, condition, then_steps, else_steps, cancellation).await
            }
            StepKind::Switch { evaluate, cases, default } => self.dispatch_switch(step, ctx, locals, evaluate, cases, default).await,
            StepKind::Transform { operation, input, config } => {
                let resolved_input = resolve_value(ctx, locals, input);
                let resolved_config = resolve_value(ctx, locals, config);
                let result = execute_operation(operation, &resolved_input, &resolved_config, ctx)?;
                Ok(wrap_result(result, &step.outputs.keys().cloned().collect::<Vec<_>>()))
            }
            StepKind::Delay { duration } => {
                let d = duration.unwrap_or(Duration::from_secs(0));
                tokio::select! {
                    () = tokio::time::sleep(d) => {}
                    () = cancellation.cancelled() => {
                        return Err(PilotError::execution("delay cancelled", Some(step.id.clone()), ErrorCode::ExecutionTimeout));
                    }
                }
                Ok(serde_json::json!({ "waited_ms": d.as_millis() as u64 }))
            }
            StepKind::Enrichment { config } => Ok(resolve_value(ctx, locals, config)),
            StepKind::Validation { schema, rules } => self.dispatch_validation(ctx, locals, schema.as_ref(), rules.as_ref()),
            StepKind::Comparison { left, right, operation } => {
                let l = resolve_value(ctx, locals, left);
                let r = resolve_value(ctx, locals, right);
                let result = evaluate_binary(&l, operation, &r).map_err(|_| {
                    PilotError::execution(
                        format!("unknown comparison operation '{operation}'"),
                        Some(step.id.clone()),
                        ErrorCode::UnknownComparisonOperation,
                    )
                })?;
                Ok(serde_json::json!({ "result": result, "left": l, "right": r, "operation": operation }))
            }
            StepKind::ScatterGather { scatter, gather } => {
                let Some(parallel) = self.parallel_executor() else {
                    return Err(PilotError::execution(
                        "scatter_gather step requires a ParallelExecutor to be injected",
                        Some(step.id.clone()),
                        ErrorCode::MissingParallelExecutor,
                    ));
                };
                parallel.scatter_gather(&step.id, scatter, gather, ctx, cancellation).await
            }
            StepKind::Loop { iterate_over, loop_steps, parallel, item_name } => {
                let Some(parallel_executor) = self.parallel_executor() else {
                    return Err(PilotError::execution(
                        "loop step requires a ParallelExecutor to be injected",
                        Some(step.id.clone()),
                        ErrorCode::MissingParallelExecutor,
                    ));
                };
                parallel_executor.run_loop(iterate_over, loop_steps, *parallel, item_name, ctx, cancellation).await
            }
            StepKind::ParallelGroup { .. } | StepKind::SubWorkflow { .. } | StepKind::HumanApproval { .. } => {
                Err(PilotError::execution(
                    format!("step kind '{}' is orchestrated directly and cannot be dispatched by the step executor", step.kind.name()),
                    Some(step.id.clone()),
                    ErrorCode::InvalidStepType,
                ))
            }
        }
    }

    async fn dispatch_action(
        &self,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
        locals: &HashMap<String, Value>,
        plugin: &str,
        action: &str,
        params: &Value,
    ) -> Result<Value> {
        let Some(runtime) = &self.plugin_runtime else {
            return Err(PilotError::execution("no plugin runtime configured", Some(step.id.clone()), ErrorCode::MissingPluginAction));
        };
        let resolved = resolve_value(ctx, locals, params);
        let definition = runtime.get_plugin_definition(plugin).await.ok();
        let adapted = match definition.as_ref().and_then(|d| d.actions.get(action)) {
            Some(def) => adapt_params_to_schema(resolved, def),
            None => resolved,
        };
        let result = runtime.execute(ctx.user_id(), plugin, action, adapted).await?;
        if result.success {
            Ok(result.data.unwrap_or(Value::Null))
        } else {
            Err(PilotError::execution(
                result.error.or(result.message).unwrap_or_else(|| "plugin action failed".to_string()),
                Some(step.id.clone()),
                ErrorCode::StepExecutionFailed,
            ))
        }
    }

    async fn dispatch_llm(
        &self,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
        locals: &HashMap<String, Value>,
        prompt: Option<&str>,
        output_schema: Option<&Value>,
        is_decision: bool,
    ) -> Result<Value> {
        let Some(client) = &self.llm_client else {
            return Err(PilotError::execution("no LLM client configured", Some(step.id.clone()), ErrorCode::LlmDecisionFailed));
        };
        let rendered_prompt = prompt.map(|p| render_simple(ctx, locals, p)).unwrap_or_default();
        let full_prompt = build_llm_prompt(&step.name, &rendered_prompt, ctx);
        let extras = LlmExtras {
            expose_plugins: !is_decision,
            output_schema: output_schema.cloned(),
        };

        let mut last_error = None;
        for round in 0..=MAX_SCHEMA_RETRIES {
            let prompt_for_round = if round == 0 {
                full_prompt.clone()
            } else {
                format!("{full_prompt}\n\nYour previous reply did not satisfy the required output schema. Reply again with valid JSON matching it.")
            };
            let response = client.run(ctx.user_id(), ctx.agent_id(), &prompt_for_round, extras.clone(), ctx.session_id()).await?;
            if !response.success {
                last_error = Some(response.error.unwrap_or_else(|| "LLM call failed".to_string()));
                continue;
            }
            let raw_text = if is_decision { response.response.clone() } else { strip_narrative_commentary(&response.response) };
            let normalized = crate::normalizer::normalize_step_output(&Value::String(raw_text));
            if let Some(schema) = output_schema {
                if !validates_against_schema(schema, &normalized.data) {
                    last_error = Some("LLM response did not satisfy the declared output schema".to_string());
                    continue;
                }
            }
            ctx.add_tokens(response.tokens_used);
            let mut data = normalized.data;
            apply_result_aliases(&mut data);
            if let Value::Object(map) = &mut data {
                map.entry("tokensUsed").or_insert_with(|| serde_json::to_value(response.tokens_used).unwrap_or(Value::Null));
            }
            return Ok(data);
        }
        Err(PilotError::execution(
            last_error.unwrap_or_else(|| "LLM call exhausted retries".to_string()),
            Some(step.id.clone()),
            ErrorCode::LlmDecisionFailed,
        ))
    }

    async fn dispatch_conditional(
        &self,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
        locals: &HashMap<String, Value>,
        condition: &Value,
        then_steps: &[WorkflowStep],
        else_steps: &[WorkflowStep],
        cancellation: &CancellationToken,
    ) -> Result<Value> {
        let condition: Condition = serde_json::from_value(condition.clone())
            .map_err(|e| PilotError::condition(format!("invalid condition shape: {e}")))?;
        let branch_taken = ConditionalEvaluator::evaluate(&condition, ctx, locals)?;
        let branch = if branch_taken { then_steps } else { else_steps };
        let last = self.run_branch(branch, ctx, locals, cancellation).await;
        Ok(serde_json::json!({
            "branchTaken": if branch_taken { "then" } else { "else" },
            "conditionResult": branch_taken,
            "lastStepOutput": last,
        }))
    }

    async fn dispatch_switch(
        &self,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
        locals: &HashMap<String, Value>,
        evaluate: &str,
        cases: &[pilot_core::SwitchCase],
        default: &Option<Vec<String>>,
    ) -> Result<Value> {
        let rendered = render_simple(ctx, locals, evaluate);
        let matched = cases.iter().find(|c| c.when == rendered);
        let (branch_name, steps) = match matched {
            Some(case) => (case.when.clone(), Some(case.steps.clone())),
            None => ("default".to_string(), default.clone()),
        };
        ctx.set_variable(format!("{}_branch", step.id), Value::String(branch_name.clone()));
        Ok(serde_json::json!({
            "evaluated": rendered,
            "matchedCase": branch_name,
            "nextSteps": steps.unwrap_or_default(),
        }))
    }

    /// Runs a nested branch (`conditional`'s `then_steps`/`else_steps`)
    /// sequentially through this same executor, returning the last step's
    /// output data. Boxed because `execute_step` recurses through this path.
    pub(crate) fn run_branch<'a>(
        &'a self,
        steps: &'a [WorkflowStep],
        ctx: &'a ExecutionContext,
        locals: &'a HashMap<String, Value>,
        cancellation: &'a CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<Value>> + Send + 'a>> {
        Box::pin(async move {
            let mut last = None;
            for step in steps {
                if cancellation.is_cancelled() {
                    break;
                }
                if let Some(execute_if) = &step.execute_if {
                    let condition: Result<Condition> = serde_json::from_value(execute_if.clone()).map_err(|e| PilotError::condition(e.to_string()));
                    match condition.and_then(|c| ConditionalEvaluator::evaluate(&c, ctx, locals)) {
                        Ok(false) => {
                            ctx.mark_skipped(step.id.clone());
                            continue;
                        }
                        Err(_) => continue,
                        Ok(true) => {}
                    }
                }
                let output = self.execute_step_with_locals(step, ctx, locals, cancellation).await;
                let failed = !output.metadata.success;
                last = Some(output.data.clone());
                if failed && !step.continue_on_error {
                    break;
                }
            }
            last
        })
    }

    fn dispatch_validation(
        &self,
        ctx: &ExecutionContext,
        locals: &HashMap<String, Value>,
        schema: Option<&Value>,
        rules: Option<&Value>,
    ) -> Result<Value> {
        let target_ref = schema
            .and_then(|s| s.get("target"))
            .or_else(|| rules.and_then(|r| r.get("target")))
            .and_then(Value::as_str);
        let target = match target_ref {
            Some(reference) => resolve_reference(ctx, locals, reference).unwrap_or_else(|_| ctx.input().clone()),
            None => ctx.input().clone(),
        };

        let mut errors = Vec::new();
        if let Some(schema_value) = schema {
            let actual_schema = schema_value.get("schema").cloned().unwrap_or_else(|| schema_value.clone());
            if !validates_against_schema(&actual_schema, &target) {
                errors.push("target does not satisfy the declared schema".to_string());
            }
        }
        if let Some(rules_value) = rules {
            let rule_list: Vec<Condition> = rules_value
                .get("rules")
                .or(Some(rules_value))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            for rule in &rule_list {
                match ConditionalEvaluator::evaluate(rule, ctx, locals) {
                    Ok(true) => {}
                    Ok(false) => errors.push(format!("rule failed: {rule:?}")),
                    Err(e) => errors.push(format!("rule error: {e}")),
                }
            }
        }

        Ok(serde_json::json!({ "valid": errors.is_empty(), "errors": errors, "target": target }))
    }
}

fn kind_fingerprint(kind: &StepKind) -> Value {
    serde_json::to_value(kind).unwrap_or(Value::Null)
}

fn plugin_name_of(kind: &StepKind) -> String {
    match kind {
        StepKind::Action { plugin, .. } => plugin.clone(),
        _ => "system".to_string(),
    }
}

fn error_code_of(err: &PilotError) -> ErrorCode {
    err.code().unwrap_or(ErrorCode::StepExecutionFailed)
}

fn validates_against_schema(schema: &Value, instance: &Value) -> bool {
    jsonschema::is_valid(schema, instance)
}

/// The alias keys downstream templates may use interchangeably to reach
/// the LLM's primary result (spec.md §4.5 "ai_processing / llm_decision
/// dispatch").
const RESULT_ALIASES: &[&str] = &["result", "response", "output", "summary", "analysis", "decision", "reasoning", "classification"];

/// Builds the full prompt sent to the LLM client: the step's own rendered
/// prompt, a running summary of prior steps (plugin/action, item counts,
/// completion tallies), and a user-context block when memory was loaded.
fn build_llm_prompt(step_name: &str, rendered_prompt: &str, ctx: &ExecutionContext) -> String {
    let mut parts = vec![rendered_prompt.to_string()];

    let outputs = ctx.get_all_step_outputs();
    if !outputs.is_empty() {
        let mut lines: Vec<String> = outputs
            .iter()
            .map(|(id, out)| {
                let items = out.metadata.item_count.map_or(String::new(), |n| format!(", {n} item(s)"));
                format!("- {id} ({}/{}{items})", out.plugin, out.action)
            })
            .collect();
        lines.push(format!(
            "completed: {}, failed: {}, skipped: {}",
            ctx.completed_steps().len(),
            ctx.failed_steps().len(),
            ctx.skipped_steps().len()
        ));
        parts.push(format!("Context for step '{step_name}':\n{}", lines.join("\n")));
    }

    if !ctx.input().is_null() {
        parts.push(format!("Input values:\n{}", ctx.input()));
    }

    if let Some(memory) = ctx.memory_context() {
        parts.push(format!("User context:\n{memory}"));
    }

    parts.into_iter().filter(|p| !p.is_empty()).collect::<Vec<_>>().join("\n\n")
}

/// Adds the fixed set of result aliases (`result`, `response`, `output`, …)
/// to an LLM output object, all pointing at whichever alias already present
/// best represents the primary value, so downstream templates can reference
/// the answer under any of those names regardless of which one the model's
/// JSON happened to use. A no-op when `data` isn't an object.
fn apply_result_aliases(data: &mut Value) {
    let Value::Object(map) = data else {
        return;
    };
    let primary = RESULT_ALIASES
        .iter()
        .find_map(|key| map.get(*key).cloned())
        .or_else(|| map.get("text").cloned())
        .or_else(|| (map.len() == 1).then(|| map.values().next().cloned()).flatten());
    let Some(primary) = primary else {
        return;
    };
    for alias in RESULT_ALIASES {
        map.entry(*alias).or_insert_with(|| primary.clone());
    }
}

/// Strips a leading or trailing narrative sentence an LLM sometimes adds
/// around a requested summary ("Here's a summary:", "Let me know if you'd
/// like more detail."). Conservative: reverts the strip if it would remove
/// more than a third of the text, since that signals the heuristic matched
/// actual content rather than meta-commentary.
fn strip_narrative_commentary(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') || trimmed.starts_with("```") {
        return text.to_string();
    }

    let leading_markers = ["here's a summary", "here is a summary", "sure,", "certainly,", "summary:"];
    let trailing_markers = ["let me know if", "i hope this helps", "feel free to ask", "hope that helps"];

    let mut lines: Vec<&str> = trimmed.lines().collect();
    if let Some(first) = lines.first() {
        let lowered = first.to_ascii_lowercase();
        if leading_markers.iter().any(|m| lowered.contains(m)) && first.len() < 120 {
            lines.remove(0);
        }
    }
    if let Some(last) = lines.last() {
        let lowered = last.to_ascii_lowercase();
        if trailing_markers.iter().any(|m| lowered.contains(m)) && last.len() < 160 {
            lines.pop();
        }
    }

    let cleaned = lines.join("\n").trim().to_string();
    if cleaned.is_empty() || cleaned.len() * 3 < trimmed.len() {
        text.to_string()
    } else {
        cleaned
    }
}

/// Recursively resolves `{{…}}` references inside a parameter/config tree.
/// A whole-string reference resolves to its typed value; a string containing
/// embedded references is rendered to text.
pub(crate) fn resolve_value(ctx: &ExecutionContext, locals: &HashMap<String, Value>, value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
                resolve_reference(ctx, locals, &trimmed[2..trimmed.len() - 2].trim()).unwrap_or_else(|_| Value::String(s.clone()))
            } else if s.contains("{{") {
                Value::String(render_simple(ctx, locals, s))
            } else {
                Value::String(s.clone())
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(ctx, locals, v)).collect()),
        Value::Object(map) => {
            let resolved: serde_json::Map<String, Value> = map.iter().map(|(k, v)| (k.clone(), resolve_value(ctx, locals, v))).collect();
            Value::Object(resolved)
        }
        other => other.clone(),
    }
}

/// Adapts resolved action parameters to the plugin's declared schema:
/// fills missing required fields with kind-appropriate defaults, wraps a
/// bare object/1-D array into the 2-D shape a `"matrix"`-formatted array
/// parameter expects, and stringifies structured values destined for a
/// plain `string` parameter.
fn adapt_params_to_schema(params: Value, definition: &pilot_core::traits::ActionDefinition) -> Value {
    let Value::Object(mut map) = params else {
        return params;
    };
    for (name, schema) in &definition.parameters {
        let current = map.get(name).cloned();
        let adapted = match (schema.param_type.as_str(), schema.format.as_deref(), current) {
            ("array", Some("matrix"), Some(Value::Object(obj))) => {
                Some(Value::Array(vec![Value::Array(obj.values().cloned().collect())]))
            }
            ("array", Some("matrix"), Some(Value::Array(rows))) if !rows.iter().any(Value::is_array) => {
                Some(Value::Array(vec![Value::Array(rows)]))
            }
            ("string", _, Some(v @ Value::Object(_))) | ("string", _, Some(v @ Value::Array(_))) => {
                Some(Value::String(serde_json::to_string(&v).unwrap_or_default()))
            }
            (_, _, Some(v)) => Some(v),
            (param_type, _, None) if schema.required => Some(default_for_missing(name, param_type)),
            (_, _, None) => None,
        };
        if let Some(value) = adapted {
            map.insert(name.clone(), value);
        }
    }
    Value::Object(map)
}

fn default_for_missing(name: &str, param_type: &str) -> Value {
    if name.to_ascii_lowercase().contains("range") {
        return Value::String("Sheet1".to_string());
    }
    match param_type {
        "string" => Value::String(String::new()),
        "number" | "integer" => serde_json::json!(0),
        "boolean" => Value::Bool(false),
        "array" => Value::Array(Vec::new()),
        "object" => Value::Object(serde_json::Map::new()),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pilot_core::traits::{LlmResponse, PluginDefinition, PluginResult, ToolCall};
    use pilot_core::RunMode;
    use pilot_state::InMemoryStateManager;
    use std::collections::HashMap as Map;

    struct EchoPlugin;

    #[async_trait]
    impl PluginRuntime for EchoPlugin {
        async fn execute(&self, _user_id: &str, _plugin: &str, action: &str, params: Value) -> Result<PluginResult> {
            if action == "fail" {
                return Ok(PluginResult { success: false, data: None, error: Some("boom".to_string()), message: None });
            }
            Ok(PluginResult { success: true, data: Some(params), error: None, message: None })
        }

        async fn get_plugin_definition(&self, _plugin: &str) -> Result<PluginDefinition> {
            Ok(PluginDefinition { actions: Map::new() })
        }
    }

    struct StubLlm {
        reply: String,
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn run(&self, _user_id: &str, _agent_id: &str, _prompt: &str, _extras: LlmExtras, _session_id: &str) -> Result<LlmResponse> {
            Ok(LlmResponse {
                success: true,
                response: self.reply.clone(),
                tool_calls: Vec::<ToolCall>::new(),
                tokens_used: TokenUsage::total_only(42),
                error: None,
            })
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("exec1", "agent1", "user1", "session1", serde_json::json!({"x": 1}), RunMode::Production)
    }

    fn executor(plugin: Option<Arc<dyn PluginRuntime>>, llm: Option<Arc<dyn LlmClient>>) -> StepExecutor {
        StepExecutor::new(plugin, llm, Arc::new(InMemoryStateManager::new()), Arc::new(StepCache::new()), true)
    }

    #[tokio::test]
    async fn action_step_round_trips_through_the_plugin() {
        let state = InMemoryStateManager::new();
        state.create_execution("exec1", "agent1").await.unwrap();
        let exec = StepExecutor::new(Some(Arc::new(EchoPlugin)), None, Arc::new(state), Arc::new(StepCache::new()), true);
        let step = WorkflowStep::new(
            "s1",
            "Echo",
            StepKind::Action {
                plugin: "echo".to_string(),
                action: "run".to_string(),
                params: serde_json::json!({"value": 1}),
            },
        );
        let out = exec.execute_step(&step, &ctx(), &CancellationToken::new()).await;
        assert!(out.metadata.success);
        assert_eq!(out.data["value"], 1);
    }

    #[tokio::test]
    async fn failed_action_is_cached_as_failure_is_not_cached() {
        let state = InMemoryStateManager::new();
        state.create_execution("exec1", "agent1").await.unwrap();
        let exec = StepExecutor::new(Some(Arc::new(EchoPlugin)), None, Arc::new(state), Arc::new(StepCache::new()), true);
        let step = WorkflowStep::new(
            "s1",
            "Fail",
            StepKind::Action {
                plugin: "echo".to_string(),
                action: "fail".to_string(),
                params: Value::Null,
            },
        );
        let out = exec.execute_step(&step, &ctx(), &CancellationToken::new()).await;
        assert!(!out.metadata.success);
        assert_eq!(out.metadata.error_code.as_deref(), Some("STEP_EXECUTION_FAILED"));
    }

    #[tokio::test]
    async fn comparison_step_resolves_references_and_compares() {
        let state = InMemoryStateManager::new();
        state.create_execution("exec1", "agent1").await.unwrap();
        let exec = executor_with_state(state);
        let step = WorkflowStep::new(
            "s1",
            "Compare",
            StepKind::Comparison {
                left: serde_json::json!("{{input.x}}"),
                right: serde_json::json!(1),
                operation: "==".to_string(),
            },
        );
        let out = exec.execute_step(&step, &ctx(), &CancellationToken::new()).await;
        assert!(out.metadata.success);
        assert_eq!(out.data["result"], true);
    }

    #[tokio::test]
    async fn ai_processing_step_uses_the_llm_client() {
        let state = InMemoryStateManager::new();
        state.create_execution("exec1", "agent1").await.unwrap();
        let exec = StepExecutor::new(None, Some(Arc::new(StubLlm { reply: r#"{"summary":"ok"}"#.to_string() })), Arc::new(state), Arc::new(StepCache::new()), true);
        let step = WorkflowStep::new(
            "s1",
            "Summarize",
            StepKind::AiProcessing {
                prompt: Some("summarize {{input.x}}".to_string()),
                output_schema: None,
            },
        );
        let out = exec.execute_step(&step, &ctx(), &CancellationToken::new()).await;
        assert!(out.metadata.success);
        assert_eq!(out.data["summary"], "ok");
    }

    #[tokio::test]
    async fn transform_step_dispatches_through_the_transform_engine() {
        let state = InMemoryStateManager::new();
        state.create_execution("exec1", "agent1").await.unwrap();
        let exec = executor_with_state(state);
        let step = WorkflowStep::new(
            "s1",
            "Filter",
            StepKind::Transform {
                operation: "filter".to_string(),
                input: serde_json::json!({"items": [{"a": 1}, {"a": 2}]}),
                config: serde_json::json!({"field": "a", "operator": ">", "value": 1}),
            },
        );
        let out = exec.execute_step(&step, &ctx(), &CancellationToken::new()).await;
        assert!(out.metadata.success);
        assert_eq!(out.data["count"], 1);
    }

    #[tokio::test]
    async fn unknown_step_kind_dispatched_directly_is_rejected() {
        let state = InMemoryStateManager::new();
        state.create_execution("exec1", "agent1").await.unwrap();
        let exec = executor_with_state(state);
        let step = WorkflowStep::new(
            "s1",
            "SubWorkflow",
            StepKind::SubWorkflow {
                workflow_id: None,
                workflow_steps: None,
                input_mapping: Map::new(),
                output_mapping: None,
                inherit_unmapped_variables: false,
                timeout: None,
            },
        );
        let out = exec.execute_step(&step, &ctx(), &CancellationToken::new()).await;
        assert!(!out.metadata.success);
        assert_eq!(out.metadata.error_code.as_deref(), Some("INVALID_STEP_TYPE"));
    }

    fn executor_with_state(state: InMemoryStateManager) -> StepExecutor {
        StepExecutor::new(None, None, Arc::new(state), Arc::new(StepCache::new()), true)
    }
}
