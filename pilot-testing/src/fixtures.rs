//! ABOUTME: Workflow fixture builders for exercising the planner, executor, and orchestrator in tests

use pilot_core::{Agent, StepKind, WorkflowStep};
use serde_json::Value;
use std::collections::HashMap;

/// An agent whose steps are whatever the caller hands in, with no output
/// schema and no prompts — the minimum needed to drive `Orchestrator::run`.
#[must_use]
pub fn agent(id: &str, steps: Vec<WorkflowStep>) -> Agent {
    Agent {
        id: id.to_string(),
        name: id.to_string(),
        steps,
        legacy_steps: Vec::new(),
        output_schema: None,
        system_prompt: None,
        user_prompt: None,
    }
}

/// An agent declaring an output schema, for exercising `build_output`'s
/// schema-driven path.
#[must_use]
pub fn agent_with_schema(id: &str, steps: Vec<WorkflowStep>, output_schema: HashMap<String, String>) -> Agent {
    let mut a = agent(id, steps);
    a.output_schema = Some(output_schema);
    a
}

/// A single `action` step calling `plugin.action` with the given params.
#[must_use]
pub fn action_step(id: &str, plugin: &str, action: &str, params: Value) -> WorkflowStep {
    WorkflowStep::new(id, id, StepKind::Action { plugin: plugin.to_string(), action: action.to_string(), params })
}

/// A `transform` step running `operation` over `input`.
#[must_use]
pub fn transform_step(id: &str, operation: &str, input: Value) -> WorkflowStep {
    WorkflowStep::new(id, id, StepKind::Transform { operation: operation.to_string(), input, config: Value::Null })
}

/// A `conditional` step branching on a simple field comparison.
#[must_use]
pub fn conditional_step(id: &str, condition: Value, then_steps: Vec<WorkflowStep>, else_steps: Vec<WorkflowStep>) -> WorkflowStep {
    WorkflowStep::new(id, id, StepKind::Conditional { condition, then_steps, else_steps })
}

/// A `delay` step sleeping for the given duration.
#[must_use]
pub fn delay_step(id: &str, duration: std::time::Duration) -> WorkflowStep {
    WorkflowStep::new(id, id, StepKind::Delay { duration: Some(duration) })
}

/// A linear chain of action steps, each depending on the previous one.
#[must_use]
pub fn linear_chain(ids: &[&str]) -> Vec<WorkflowStep> {
    let mut steps = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let mut step = action_step(id, "echo", "run", Value::Null);
        if i > 0 {
            step = step.with_dependency(ids[i - 1]);
        }
        steps.push(step);
    }
    steps
}
