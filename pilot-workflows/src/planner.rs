//! ABOUTME: WorkflowParser — normalizes a raw step list and plans it into levels and parallel groups
//! ABOUTME: Grounded on llmspell-core::traits::workflow::Workflow::plan_execution, generalized to levels

use pilot_core::{PilotError, Result, StepKind, WorkflowStep};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// One step placed by the planner: the step itself plus its level and
/// optional parallel group id (spec.md §3 `ExecutionPlan`).
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub step: WorkflowStep,
    pub level: usize,
    pub parallel_group_id: Option<String>,
}

/// A set of mutually independent steps at the same level (spec.md §3).
#[derive(Debug, Clone)]
pub struct ParallelGroup {
    pub id: String,
    pub level: usize,
    pub step_ids: Vec<String>,
}

/// The result of planning a step list.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub steps: Vec<PlannedStep>,
    pub parallel_groups: Vec<ParallelGroup>,
    pub total_steps: usize,
    /// Rough duration estimate: one unit per level, proportional to depth.
    pub duration_estimate: std::time::Duration,
    pub warnings: Vec<String>,
}

impl ExecutionPlan {
    /// One step per level along the longest dependency chain.
    #[must_use]
    pub fn critical_path(&self) -> Vec<String> {
        let max_level = self.steps.iter().map(|s| s.level).max().unwrap_or(0);
        let mut path = Vec::new();
        for level in 0..=max_level {
            if let Some(step) = self.steps.iter().find(|s| s.level == level) {
                path.push(step.step.id.clone());
            }
        }
        path
    }

    /// A debugging visualization: one line per level, steps grouped by
    /// parallel group where applicable.
    #[must_use]
    pub fn visualize(&self) -> String {
        let max_level = self.steps.iter().map(|s| s.level).max().unwrap_or(0);
        let mut out = String::new();
        for level in 0..=max_level {
            let ids: Vec<&str> = self
                .steps
                .iter()
                .filter(|s| s.level == level)
                .map(|s| s.step.id.as_str())
                .collect();
            out.push_str(&format!("L{level}: [{}]\n", ids.join(", ")));
        }
        out
    }

    #[must_use]
    pub fn level_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().find(|s| s.step.id == step_id).map(|s| s.level)
    }

    #[must_use]
    pub fn max_level(&self) -> usize {
        self.steps.iter().map(|s| s.level).max().unwrap_or(0)
    }

    #[must_use]
    pub fn steps_at_level(&self, level: usize) -> Vec<&PlannedStep> {
        self.steps.iter().filter(|s| s.level == level).collect()
    }
}

/// Priority list of known runtime keys used to rewrite alternate
/// scatter-gather JSON shapes into the canonical
/// `{scatter:{input, steps, item_name}, gather:{operation}}` form.
const SCATTER_INPUT_ALIASES: &[&str] = &["input", "items", "over", "foreach"];
const SCATTER_STEPS_ALIASES: &[&str] = &["steps", "do", "inner_steps", "innerSteps"];

/// Turns a raw step list into an `ExecutionPlan`. Stateless: all behavior
/// is pure functions over the input step list.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Normalize raw JSON step definitions before typed deserialization:
    /// auto-assign missing ids, rewrite legacy `plugin_action` steps into
    /// the canonical `action` form, and canonicalize alternate
    /// scatter-gather shapes. Pure JSON manipulation — the typed
    /// `StepKind` enum only ever sees the canonical shapes.
    pub fn normalize_raw(raw_steps: &mut [Value]) {
        for (idx, value) in raw_steps.iter_mut().enumerate() {
            let Some(obj) = value.as_object_mut() else {
                continue;
            };

            if !obj.contains_key("id") || obj.get("id").map(Value::is_null).unwrap_or(false) {
                obj.insert("id".to_string(), Value::String(format!("step_{}", idx + 1)));
            }

            let kind = obj
                .get("kind")
                .or_else(|| obj.get("type"))
                .and_then(Value::as_str)
                .map(str::to_string);

            if matches!(kind.as_deref(), Some("plugin_action")) {
                obj.insert("kind".to_string(), Value::String("action".to_string()));
                obj.remove("type");
                if !obj.contains_key("params") {
                    if let Some(legacy_params) = obj.remove("parameters") {
                        obj.insert("params".to_string(), legacy_params);
                    }
                }
            } else if kind.is_none() && obj.contains_key("plugin") && obj.contains_key("action") {
                obj.insert("kind".to_string(), Value::String("action".to_string()));
            }

            if matches!(kind.as_deref(), Some("scatter_gather")) || obj.contains_key("scatter") {
                Self::canonicalize_scatter_gather(obj);
            }
        }

        if raw_steps.len() > 1 {
            let none_declared = raw_steps.iter().all(|s| {
                s.get("dependencies")
                    .and_then(Value::as_array)
                    .map(|a| a.is_empty())
                    .unwrap_or(true)
            });
            if none_declared {
                let ids: Vec<String> = raw_steps
                    .iter()
                    .map(|s| s.get("id").and_then(Value::as_str).unwrap_or_default().to_string())
                    .collect();
                for (idx, value) in raw_steps.iter_mut().enumerate() {
                    if idx == 0 {
                        continue;
                    }
                    if let Some(obj) = value.as_object_mut() {
                        obj.insert(
                            "dependencies".to_string(),
                            Value::Array(vec![Value::String(ids[idx - 1].clone())]),
                        );
                    }
                }
            }
        }
    }

    fn canonicalize_scatter_gather(obj: &mut serde_json::Map<String, Value>) {
        if obj.get("scatter").and_then(Value::as_object).is_some() {
            return;
        }
        let input = SCATTER_INPUT_ALIASES
            .iter()
            .find_map(|key| obj.get(*key).cloned())
            .unwrap_or(Value::Null);
        let steps = SCATTER_STEPS_ALIASES
            .iter()
            .find_map(|key| obj.get(*key).cloned())
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let item_name = obj
            .get("item_name")
            .or_else(|| obj.get("itemName"))
            .and_then(Value::as_str)
            .unwrap_or("item")
            .to_string();
        let gather_operation = obj
            .get("gather")
            .and_then(Value::as_object)
            .and_then(|g| g.get("operation"))
            .cloned()
            .unwrap_or_else(|| Value::String("collect".to_string()));

        obj.insert(
            "scatter".to_string(),
            serde_json::json!({"input": input, "steps": steps, "item_name": item_name}),
        );
        obj.insert("gather".to_string(), serde_json::json!({"operation": gather_operation}));
    }

    /// Validate a normalized, typed step list. Returns fatal errors as
    /// `Err`; non-fatal issues are returned separately as warnings.
    pub fn validate(steps: &[WorkflowStep]) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        let mut seen_ids = HashSet::new();

        for step in steps {
            if step.id.trim().is_empty() {
                return Err(PilotError::validation("step has no id after normalization"));
            }
            if !seen_ids.insert(step.id.clone()) {
                return Err(PilotError::validation(format!("duplicate step id: {}", step.id)));
            }
        }

        let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        for step in steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(PilotError::validation(format!(
                        "step {} declares missing dependency {dep}",
                        step.id
                    )));
                }
            }
            Self::validate_kind_fields(step)?;
            if let StepKind::SubWorkflow { workflow_steps, .. } = &step.kind {
                if let Some(inner) = workflow_steps {
                    warnings.extend(
                        Self::validate(inner)
                            .map_err(|e| PilotError::validation(format!("sub_workflow {}: {e}", step.id)))?,
                    );
                }
            }
        }

        Self::detect_cycle(steps)?;
        Ok(warnings)
    }

    fn validate_kind_fields(step: &WorkflowStep) -> Result<()> {
        let err = |msg: String| Err(PilotError::validation(format!("step {}: {msg}", step.id)));
        match &step.kind {
            StepKind::Action { plugin, action, .. } => {
                if plugin.trim().is_empty() || action.trim().is_empty() {
                    return err("action step missing plugin/action".to_string());
                }
            }
            StepKind::Conditional { condition, .. } => {
                if condition.is_null() {
                    return err("conditional step missing condition".to_string());
                }
            }
            StepKind::Loop {
                iterate_over,
                loop_steps,
                ..
            } => {
                if iterate_over.is_null() || loop_steps.is_empty() {
                    return err("loop step missing iterateOver/loopSteps".to_string());
                }
            }
            StepKind::Transform { operation, input, .. } => {
                if operation.trim().is_empty() || input.is_null() {
                    return err("transform step missing operation/input".to_string());
                }
            }
            StepKind::ScatterGather { scatter, gather } => {
                if scatter.input.is_null() || scatter.steps.is_empty() {
                    return err("scatter_gather step missing scatter.input/scatter.steps".to_string());
                }
                let _ = &gather.operation;
            }
            StepKind::Validation { schema, rules } => {
                if schema.is_none() && rules.is_none() {
                    return err("validation step has neither schema nor rules".to_string());
                }
            }
            StepKind::Comparison { left, right, operation } => {
                if left.is_null() || right.is_null() || operation.trim().is_empty() {
                    return err("comparison step missing left/right/operation".to_string());
                }
            }
            StepKind::HumanApproval { approvers, title, .. } => {
                if approvers.is_empty() || title.trim().is_empty() {
                    return err("human_approval step missing approvers/title".to_string());
                }
            }
            StepKind::SubWorkflow {
                workflow_id,
                workflow_steps,
                ..
            } => {
                if workflow_id.is_none() && workflow_steps.is_none() {
                    return err("sub_workflow step has neither workflowId nor workflowSteps".to_string());
                }
            }
            StepKind::AiProcessing { .. }
            | StepKind::LlmDecision { .. }
            | StepKind::Switch { .. }
            | StepKind::ParallelGroup { .. }
            | StepKind::Delay { .. }
            | StepKind::Enrichment { .. } => {}
        }
        Ok(())
    }

    fn detect_cycle(steps: &[WorkflowStep]) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InStack,
            Done,
        }

        let index: HashMap<&str, usize> = steps.iter().enumerate().map(|(i, s)| (s.id.as_str(), i)).collect();
        let mut marks = vec![Mark::Unvisited; steps.len()];

        fn visit(
            i: usize,
            steps: &[WorkflowStep],
            index: &HashMap<&str, usize>,
            marks: &mut [Mark],
        ) -> Result<()> {
            match marks[i] {
                Mark::Done => return Ok(()),
                Mark::InStack => {
                    return Err(PilotError::validation("Circular dependency detected"));
                }
                Mark::Unvisited => {}
            }
            marks[i] = Mark::InStack;
            for dep in &steps[i].dependencies {
                if let Some(&dep_idx) = index.get(dep.as_str()) {
                    visit(dep_idx, steps, index, marks)?;
                }
            }
            marks[i] = Mark::Done;
            Ok(())
        }

        for i in 0..steps.len() {
            visit(i, steps, &index, &mut marks)?;
        }
        Ok(())
    }

    /// Plan a validated step list: Kahn's algorithm for topological order,
    /// then level assignment and parallel-group detection.
    pub fn plan(steps: Vec<WorkflowStep>) -> Result<ExecutionPlan> {
        let warnings = Self::validate(&steps)?;

        let mut levels: HashMap<String, usize> = HashMap::new();
        let by_id: HashMap<&str, &WorkflowStep> = steps.iter().map(|s| (s.id.as_str(), s)).collect();

        // Kahn's algorithm to get a valid processing order (cycle already ruled out).
        let mut in_degree: HashMap<&str, usize> = steps.iter().map(|s| (s.id.as_str(), s.dependencies.len())).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &steps {
            for dep in &step.dependencies {
                dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }
        let mut queue: Vec<&str> = steps
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .map(|s| s.id.as_str())
            .collect();
        let mut order = Vec::with_capacity(steps.len());

        while let Some(id) = queue.pop() {
            order.push(id);
            let level = by_id[id]
                .dependencies
                .iter()
                .filter_map(|d| levels.get(d.as_str()))
                .max()
                .map_or(0, |m| m + 1);
            levels.insert(id.to_string(), level);

            if let Some(next) = dependents.get(id) {
                for &n in next {
                    let degree = in_degree.get_mut(n).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(n);
                    }
                }
            }
        }

        if order.len() != steps.len() {
            return Err(PilotError::validation("Circular dependency detected"));
        }

        let mut planned: Vec<PlannedStep> = steps
            .into_iter()
            .map(|step| {
                let level = levels[&step.id];
                PlannedStep {
                    step,
                    level,
                    parallel_group_id: None,
                }
            })
            .collect();

        let parallel_groups = Self::assign_parallel_groups(&mut planned);

        let total_steps = planned.len();
        let max_level = planned.iter().map(|s| s.level).max().unwrap_or(0);
        Ok(ExecutionPlan {
            steps: planned,
            parallel_groups,
            total_steps,
            duration_estimate: std::time::Duration::from_secs((max_level as u64 + 1) * 2),
            warnings,
        })
    }

    /// Two steps share a parallel group iff they sit at the same level,
    /// are both parallel-eligible, and neither depends on the other
    /// (guaranteed by level assignment: same-level steps never have a
    /// dependency edge between them).
    fn assign_parallel_groups(planned: &mut [PlannedStep]) -> Vec<ParallelGroup> {
        let max_level = planned.iter().map(|s| s.level).max().unwrap_or(0);
        let mut groups = Vec::new();

        for level in 0..=max_level {
            let eligible_ids: Vec<String> = planned
                .iter()
                .filter(|s| s.level == level && s.step.kind.can_run_in_parallel())
                .map(|s| s.step.id.clone())
                .collect();

            if eligible_ids.len() < 2 {
                continue;
            }

            let group_id = format!("group_L{level}");
            for planned_step in planned.iter_mut() {
                if planned_step.level == level && eligible_ids.contains(&planned_step.step.id) {
                    planned_step.parallel_group_id = Some(group_id.clone());
                }
            }
            groups.push(ParallelGroup {
                id: group_id,
                level,
                step_ids: eligible_ids,
            });
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::StepKind;

    fn action(id: &str, deps: &[&str]) -> WorkflowStep {
        let mut step = WorkflowStep::new(
            id,
            id,
            StepKind::Action {
                plugin: "http".to_string(),
                action: "get".to_string(),
                params: Value::Null,
            },
        );
        step.dependencies = deps.iter().map(|s| s.to_string()).collect();
        step
    }

    #[test]
    fn s1_dependency_ordering_and_parallel_group() {
        let steps = vec![
            action("a", &[]),
            action("b", &["a"]),
            action("c", &["a"]),
            action("d", &["b", "c"]),
        ];
        let plan = WorkflowParser::plan(steps).unwrap();
        assert_eq!(plan.level_of("a"), Some(0));
        assert_eq!(plan.level_of("b"), Some(1));
        assert_eq!(plan.level_of("c"), Some(1));
        assert_eq!(plan.level_of("d"), Some(2));
        assert_eq!(plan.parallel_groups.len(), 1);
        let group = &plan.parallel_groups[0];
        assert_eq!(group.level, 1);
        let mut ids = group.step_ids.clone();
        ids.sort();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(plan.critical_path().len(), 3);
    }

    #[test]
    fn s2_cycle_detection() {
        let steps = vec![action("a", &["b"]), action("b", &["a"])];
        let err = WorkflowParser::plan(steps).unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }

    #[test]
    fn missing_dependency_is_validation_error() {
        let steps = vec![action("a", &["ghost"])];
        let err = WorkflowParser::plan(steps).unwrap_err();
        assert!(err.to_string().contains("missing dependency"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let steps = vec![action("a", &[]), action("a", &[])];
        let err = WorkflowParser::plan(steps).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn no_declared_dependencies_synthesizes_sequential_chain() {
        let mut raw = vec![
            serde_json::json!({"name": "first", "kind": "delay"}),
            serde_json::json!({"name": "second", "kind": "delay"}),
            serde_json::json!({"name": "third", "kind": "delay"}),
        ];
        WorkflowParser::normalize_raw(&mut raw);
        assert_eq!(raw[1]["dependencies"][0], "step_1");
        assert_eq!(raw[2]["dependencies"][0], "step_2");
    }

    #[test]
    fn legacy_plugin_action_rewritten_to_action() {
        let mut raw = vec![serde_json::json!({
            "id": "s1",
            "type": "plugin_action",
            "plugin": "http",
            "action": "get",
            "parameters": {"url": "https://example.com"}
        })];
        WorkflowParser::normalize_raw(&mut raw);
        assert_eq!(raw[0]["kind"], "action");
        assert_eq!(raw[0]["params"]["url"], "https://example.com");
    }

    #[test]
    fn alternate_scatter_gather_shape_canonicalized() {
        let mut raw = vec![serde_json::json!({
            "id": "s1",
            "kind": "scatter_gather",
            "items": [1, 2, 3],
            "do": []
        })];
        WorkflowParser::normalize_raw(&mut raw);
        assert_eq!(raw[0]["scatter"]["input"], serde_json::json!([1, 2, 3]));
        assert_eq!(raw[0]["scatter"]["item_name"], "item");
        assert_eq!(raw[0]["gather"]["operation"], "collect");
    }

    #[test]
    fn non_parallel_eligible_kinds_stay_sequential() {
        let mut c1 = WorkflowStep::new(
            "c1",
            "c1",
            StepKind::Conditional {
                condition: serde_json::json!({"field": "x", "operator": "==", "value": 1}),
                then_steps: Vec::new(),
                else_steps: Vec::new(),
            },
        );
        c1.dependencies = vec!["a".to_string()];
        let mut c2 = WorkflowStep::new(
            "c2",
            "c2",
            StepKind::Conditional {
                condition: serde_json::json!({"field": "x", "operator": "==", "value": 1}),
                then_steps: Vec::new(),
                else_steps: Vec::new(),
            },
        );
        c2.dependencies = vec!["a".to_string()];
        let steps = vec![action("a", &[]), c1, c2];
        let plan = WorkflowParser::plan(steps).unwrap();
        assert!(plan.parallel_groups.is_empty());
    }
}
