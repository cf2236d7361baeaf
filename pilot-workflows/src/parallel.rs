//! ABOUTME: ParallelExecutor — bounded-concurrency worker pool, loop and scatter-gather primitives
//! ABOUTME: Grounded on spec.md §4.7; a tokio::sync::Semaphore sized by maxParallelSteps bounds fan-out

use crate::context::{bind_iteration_item, ExecutionContext};
use crate::executor::{resolve_value, StepExecutor};
use pilot_core::{ErrorCode, GatherConfig, GatherOperation, Result, ScatterConfig, StepOutput, WorkflowStep};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Runs independent steps concurrently, bounded by a single semaphore sized
/// at `maxParallelSteps`, and drives the `loop`/`scatter_gather` primitives
/// that fan a step list out over a collection.
pub struct ParallelExecutor {
    executor: Arc<StepExecutor>,
    semaphore: Arc<Semaphore>,
}

impl ParallelExecutor {
    #[must_use]
    pub fn new(executor: Arc<StepExecutor>, max_parallel_steps: usize) -> Self {
        Self {
            executor,
            semaphore: Arc::new(Semaphore::new(max_parallel_steps.max(1))),
        }
    }

    /// Runs a planner-assigned parallel group concurrently. Each step
    /// commits its own output through the shared `ExecutionContext`, whose
    /// internal state lives behind one lock (spec.md §5 "single commit
    /// point") so concurrent writers never race.
    pub async fn run_group(&self, steps: &[WorkflowStep], ctx: &ExecutionContext, cancellation: &CancellationToken) -> Vec<StepOutput> {
        let mut handles = Vec::with_capacity(steps.len());
        for step in steps {
            let executor = Arc::clone(&self.executor);
            let semaphore = Arc::clone(&self.semaphore);
            let ctx = ctx.clone();
            let cancellation = cancellation.clone();
            let step = step.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                executor.execute_step(&step, &ctx, &cancellation).await
            }));
        }
        let mut outputs = Vec::with_capacity(handles.len());
        for (step, handle) in steps.iter().zip(handles) {
            match handle.await {
                Ok(output) => outputs.push(output),
                Err(join_err) => {
                    warn!(step_id = %step.id, error = %join_err, "parallel step task panicked");
                    outputs.push(StepOutput::failure(
                        step.id.clone(),
                        format!("step task panicked: {join_err}"),
                        ErrorCode::StepExecutionFailed.as_str(),
                        Duration::default(),
                    ));
                }
            }
        }
        outputs
    }

    /// Runs `loop_steps` once per item of `iterate_over`. Sequential by
    /// default; when the loop is declared `parallel`, each iteration is
    /// fanned out through the same bounded semaphore as `run_group`.
    pub async fn run_loop(
        &self,
        iterate_over: &Value,
        loop_steps: &[WorkflowStep],
        parallel: bool,
        item_name: &str,
        ctx: &ExecutionContext,
        cancellation: &CancellationToken,
    ) -> Result<Value> {
        let items = resolve_items(ctx, iterate_over);

        let results = if parallel {
            let mut handles = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let executor = Arc::clone(&self.executor);
                let semaphore = Arc::clone(&self.semaphore);
                let ctx = ctx.clone();
                let cancellation = cancellation.clone();
                let loop_steps = loop_steps.to_vec();
                let item_name = item_name.to_string();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                    let locals = iteration_locals(&item_name, item, index);
                    executor.run_branch(&loop_steps, &ctx, &locals, &cancellation).await
                }));
            }
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                results.push(handle.await.unwrap_or(None));
            }
            results
        } else {
            let mut results = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                if cancellation.is_cancelled() {
                    break;
                }
                let locals = iteration_locals(item_name, item, index);
                let last = self.executor.run_branch(loop_steps, ctx, &locals, cancellation).await;
                results.push(last);
            }
            results
        };

        Ok(serde_json::json!({ "iterations": results, "count": results.len() }))
    }

    /// `scatter_gather`: fans `scatter.steps` out over each item of
    /// `scatter.input` concurrently, then folds the per-item results
    /// according to `gather.operation`. Only `Collect` is specified (see
    /// DESIGN.md for the recorded decision on this open question).
    pub async fn scatter_gather(
        &self,
        _step_id: &str,
        scatter: &ScatterConfig,
        gather: &GatherConfig,
        ctx: &ExecutionContext,
        cancellation: &CancellationToken,
    ) -> Result<Value> {
        let items = resolve_items(ctx, &scatter.input);
        let scatter_count = items.len();

        let mut handles = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let executor = Arc::clone(&self.executor);
            let semaphore = Arc::clone(&self.semaphore);
            let ctx = ctx.clone();
            let cancellation = cancellation.clone();
            let steps = scatter.steps.clone();
            let item_name = scatter.item_name.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                let locals = iteration_locals(&item_name, item, index);
                executor.run_branch(&steps, &ctx, &locals, &cancellation).await
            }));
        }
        let mut gathered = Vec::with_capacity(handles.len());
        for handle in handles {
            gathered.push(handle.await.unwrap_or(None));
        }

        match gather.operation {
            GatherOperation::Collect => Ok(serde_json::json!({
                "results": gathered,
                "count": gathered.len(),
                "scatterCount": scatter_count,
            })),
        }
    }
}

fn resolve_items(ctx: &ExecutionContext, source: &Value) -> Vec<Value> {
    match resolve_value(ctx, &HashMap::new(), source) {
        Value::Array(items) => items,
        Value::Object(map) => map.into_values().collect(),
        other => vec![other],
    }
}

fn iteration_locals(item_name: &str, item: Value, index: usize) -> HashMap<String, Value> {
    let mut locals = HashMap::new();
    locals.insert(item_name.to_string(), bind_iteration_item(item));
    locals.insert("index".to_string(), Value::from(index));
    locals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StepCache;
    use pilot_core::{RunMode, StepKind};
    use pilot_state::InMemoryStateManager;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("exec1", "agent1", "user1", "session1", Value::Null, RunMode::Production)
    }

    fn parallel_executor() -> ParallelExecutor {
        let step_executor = Arc::new(StepExecutor::new(None, None, Arc::new(InMemoryStateManager::new()), Arc::new(StepCache::new()), false));
        ParallelExecutor::new(step_executor, 2)
    }

    #[tokio::test]
    async fn loop_runs_once_per_item_sequentially() {
        let parallel = parallel_executor();
        let c = ctx();
        let loop_steps = vec![WorkflowStep::new(
            "inner",
            "Transform",
            StepKind::Transform {
                operation: "set".to_string(),
                input: serde_json::json!("{{item}}"),
                config: Value::Null,
            },
        )];
        let result = parallel
            .run_loop(&serde_json::json!([1, 2, 3]), &loop_steps, false, "item", &c, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result["count"], 3);
    }

    #[tokio::test]
    async fn scatter_gather_collects_one_result_per_item() {
        let parallel = parallel_executor();
        let c = ctx();
        let scatter = ScatterConfig {
            input: serde_json::json!(["a", "b"]),
            steps: vec![WorkflowStep::new(
                "inner",
                "Transform",
                StepKind::Transform {
                    operation: "set".to_string(),
                    input: serde_json::json!("{{item}}"),
                    config: Value::Null,
                },
            )],
            item_name: "item".to_string(),
        };
        let gather = GatherConfig { operation: GatherOperation::Collect };
        let result = parallel.scatter_gather("s1", &scatter, &gather, &c, &CancellationToken::new()).await.unwrap();
        assert_eq!(result["scatterCount"], 2);
        assert_eq!(result["count"], 2);
    }
}
