//! ABOUTME: Orchestrator — top-level control: loads configuration, walks execution levels,
//! ABOUTME: and drives the collaborators named in spec.md §6; grounded on spec.md §4.8

use crate::cache::StepCache;
use crate::conditions::{Condition, ConditionalEvaluator};
use crate::context::{resolve_reference, ExecutionContext};
use crate::executor::StepExecutor;
use crate::parallel::ParallelExecutor;
use crate::planner::{ExecutionPlan, PlannedStep, WorkflowParser};
use parking_lot::RwLock;
use pilot_config::PilotConfig;
use pilot_core::traits::{DurableStore, ExecutionRecord, LlmClient, MemoryProvider, NotificationChannel, PluginRuntime};
use pilot_core::{
    Agent, ApprovalDecision, ApprovalPolicy, ApprovalRequest, ApprovalResponse, ApprovalStatus, ErrorCode, ExecutionId, PilotError, Result,
    RunMode, StepKind, StepOutput, TimeoutAction, TokenUsage, WorkflowStep,
};
use pilot_events::{EventBus, EventKind, WorkflowEvent};
use pilot_state::{StateManager, WorkflowStatus};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const APPROVAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The user-visible result of one `Orchestrator::run` (spec.md §7 "User-visible failure").
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub success: bool,
    pub output: Value,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub total_time: Duration,
    pub total_tokens: TokenUsage,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub failed_step: Option<String>,
    pub error_stack: Option<Vec<String>>,
    pub warnings: Vec<String>,
}

/// In-memory approval request tracker. A durable deployment persists
/// requests through `DurableStore::record_approval`; this tracker exists so
/// the orchestrator (and its tests) have somewhere to poll responses from
/// without one.
pub struct ApprovalTracker {
    requests: RwLock<HashMap<String, ApprovalRequest>>,
}

impl ApprovalTracker {
    #[must_use]
    pub fn new() -> Self {
        Self { requests: RwLock::new(HashMap::new()) }
    }

    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        execution_id: &str,
        step_id: &str,
        approvers: Vec<String>,
        policy: ApprovalPolicy,
        title: String,
        message: Option<String>,
        context: Value,
        timeout: Duration,
        timeout_action: Option<TimeoutAction>,
        escalation_targets: Vec<String>,
    ) -> ApprovalRequest {
        let now = chrono::Utc::now();
        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            approvers,
            policy,
            title,
            message,
            context,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(300)),
            responses: Vec::new(),
            timeout_action,
            escalation_targets,
        };
        self.requests.write().insert(request.id.clone(), request.clone());
        request
    }

    #[must_use]
    pub fn get(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.requests.read().get(request_id).cloned()
    }

    /// Records an approver's decision. Returns the resolved status once the
    /// policy's threshold is met.
    pub fn respond(&self, request_id: &str, response: ApprovalResponse) -> Option<ApprovalStatus> {
        let mut requests = self.requests.write();
        let request = requests.get_mut(request_id)?;
        request.responses.push(response);
        let resolved = request.resolve();
        if let Some(status) = resolved {
            request.status = status;
        }
        resolved
    }

    /// Applies the configured `timeoutAction` once a request has expired.
    /// `Escalate` swaps in the escalation targets and extends the deadline
    /// once; a request that is already `Escalated` and times out again
    /// falls back to reject, so this can never loop forever.
    pub fn resolve_timeout(&self, request_id: &str, extension: Duration) -> ApprovalStatus {
        let mut requests = self.requests.write();
        let Some(request) = requests.get_mut(request_id) else {
            return ApprovalStatus::Timeout;
        };
        match request.timeout_action {
            Some(TimeoutAction::Approve) => {
                request.status = ApprovalStatus::Approved;
                ApprovalStatus::Approved
            }
            Some(TimeoutAction::Escalate) if !request.escalation_targets.is_empty() && request.status != ApprovalStatus::Escalated => {
                request.approvers = request.escalation_targets.clone();
                request.responses.clear();
                request.expires_at = chrono::Utc::now() + chrono::Duration::from_std(extension).unwrap_or_else(|_| chrono::Duration::seconds(300));
                request.status = ApprovalStatus::Escalated;
                ApprovalStatus::Escalated
            }
            _ => {
                request.status = ApprovalStatus::Rejected;
                ApprovalStatus::Rejected
            }
        }
    }
}

impl Default for ApprovalTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-level control (spec.md §4.8): walks planned levels, runs parallel
/// groups through the `ParallelExecutor`, and drives the kinds the
/// `StepExecutor` declines to dispatch directly (`sub_workflow`,
/// `human_approval`, the explicit `parallel_group` container).
pub struct Orchestrator {
    config: PilotConfig,
    state_manager: Arc<dyn StateManager>,
    event_bus: Arc<EventBus>,
    step_executor: Arc<StepExecutor>,
    parallel_executor: Arc<ParallelExecutor>,
    durable_store: Option<Arc<dyn DurableStore>>,
    notification_channel: Option<Arc<dyn NotificationChannel>>,
    memory_provider: Option<Arc<dyn MemoryProvider>>,
    approvals: Arc<ApprovalTracker>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: PilotConfig,
        plugin_runtime: Option<Arc<dyn PluginRuntime>>,
        llm_client: Option<Arc<dyn LlmClient>>,
        state_manager: Arc<dyn StateManager>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let cache = Arc::new(StepCache::new());
        let step_executor = Arc::new(StepExecutor::new(plugin_runtime, llm_client, Arc::clone(&state_manager), cache, config.enable_caching));
        let parallel_executor = Arc::new(ParallelExecutor::new(Arc::clone(&step_executor), config.max_parallel_steps));
        step_executor.bind_parallel_executor(Arc::downgrade(&parallel_executor));
        Self {
            config,
            state_manager,
            event_bus,
            step_executor,
            parallel_executor,
            durable_store: None,
            notification_channel: None,
            memory_provider: None,
            approvals: Arc::new(ApprovalTracker::new()),
        }
    }

    #[must_use]
    pub fn with_durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_notification_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.notification_channel = Some(channel);
        self
    }

    #[must_use]
    pub fn with_memory_provider(mut self, provider: Arc<dyn MemoryProvider>) -> Self {
        self.memory_provider = Some(provider);
        self
    }

    /// Exposes the approval tracker so a caller can record approver
    /// responses (`ApprovalTracker::respond`) while `run` is polling.
    #[must_use]
    pub fn approvals(&self) -> Arc<ApprovalTracker> {
        Arc::clone(&self.approvals)
    }

    /// Runs `agent` end to end per spec.md §4.8's twelve steps.
    pub async fn run(&self, agent: &Agent, input: Value, user_id: &str, session_id: &str, run_mode: RunMode) -> ExecutionResult {
        if !self.config.pilot_enabled {
            return failed_result(String::new(), "pilot is disabled via configuration", Some("PILOT_DISABLED".to_string()));
        }

        let steps = agent.preferred_steps().to_vec();
        let mut warnings = match WorkflowParser::validate(&steps) {
            Ok(warnings) => warnings,
            Err(e) => return failed_result(String::new(), e.to_string(), e.code().map(|c| c.as_str().to_string())),
        };

        let execution_id = ExecutionId::new().to_string();
        if let Err(e) = self.state_manager.create_execution(&execution_id, &agent.id).await {
            return failed_result(execution_id, e.to_string(), e.code().map(|c| c.as_str().to_string()));
        }
        let ctx = ExecutionContext::new(execution_id.clone(), agent.id.clone(), user_id, session_id, input, run_mode);

        self.record_execution(&execution_id, &agent.id, "running", None).await;

        let cancellation = CancellationToken::new();
        let (memory, plan_result) = tokio::join!(self.load_memory_context(user_id, session_id), std::future::ready(WorkflowParser::plan(steps.clone())));
        if let Some(memory) = memory {
            ctx.set_memory_context(memory);
        }
        let plan = match plan_result {
            Ok(plan) => plan,
            Err(e) => return failed_result(execution_id, e.to_string(), e.code().map(|c| c.as_str().to_string())),
        };

        let registry: HashMap<String, WorkflowStep> = steps.iter().map(|s| (s.id.clone(), s.clone())).collect();
        let halt = self.execute_levels(&plan, &registry, &ctx, &cancellation).await;

        let output = build_output(agent, &ctx);
        warnings.extend(validate_output(agent, &output));

        let success = halt.is_none();
        let status = if success { WorkflowStatus::Completed } else { WorkflowStatus::Failed };
        if let Err(e) = self.state_manager.set_status(&execution_id, status).await {
            warn!(execution_id = %execution_id, error = %e, "failed to set final workflow status");
        }
        self.record_execution(&execution_id, &agent.id, if success { "completed" } else { "failed" }, Some(output.clone())).await;

        let completion_event = if success {
            WorkflowEvent::new(EventKind::ExecutionCompleted, execution_id.clone(), agent.id.clone()).with_result(output.clone())
        } else {
            WorkflowEvent::new(EventKind::ExecutionError, execution_id.clone(), agent.id.clone())
                .with_error(halt.as_ref().and_then(|h| h.metadata.error.clone()).unwrap_or_default())
        };
        self.event_bus.publish(completion_event);

        let total_time = ctx.cumulative_execution_time();
        let total_tokens = ctx.cumulative_tokens();
        self.spawn_token_reconciliation(execution_id.clone(), total_tokens);

        ExecutionResult {
            execution_id,
            success,
            output,
            completed_steps: ctx.completed_steps().len(),
            failed_steps: ctx.failed_steps().len(),
            skipped_steps: ctx.skipped_steps().len(),
            total_time,
            total_tokens,
            error: halt.as_ref().and_then(|h| h.metadata.error.clone()),
            error_code: halt.as_ref().and_then(|h| h.metadata.error_code.clone()),
            failed_step: halt.as_ref().map(|h| h.step_id.clone()),
            error_stack: halt.as_ref().map(|h| vec![h.step_id.clone()]),
            warnings,
        }
    }

    /// Resumes a previously checkpointed execution: loads the last
    /// snapshot, keeps only steps not yet completed or failed (or the whole
    /// workflow if nothing committed), and continues from there.
    pub async fn resume(&self, agent: &Agent, execution_id: &str) -> ExecutionResult {
        let Some(store) = &self.durable_store else {
            return failed_result(execution_id.to_string(), "resume requires a durable store to load the prior checkpoint", None);
        };
        let snapshot = match store.load_checkpoint(execution_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return failed_result(execution_id.to_string(), "no checkpoint found for this execution", None),
            Err(e) => return failed_result(execution_id.to_string(), e.to_string(), e.code().map(|c| c.as_str().to_string())),
        };
        let ctx = match ExecutionContext::from_snapshot(&snapshot) {
            Ok(ctx) => ctx,
            Err(e) => return failed_result(execution_id.to_string(), e.to_string(), None),
        };

        let all_steps = agent.preferred_steps().to_vec();
        let done: HashSet<String> = ctx.completed_steps().into_iter().chain(ctx.failed_steps()).collect();
        let remaining: Vec<WorkflowStep> = if done.is_empty() {
            all_steps.clone()
        } else {
            all_steps.iter().filter(|s| !done.contains(&s.id)).cloned().collect()
        };

        let plan = match WorkflowParser::plan(remaining.clone()) {
            Ok(plan) => plan,
            Err(e) => return failed_result(execution_id.to_string(), e.to_string(), e.code().map(|c| c.as_str().to_string())),
        };
        if let Some(missing) = plan
            .steps
            .iter()
            .flat_map(|p| p.step.dependencies.iter())
            .find(|dep| !done.contains(*dep) && !remaining.iter().any(|s| &s.id == *dep))
        {
            return failed_result(execution_id.to_string(), format!("resume is missing dependency '{missing}'"), None);
        }

        let registry: HashMap<String, WorkflowStep> = all_steps.iter().map(|s| (s.id.clone(), s.clone())).collect();
        let cancellation = CancellationToken::new();
        let halt = self.execute_levels(&plan, &registry, &ctx, &cancellation).await;

        let output = build_output(agent, &ctx);
        let success = halt.is_none();
        if let Err(e) = self.state_manager.set_status(execution_id, if success { WorkflowStatus::Completed } else { WorkflowStatus::Failed }).await {
            warn!(execution_id, error = %e, "failed to set status after resume");
        }

        ExecutionResult {
            execution_id: execution_id.to_string(),
            success,
            output,
            completed_steps: ctx.completed_steps().len(),
            failed_steps: ctx.failed_steps().len(),
            skipped_steps: ctx.skipped_steps().len(),
            total_time: ctx.cumulative_execution_time(),
            total_tokens: ctx.cumulative_tokens(),
            error: halt.as_ref().and_then(|h| h.metadata.error.clone()),
            error_code: halt.as_ref().and_then(|h| h.metadata.error_code.clone()),
            failed_step: halt.as_ref().map(|h| h.step_id.clone()),
            error_stack: halt.as_ref().map(|h| vec![h.step_id.clone()]),
            warnings: Vec::new(),
        }
    }

    async fn record_execution(&self, execution_id: &str, agent_id: &str, status: &str, final_output: Option<Value>) {
        let Some(store) = &self.durable_store else { return };
        let record = ExecutionRecord {
            execution_id: execution_id.to_string(),
            agent_id: agent_id.to_string(),
            status: status.to_string(),
            started_at: chrono::Utc::now(),
            ended_at: (status != "running").then(chrono::Utc::now),
            final_output,
        };
        if let Err(e) = store.record_execution(&record).await {
            warn!(execution_id, error = %e, "failed to record execution to the durable store");
        }
    }

    async fn load_memory_context(&self, user_id: &str, session_id: &str) -> Option<Value> {
        let provider = self.memory_provider.as_ref()?;
        match tokio::time::timeout(self.config.memory_load_timeout(), provider.load_context(user_id, session_id)).await {
            Ok(Ok(context)) => Some(context),
            Ok(Err(e)) => {
                warn!(error = %e, "memory provider failed; continuing without memory context");
                None
            }
            Err(_) => {
                warn!("memory context load timed out; continuing without memory context");
                None
            }
        }
    }

    fn spawn_token_reconciliation(&self, execution_id: String, tokens: TokenUsage) {
        let durable_store = self.durable_store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if let Some(store) = durable_store {
                if let Err(e) = store.record_token_usage(&execution_id, "execution", tokens, false).await {
                    warn!(execution_id, error = %e, "token reconciliation write failed");
                }
            }
            info!(execution_id, total = tokens.total, "token usage reconciled");
        });
    }

    /// Walks the plan level by level. Returns the halting failure, if any;
    /// `None` means every step ran (or was legitimately skipped) to completion.
    fn execute_levels<'a>(
        &'a self,
        plan: &'a ExecutionPlan,
        registry: &'a HashMap<String, WorkflowStep>,
        ctx: &'a ExecutionContext,
        cancellation: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Option<StepOutput>> + Send + 'a>> {
        Box::pin(async move {
            let step_to_case = build_step_to_case(registry);

            // Steps folded into an explicit `parallel_group` container are
            // dispatched only through that container, never on their own.
            let mut dispatched: HashSet<String> = HashSet::new();
            for step in registry.values() {
                if let StepKind::ParallelGroup { steps } = &step.kind {
                    dispatched.extend(steps.iter().cloned());
                }
            }

            for level in 0..=plan.max_level() {
                if cancellation.is_cancelled() {
                    return Some(StepOutput::failure(
                        "execution",
                        "execution cancelled",
                        ErrorCode::ExecutionTimeout.as_str(),
                        ctx.cumulative_execution_time(),
                    ));
                }

                let planned = plan.steps_at_level(level);
                let mut group_order: Vec<String> = Vec::new();
                let mut groups: HashMap<String, Vec<&PlannedStep>> = HashMap::new();
                let mut singles: Vec<&PlannedStep> = Vec::new();
                for p in &planned {
                    if dispatched.contains(&p.step.id) {
                        continue;
                    }
                    match &p.parallel_group_id {
                        Some(gid) => {
                            if !groups.contains_key(gid) {
                                group_order.push(gid.clone());
                            }
                            groups.entry(gid.clone()).or_default().push(p);
                        }
                        None => singles.push(p),
                    }
                }

                for planned_step in singles {
                    if !self.should_dispatch(planned_step, &step_to_case, ctx) {
                        ctx.mark_skipped(planned_step.step.id.clone());
                        continue;
                    }
                    let output = self.dispatch_single(level, &planned_step.step, registry, ctx, cancellation).await;
                    if !output.metadata.success && !planned_step.step.continue_on_error {
                        return Some(output);
                    }
                }

                for gid in group_order {
                    let members = &groups[&gid];
                    for p in members {
                        if !self.should_dispatch(p, &step_to_case, ctx) {
                            ctx.mark_skipped(p.step.id.clone());
                        }
                    }
                    let eligible: Vec<&PlannedStep> = members.iter().copied().filter(|p| self.should_dispatch(p, &step_to_case, ctx)).collect();
                    if eligible.is_empty() {
                        continue;
                    }
                    let step_list: Vec<WorkflowStep> = eligible.iter().map(|p| p.step.clone()).collect();
                    let outputs = self.parallel_executor.run_group(&step_list, ctx, cancellation).await;
                    for (p, output) in eligible.iter().zip(&outputs) {
                        self.emit_step_events(ctx, level, &p.step.id, &p.step.name, output);
                    }
                    if let Err(e) = self.checkpoint_with_verification(ctx).await {
                        warn!(error = %e, "failed to checkpoint after parallel group");
                    }
                    for (p, output) in eligible.into_iter().zip(outputs) {
                        if !output.metadata.success && !p.step.continue_on_error {
                            return Some(output);
                        }
                    }
                }
            }
            None
        })
    }

    /// `executeIf`, plus skipping governed switch-case members that lost.
    fn should_dispatch(&self, planned: &PlannedStep, step_to_case: &HashMap<String, Vec<(String, String)>>, ctx: &ExecutionContext) -> bool {
        if let Some(owners) = step_to_case.get(&planned.step.id) {
            let switch_ok = owners.iter().all(|(owner, case_name)| match ctx.get_variable(&format!("{owner}_branch")) {
                Some(Value::String(branch)) => &branch == case_name,
                _ => true,
            });
            if !switch_ok {
                return false;
            }
        }
        match &planned.step.execute_if {
            Some(condition_value) => {
                let condition: Result<Condition> = serde_json::from_value(condition_value.clone()).map_err(|e| PilotError::condition(e.to_string()));
                condition.and_then(|c| ConditionalEvaluator::evaluate(&c, ctx, &HashMap::new())).unwrap_or(false)
            }
            None => true,
        }
    }

    async fn dispatch_single(&self, level: usize, step: &WorkflowStep, registry: &HashMap<String, WorkflowStep>, ctx: &ExecutionContext, cancellation: &CancellationToken) -> StepOutput {
        let output = match &step.kind {
            StepKind::SubWorkflow { workflow_id, workflow_steps, input_mapping, output_mapping, inherit_unmapped_variables, timeout } => {
                let out = self
                    .dispatch_sub_workflow(step, workflow_id, workflow_steps, input_mapping, output_mapping, *inherit_unmapped_variables, timeout, ctx, cancellation)
                    .await;
                self.commit_orchestrated_output(step, ctx, out).await
            }
            StepKind::HumanApproval { approvers, policy, title, message, timeout_action, escalation_targets } => {
                let out = self.dispatch_human_approval(step, approvers, policy, title, message, timeout_action, escalation_targets, ctx).await;
                self.commit_orchestrated_output(step, ctx, out).await
            }
            StepKind::ParallelGroup { steps } => {
                let out = self.dispatch_parallel_group(step, steps, registry, ctx, cancellation).await;
                self.commit_orchestrated_output(step, ctx, out).await
            }
            _ => self.step_executor.execute_step(step, ctx, cancellation).await,
        };
        self.emit_step_events(ctx, level, &step.id, &step.name, &output);
        if let Err(e) = self.checkpoint_with_verification(ctx).await {
            warn!(step_id = %step.id, error = %e, "failed to checkpoint after step");
        }
        output
    }

    /// Checkpoints are operator-visible immediately (a paused `human_approval`
    /// step may be resumed from another process), so the write is verified
    /// readable before moving on rather than trusted blind.
    async fn checkpoint_with_verification(&self, ctx: &ExecutionContext) -> std::result::Result<(), PilotError> {
        let execution_id = ctx.execution_id().to_string();
        let sequence_before = self
            .state_manager
            .latest_checkpoint(&execution_id)
            .await?
            .map(|c| c.sequence);
        pilot_state::write_with_retry(
            3,
            Duration::from_millis(20),
            || self.state_manager.checkpoint(&execution_id, ctx.snapshot()),
            || {
                let execution_id = execution_id.clone();
                async move {
                    matches!(
                        self.state_manager.latest_checkpoint(&execution_id).await,
                        Ok(Some(snapshot)) if Some(snapshot.sequence) != sequence_before
                    )
                }
            },
        )
        .await
    }

    fn emit_step_events(&self, ctx: &ExecutionContext, level: usize, step_id: &str, step_name: &str, output: &StepOutput) {
        let kind = if output.metadata.success { EventKind::StepCompleted } else { EventKind::StepFailed };
        let mut event = WorkflowEvent::new(kind, ctx.execution_id(), ctx.agent_id())
            .with_step(level, step_id.to_string(), step_name.to_string())
            .with_duration(output.metadata.execution_time);
        event = if output.metadata.success {
            event.with_result(output.data.clone())
        } else {
            event.with_error(output.metadata.error.clone().unwrap_or_default())
        };
        self.event_bus.publish(event);
    }

    /// Commits an `Orchestrator`-built `StepOutput` the same way
    /// `StepExecutor::execute_step_with_locals` commits every other kind.
    async fn commit_orchestrated_output(&self, step: &WorkflowStep, ctx: &ExecutionContext, output: StepOutput) -> StepOutput {
        ctx.add_execution_time(output.metadata.execution_time);
        if let Some(tokens) = output.metadata.tokens_used {
            ctx.add_tokens(tokens);
        }
        if let Err(e) = self.state_manager.log_step_result(ctx.execution_id(), &output).await {
            warn!(step_id = %step.id, error = %e, "failed to log orchestrated step result");
        }
        if output.metadata.success {
            ctx.mark_completed(step.id.clone());
        } else {
            ctx.mark_failed(step.id.clone());
        }
        if let Some(var) = &step.output_variable {
            ctx.set_variable(var.clone(), output.data.clone());
        }
        ctx.set_step_output(step.id.clone(), output.clone());
        output
    }

    async fn dispatch_parallel_group(&self, step: &WorkflowStep, member_ids: &[String], registry: &HashMap<String, WorkflowStep>, ctx: &ExecutionContext, cancellation: &CancellationToken) -> StepOutput {
        let started = Instant::now();
        if let Err(e) = self.state_manager.log_step_start(ctx.execution_id(), &step.id).await {
            warn!(step_id = %step.id, error = %e, "failed to log parallel_group step start");
        }
        let members: Vec<WorkflowStep> = member_ids.iter().filter_map(|id| registry.get(id).cloned()).collect();
        let outputs = self.parallel_executor.run_group(&members, ctx, cancellation).await;
        for (id, output) in member_ids.iter().zip(&outputs) {
            let name = registry.get(id).map(|s| s.name.clone()).unwrap_or_default();
            self.emit_step_events(ctx, 0, id, &name, output);
        }
        let any_failed = outputs.iter().any(|o| !o.metadata.success);
        let summary = serde_json::json!({
            "memberIds": member_ids,
            "memberResults": outputs.iter().map(|o| o.data.clone()).collect::<Vec<_>>(),
        });
        if any_failed {
            StepOutput::failure(step.id.clone(), "one or more parallel_group members failed", ErrorCode::StepExecutionFailed.as_str(), started.elapsed())
        } else {
            StepOutput::success(step.id.clone(), "system", "parallel_group", summary, started.elapsed())
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_sub_workflow<'a>(
        &'a self,
        step: &'a WorkflowStep,
        workflow_id: &'a Option<String>,
        workflow_steps: &'a Option<Vec<WorkflowStep>>,
        input_mapping: &'a HashMap<String, String>,
        output_mapping: &'a Option<HashMap<String, String>>,
        inherit_unmapped_variables: bool,
        timeout: &'a Option<Duration>,
        ctx: &'a ExecutionContext,
        cancellation: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            if let Err(e) = self.state_manager.log_step_start(ctx.execution_id(), &step.id).await {
                warn!(step_id = %step.id, error = %e, "failed to log sub_workflow step start");
            }

            let Some(inline_steps) = workflow_steps.clone() else {
                let reason = if workflow_id.is_some() {
                    "loading a sub-workflow by workflowId is not supported by this engine; inline workflowSteps are required"
                } else {
                    "sub_workflow step declares neither workflowId nor workflowSteps"
                };
                return StepOutput::failure(step.id.clone(), reason, ErrorCode::WorkflowNotFound.as_str(), started.elapsed());
            };

            let child_execution_id = format!("{}:{}", ctx.execution_id(), step.id);
            let mut child_input = serde_json::Map::new();
            for (child_key, parent_reference) in input_mapping {
                let value = resolve_reference(ctx, &HashMap::new(), parent_reference).unwrap_or(Value::Null);
                child_input.insert(child_key.clone(), value);
            }

            let child_ctx = ExecutionContext::new(
                child_execution_id.clone(),
                ctx.agent_id().to_string(),
                ctx.user_id().to_string(),
                ctx.session_id().to_string(),
                Value::Object(child_input),
                ctx.run_mode(),
            );
            if inherit_unmapped_variables {
                for (key, value) in ctx.variables() {
                    if !input_mapping.contains_key(&key) {
                        child_ctx.set_variable(key, value);
                    }
                }
            }
            if let Err(e) = self.state_manager.create_execution(&child_execution_id, ctx.agent_id()).await {
                warn!(error = %e, "failed to register sub_workflow execution");
            }

            let plan = match WorkflowParser::plan(inline_steps.clone()) {
                Ok(plan) => plan,
                Err(e) => return StepOutput::failure(step.id.clone(), e.to_string(), ErrorCode::SubWorkflowFailed.as_str(), started.elapsed()),
            };
            let registry: HashMap<String, WorkflowStep> = inline_steps.iter().map(|s| (s.id.clone(), s.clone())).collect();

            let run = self.execute_levels(&plan, &registry, &child_ctx, cancellation);
            let halt = match timeout {
                Some(limit) => match tokio::time::timeout(*limit, run).await {
                    Ok(result) => result,
                    Err(_) => return StepOutput::failure(step.id.clone(), "sub-workflow exceeded its timeout", ErrorCode::SubWorkflowTimeout.as_str(), started.elapsed()),
                },
                None => run.await,
            };

            if let Some(failure) = halt {
                return StepOutput::failure(
                    step.id.clone(),
                    format!("sub-workflow step '{}' failed: {}", failure.step_id, failure.metadata.error.clone().unwrap_or_default()),
                    ErrorCode::SubWorkflowFailed.as_str(),
                    started.elapsed(),
                );
            }

            let mapped = match output_mapping {
                Some(mapping) => {
                    let mut out = serde_json::Map::new();
                    for (parent_key, child_reference) in mapping {
                        let value = resolve_reference(&child_ctx, &HashMap::new(), child_reference).unwrap_or(Value::Null);
                        out.insert(parent_key.clone(), value);
                    }
                    Value::Object(out)
                }
                None => {
                    let mut out = serde_json::Map::new();
                    for (id, output) in child_ctx.get_all_step_outputs() {
                        out.insert(id, output.data);
                    }
                    Value::Object(out)
                }
            };
            if let Value::Object(map) = &mapped {
                for (key, value) in map {
                    ctx.set_variable(key.clone(), value.clone());
                }
            }

            StepOutput::success(step.id.clone(), "system", "sub_workflow", mapped, started.elapsed())
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_human_approval(
        &self,
        step: &WorkflowStep,
        approvers: &[String],
        policy: &Option<ApprovalPolicy>,
        title: &str,
        message: &Option<String>,
        timeout_action: &Option<TimeoutAction>,
        escalation_targets: &[String],
        ctx: &ExecutionContext,
    ) -> StepOutput {
        let started = Instant::now();
        if let Err(e) = self.state_manager.log_step_start(ctx.execution_id(), &step.id).await {
            warn!(step_id = %step.id, error = %e, "failed to log human_approval step start");
        }

        let timeout = self.config.default_timeout();
        let request = self.approvals.create(
            ctx.execution_id(),
            &step.id,
            approvers.to_vec(),
            policy.unwrap_or(ApprovalPolicy::Any),
            title.to_string(),
            message.clone(),
            ctx.input().clone(),
            timeout,
            *timeout_action,
            escalation_targets.to_vec(),
        );
        let request_id = request.id.clone();

        if let Some(store) = &self.durable_store {
            if let Err(e) = store.record_approval(&request).await {
                warn!(step_id = %step.id, error = %e, "failed to persist approval request");
            }
        }
        self.notify_approvers(&request, title, message.as_deref()).await;

        if let Err(e) = self.state_manager.set_status(ctx.execution_id(), WorkflowStatus::Paused).await {
            warn!(execution_id = %ctx.execution_id(), error = %e, "failed to pause workflow for approval");
        }

        let final_status = loop {
            if let Some(status) = self.approvals.get(&request_id).and_then(|r| r.resolve()) {
                break status;
            }
            let expired = self.approvals.get(&request_id).map_or(true, |r| chrono::Utc::now() >= r.expires_at);
            if expired {
                let status = self.approvals.resolve_timeout(&request_id, timeout);
                if status == ApprovalStatus::Escalated {
                    if let Some(escalated) = self.approvals.get(&request_id) {
                        self.notify_approvers(&escalated, title, message.as_deref()).await;
                    }
                    continue;
                }
                break status;
            }
            tokio::time::sleep(APPROVAL_POLL_INTERVAL).await;
        };

        if let Err(e) = self.state_manager.set_status(ctx.execution_id(), WorkflowStatus::Running).await {
            warn!(execution_id = %ctx.execution_id(), error = %e, "failed to resume workflow after approval");
        }

        match final_status {
            ApprovalStatus::Approved => StepOutput::success(
                step.id.clone(),
                "system",
                "human_approval",
                serde_json::json!({ "status": "approved", "requestId": request_id }),
                started.elapsed(),
            ),
            other => StepOutput::failure(step.id.clone(), format!("approval {request_id} was not granted: {other:?}"), ErrorCode::ApprovalRejected.as_str(), started.elapsed()),
        }
    }

    async fn notify_approvers(&self, request: &ApprovalRequest, title: &str, message: Option<&str>) {
        let Some(channel) = &self.notification_channel else { return };
        let payload = serde_json::json!({ "requestId": request.id, "title": title, "message": message });
        for approver in &request.approvers {
            let config = serde_json::json!({ "approver": approver });
            if let Err(e) = channel.send("approval", &config, &payload).await {
                warn!(approver, error = %e, "failed to notify approver");
            }
        }
    }
}

/// Resolving switch-governed membership needs to know which steps belong to
/// which case, not just which switch "owns" them — a step can be named in
/// more than one switch's `default`, so this is step id -> list of
/// (switch step id, matched case name it belongs under).
fn build_step_to_case(registry: &HashMap<String, WorkflowStep>) -> HashMap<String, Vec<(String, String)>> {
    let mut map: HashMap<String, Vec<(String, String)>> = HashMap::new();
    for step in registry.values() {
        if let StepKind::Switch { cases, default, .. } = &step.kind {
            for case in cases {
                for id in &case.steps {
                    map.entry(id.clone()).or_default().push((step.id.clone(), case.when.clone()));
                }
            }
            if let Some(default_ids) = default {
                for id in default_ids {
                    map.entry(id.clone()).or_default().push((step.id.clone(), "default".to_string()));
                }
            }
        }
    }
    map
}

/// Builds the final output from the agent's declared output schema, or
/// falls back to the last step's data when none is declared.
fn build_output(agent: &Agent, ctx: &ExecutionContext) -> Value {
    match &agent.output_schema {
        Some(schema) if !schema.is_empty() => {
            let mut out = serde_json::Map::new();
            for key in schema.keys() {
                let value = ctx
                    .get_variable(key)
                    .or_else(|| ctx.get_all_step_outputs().into_iter().rev().find_map(|(_, output)| output.data.get(key).cloned()))
                    .unwrap_or(Value::Null);
                out.insert(key.clone(), value);
            }
            Value::Object(out)
        }
        _ => ctx.get_all_step_outputs().last().map(|(_, output)| output.data.clone()).unwrap_or(Value::Null),
    }
}

/// Warns (never fails) when the final output doesn't match the agent's
/// declared output schema.
fn validate_output(agent: &Agent, output: &Value) -> Vec<String> {
    let Some(schema) = &agent.output_schema else { return Vec::new() };
    let mut warnings = Vec::new();
    for (key, expected_type) in schema {
        match output.get(key) {
            None => warnings.push(format!("declared output '{key}' is missing from the final output")),
            Some(value) if !value_matches_type(value, expected_type) => {
                warnings.push(format!("declared output '{key}' does not match its declared type '{expected_type}'"));
            }
            Some(_) => {}
        }
    }
    warnings
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected.to_ascii_lowercase().as_str() {
        "string" => value.is_string(),
        "number" | "integer" => value.is_number(),
        "boolean" | "bool" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}


fn failed_result(execution_id: String, error: impl Into<String>, error_code: Option<String>) -> ExecutionResult {
    ExecutionResult {
        execution_id,
        success: false,
        output: Value::Null,
        completed_steps: 0,
        failed_steps: 0,
        skipped_steps: 0,
        total_time: Duration::default(),
        total_tokens: TokenUsage::default(),
        error: Some(error.into()),
        error_code,
        failed_step: None,
        error_stack: None,
        warnings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pilot_core::traits::PluginResult;
    use pilot_core::RetryPolicy;
    use pilot_state::InMemoryStateManager;
    use std::collections::HashMap as Map;

    struct EchoPlugin;

    #[async_trait]
    impl PluginRuntime for EchoPlugin {
        async fn execute(&self, _user_id: &str, _plugin: &str, _action: &str, params: Value) -> Result<PluginResult> {
            Ok(PluginResult { success: true, data: Some(params), error: None, message: None })
        }

        async fn get_plugin_definition(&self, _plugin: &str) -> Result<pilot_core::traits::PluginDefinition> {
            Ok(pilot_core::traits::PluginDefinition { actions: Map::new() })
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(PilotConfig::default(), Some(Arc::new(EchoPlugin)), None, Arc::new(InMemoryStateManager::new()), Arc::new(EventBus::new()))
    }

    fn agent_with(steps: Vec<WorkflowStep>) -> Agent {
        Agent { id: "agent1".to_string(), name: "Agent".to_string(), steps, legacy_steps: Vec::new(), output_schema: None, system_prompt: None, user_prompt: None }
    }

    #[tokio::test]
    async fn runs_a_simple_action_chain_to_completion() {
        let orch = orchestrator();
        let steps = vec![WorkflowStep::new(
            "s1",
            "Echo",
            StepKind::Action { plugin: "echo".to_string(), action: "run".to_string(), params: serde_json::json!({"value": 1}) },
        )];
        let result = orch.run(&agent_with(steps), serde_json::json!({}), "user1", "session1", RunMode::Production).await;
        assert!(result.success);
        assert_eq!(result.completed_steps, 1);
        assert_eq!(result.failed_steps, 0);
    }

    #[tokio::test]
    async fn halts_on_a_failing_step_without_continue_on_error() {
        let orch = orchestrator();
        let failing = WorkflowStep::new("s1", "Fail", StepKind::Comparison { left: Value::Null, right: Value::Null, operation: "bogus_op".to_string() });
        let result = orch.run(&agent_with(vec![failing]), serde_json::json!({}), "user1", "session1", RunMode::Production).await;
        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("s1"));
        assert_eq!(result.error_code.as_deref(), Some("UNKNOWN_COMPARISON_OPERATION"));
    }

    #[tokio::test]
    async fn continue_on_error_lets_later_steps_run() {
        let orch = orchestrator();
        let failing = WorkflowStep::new("s1", "Fail", StepKind::Comparison { left: Value::Null, right: Value::Null, operation: "bogus_op".to_string() }).with_continue_on_error(true);
        let ok = WorkflowStep::new("s2", "Echo", StepKind::Action { plugin: "echo".to_string(), action: "run".to_string(), params: Value::Null }).with_dependency("s1");
        let result = orch.run(&agent_with(vec![failing, ok]), serde_json::json!({}), "user1", "session1", RunMode::Production).await;
        assert!(result.success);
        assert_eq!(result.completed_steps, 1);
        assert_eq!(result.failed_steps, 1);
    }

    #[tokio::test]
    async fn execute_if_false_skips_the_step() {
        let orch = orchestrator();
        let mut skipped = WorkflowStep::new("s1", "Echo", StepKind::Action { plugin: "echo".to_string(), action: "run".to_string(), params: Value::Null });
        skipped.execute_if = Some(serde_json::json!({ "field": "input.missing", "operator": "==", "value": "x" }));
        let result = orch.run(&agent_with(vec![skipped]), serde_json::json!({}), "user1", "session1", RunMode::Production).await;
        assert!(result.success);
        assert_eq!(result.skipped_steps, 1);
        assert_eq!(result.completed_steps, 0);
    }

    #[tokio::test]
    async fn human_approval_any_policy_resolves_on_first_approver() {
        let orch = orchestrator();
        let approval = WorkflowStep::new(
            "approve",
            "Approve",
            StepKind::HumanApproval {
                approvers: vec!["alice".to_string(), "bob".to_string()],
                policy: Some(ApprovalPolicy::Any),
                title: "Ship it?".to_string(),
                message: None,
                timeout_action: Some(TimeoutAction::Reject),
                escalation_targets: Vec::new(),
            },
        );
        let agent = agent_with(vec![approval]);
        let tracker = orch.approvals();

        let responder = tokio::spawn(async move {
            loop {
                let requests: Vec<ApprovalRequest> = {
                    let guard = tracker.requests.read();
                    guard.values().cloned().collect()
                };
                if let Some(request) = requests.into_iter().find(|r| r.step_id == "approve") {
                    tracker.respond(
                        &request.id,
                        ApprovalResponse { approver_id: "alice".to_string(), decision: ApprovalDecision::Approve, comment: None, responded_at: chrono::Utc::now(), delegated_from: None },
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let result = orch.run(&agent, serde_json::json!({}), "user1", "session1", RunMode::Production).await;
        responder.await.unwrap();
        assert!(result.success);
        assert_eq!(result.completed_steps, 1);
    }

    #[tokio::test]
    async fn human_approval_rejection_halts_the_run() {
        let orch = orchestrator();
        let approval = WorkflowStep::new(
            "approve",
            "Approve",
            StepKind::HumanApproval {
                approvers: vec!["alice".to_string()],
                policy: Some(ApprovalPolicy::All),
                title: "Ship it?".to_string(),
                message: None,
                timeout_action: Some(TimeoutAction::Reject),
                escalation_targets: Vec::new(),
            },
        );
        let agent = agent_with(vec![approval]);
        let tracker = orch.approvals();

        let responder = tokio::spawn(async move {
            loop {
                let requests: Vec<ApprovalRequest> = {
                    let guard = tracker.requests.read();
                    guard.values().cloned().collect()
                };
                if let Some(request) = requests.into_iter().find(|r| r.step_id == "approve") {
                    tracker.respond(
                        &request.id,
                        ApprovalResponse { approver_id: "alice".to_string(), decision: ApprovalDecision::Reject, comment: None, responded_at: chrono::Utc::now(), delegated_from: None },
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let result = orch.run(&agent, serde_json::json!({}), "user1", "session1", RunMode::Production).await;
        responder.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("APPROVAL_REJECTED"));
    }

    #[tokio::test]
    async fn resume_continues_past_previously_completed_steps() {
        let orch = orchestrator();
        let ctx = ExecutionContext::new("exec1", "agent1", "user1", "session1", Value::Null, RunMode::Production);
        ctx.mark_completed("s1".to_string());
        ctx.set_step_output("s1", StepOutput::success("s1", "system", "action", serde_json::json!({"value": 1}), Duration::from_millis(1)));

        struct StubStore {
            snapshot: RwLock<Option<Value>>,
        }
        #[async_trait]
        impl DurableStore for StubStore {
            async fn record_execution(&self, _record: &ExecutionRecord) -> Result<()> {
                Ok(())
            }
            async fn record_step(&self, _execution_id: &str, _output: &StepOutput) -> Result<()> {
                Ok(())
            }
            async fn record_approval(&self, _request: &ApprovalRequest) -> Result<()> {
                Ok(())
            }
            async fn record_token_usage(&self, _execution_id: &str, _step_id: &str, _usage: TokenUsage, _plugin_equivalent: bool) -> Result<()> {
                Ok(())
            }
            async fn load_checkpoint(&self, _execution_id: &str) -> Result<Option<Value>> {
                Ok(self.snapshot.read().clone())
            }
            async fn save_checkpoint(&self, _execution_id: &str, snapshot: Value) -> Result<()> {
                *self.snapshot.write() = Some(snapshot);
                Ok(())
            }
        }

        let store: Arc<dyn DurableStore> = Arc::new(StubStore { snapshot: RwLock::new(Some(ctx.snapshot())) });
        let orch = orch.with_durable_store(store);

        let s1 = WorkflowStep::new("s1", "First", StepKind::Action { plugin: "echo".to_string(), action: "run".to_string(), params: Value::Null }).with_retry(RetryPolicy::default());
        let s2 = WorkflowStep::new("s2", "Second", StepKind::Action { plugin: "echo".to_string(), action: "run".to_string(), params: Value::Null }).with_dependency("s1");
        let agent = agent_with(vec![s1, s2]);

        orch.state_manager.create_execution("exec1", "agent1").await.unwrap();
        let result = orch.resume(&agent, "exec1").await;
        assert!(result.success);
        assert_eq!(result.completed_steps, 2);
    }
}
