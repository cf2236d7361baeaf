//! ABOUTME: pilot-workflows - workflow planning, execution, and orchestration for Pilot
//! ABOUTME: Provides the DAG planner, step executor, parallel fan-out, and top-level orchestrator

pub mod cache;
pub mod conditions;
pub mod context;
pub mod executor;
pub mod normalizer;
pub mod orchestrator;
pub mod parallel;
pub mod planner;
pub mod transforms;

pub use cache::{CacheKey, StepCache};
pub use conditions::{Condition, ConditionalEvaluator, ValidationResult};
pub use context::ExecutionContext;
pub use executor::StepExecutor;
pub use normalizer::{map_to_declared_outputs, normalize_step_output, NormalizedOutput};
pub use orchestrator::{ApprovalTracker, ExecutionResult, Orchestrator};
pub use parallel::ParallelExecutor;
pub use planner::{ExecutionPlan, ParallelGroup, PlannedStep, WorkflowParser};
