//! # Market Spine Orchestration
//!
//! Two coexisting orchestration layers:
//!
//! - **v1, pipeline groups**: named static DAGs. The [`PlanResolver`]
//!   validates, detects cycles (three-color DFS), topologically sorts
//!   (Kahn, name tie-break), and merges parameters; the [`GroupRunner`]
//!   executes the plan sequentially or with bounded parallelism.
//! - **v2, workflows**: ordered typed steps (lambda / pipeline / choice /
//!   wait / map) with an immutable [`WorkflowContext`] threaded through the
//!   run, checkpoint persistence, and resume.

pub mod context;
pub mod events;
pub mod group;
pub mod group_runner;
pub mod plan;
pub mod result;
pub mod retry;
pub mod step;
pub mod workflow_runner;

pub use context::WorkflowContext;
pub use events::{StepEvent, StepEventKind};
pub use group::{ExecutionMode, ExecutionPolicy, OnFailure, PipelineGroup, PipelineStep};
pub use group_runner::{
    aggregate_status, GroupRunResult, GroupRunner, GroupStatus, StepExecution, StepStatus,
};
pub use plan::{ExecutionPlan, PlanError, PlanResolver, PlannedStep};
pub use result::{StepResult, WorkflowResult, WorkflowStatus};
pub use retry::RetryPolicy;
pub use step::{
    lambda, ChoiceCondition, ErrorPolicy, LambdaHandler, MapFailureMode, MapItems,
    StepDefinition, StepKind, WaitFor, Workflow,
};
pub use workflow_runner::{CheckpointMode, RunnerOptions, WorkflowRunError, WorkflowRunner};
