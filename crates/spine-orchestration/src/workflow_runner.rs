//! The context-first workflow runner (v2)
//!
//! Threads an immutable [`WorkflowContext`] through every step, merges each
//! step's published output and context updates, persists checkpoints, and
//! resumes runs from the step after the last completed one. Coexists with
//! the v1 group runner; neither replaces the other.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use futures::future::BoxFuture;

use spine_core::context::TriggerSource;
use spine_core::dispatcher::Dispatcher;
use spine_core::error::ErrorCategory;
use spine_core::params::{keys, Params};
use spine_core::pipeline::PipelineStatus;
use spine_storage::{SpineStore, StoreError, WorkflowCheckpoint};

use crate::context::WorkflowContext;
use crate::events::{StepEvent, StepEventKind};
use crate::result::{StepResult, WorkflowResult, WorkflowStatus};
use crate::step::{
    ErrorPolicy, MapFailureMode, MapItems, StepDefinition, StepKind, WaitFor, Workflow,
};

/// When checkpoints are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointMode {
    /// Never persist (map sub-runs, throwaway workflows)
    #[default]
    Off,
    /// After every successful step
    EveryStep,
    /// Only after steps flagged `checkpoint = true`
    FlaggedOnly,
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub checkpoint_mode: CheckpointMode,
    /// Lambdas see `__dry_run__`; pipeline steps synthesize success; no
    /// checkpoints are written
    pub dry_run: bool,
    /// TTL applied to persisted checkpoints
    pub checkpoint_ttl: Option<Duration>,
    pub trigger_source: TriggerSource,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            checkpoint_mode: CheckpointMode::Off,
            dry_run: false,
            checkpoint_ttl: None,
            trigger_source: TriggerSource::Scheduler,
        }
    }
}

/// Errors from the runner itself (step failures are results, not errors)
#[derive(Debug, thiserror::Error)]
pub enum WorkflowRunError {
    /// Checkpointing or resume requested without a store
    #[error("checkpointing requires a store")]
    CheckpointStoreMissing,

    /// No checkpoint recorded for the run
    #[error("no checkpoint found for run {0}")]
    CheckpointNotFound(Uuid),

    /// Checkpoint names a step absent from the workflow
    #[error("workflow '{workflow}' has no step named '{step}'")]
    UnknownStep { workflow: String, step: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Executes workflows with explicit context flow
#[derive(Clone)]
pub struct WorkflowRunner {
    dispatcher: Arc<Dispatcher>,
    store: Option<Arc<dyn SpineStore>>,
    options: RunnerOptions,
}

impl WorkflowRunner {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            store: None,
            options: RunnerOptions::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SpineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    /// Run a workflow from the top with the given params
    #[instrument(skip(self, workflow, params), fields(workflow = %workflow.name))]
    pub async fn run(
        &self,
        workflow: &Workflow,
        params: Params,
    ) -> Result<WorkflowResult, WorkflowRunError> {
        let ctx = WorkflowContext::new(&workflow.name).with_params(params);
        self.execute(workflow, ctx, 0, vec![]).await
    }

    /// Run with a caller-prepared context (partition, as-of date, capture)
    pub async fn run_with_context(
        &self,
        workflow: &Workflow,
        ctx: WorkflowContext,
    ) -> Result<WorkflowResult, WorkflowRunError> {
        self.execute(workflow, ctx, 0, vec![]).await
    }

    /// Resume a run from its checkpoint, starting after the last completed
    /// step. Params may be overridden for the continuation.
    #[instrument(skip(self, workflow, params_override), fields(workflow = %workflow.name, %run_id))]
    pub async fn resume(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        params_override: Option<Params>,
    ) -> Result<WorkflowResult, WorkflowRunError> {
        let store = self
            .store
            .as_ref()
            .ok_or(WorkflowRunError::CheckpointStoreMissing)?;
        let checkpoint = store
            .load_checkpoint(run_id)
            .await?
            .ok_or(WorkflowRunError::CheckpointNotFound(run_id))?;

        let mut ctx: WorkflowContext = serde_json::from_value(checkpoint.context_snapshot)?;
        if let Some(overrides) = params_override {
            ctx = ctx.with_params(overrides);
        }

        let index = workflow.position_of(&checkpoint.step_name).ok_or_else(|| {
            WorkflowRunError::UnknownStep {
                workflow: workflow.name.clone(),
                step: checkpoint.step_name.clone(),
            }
        })?;

        // Steps up to the checkpoint that actually completed are the ones
        // that published an output.
        let pre_completed = workflow.steps[..=index]
            .iter()
            .filter(|s| ctx.step_outputs.contains_key(&s.name))
            .map(|s| s.name.clone())
            .collect();

        info!(resume_after = %checkpoint.step_name, "resuming workflow from checkpoint");
        self.execute(workflow, ctx, index + 1, pre_completed).await
    }

    // =========================================================================
    // Execution body
    // =========================================================================

    async fn execute(
        &self,
        workflow: &Workflow,
        mut ctx: WorkflowContext,
        start_index: usize,
        pre_completed: Vec<String>,
    ) -> Result<WorkflowResult, WorkflowRunError> {
        if self.checkpoints_enabled() && self.store.is_none() {
            return Err(WorkflowRunError::CheckpointStoreMissing);
        }

        let mut completed = pre_completed;
        let mut skipped = Vec::new();
        let mut failed_steps = Vec::new();
        let mut durations = BTreeMap::new();
        let mut events = Vec::new();
        let mut skip_until: Option<String> = None;
        let mut failure: Option<(String, String, Option<ErrorCategory>)> = None;

        for step in &workflow.steps[start_index..] {
            if let Some(target) = &skip_until {
                if step.name == *target {
                    skip_until = None;
                } else {
                    skipped.push(step.name.clone());
                    events.push(StepEvent::now(
                        ctx.run_id,
                        &workflow.name,
                        &step.name,
                        StepEventKind::Skipped,
                        None,
                    ));
                    continue;
                }
            }

            events.push(StepEvent::now(
                ctx.run_id,
                &workflow.name,
                &step.name,
                StepEventKind::Started,
                None,
            ));
            info!(step = %step.name, "step started");

            let started = Instant::now();
            let result = self.run_step_with_retry(workflow, step, &ctx).await;
            let elapsed = started.elapsed();
            durations.insert(step.name.clone(), elapsed);

            if result.success {
                events.push(StepEvent::now(
                    ctx.run_id,
                    &workflow.name,
                    &step.name,
                    StepEventKind::Completed,
                    Some(elapsed.as_millis() as u64),
                ));
                info!(step = %step.name, elapsed_ms = elapsed.as_millis() as u64, "step completed");

                ctx = ctx
                    .with_step_output(&step.name, result.output.clone())
                    .with_updates(&result.context_updates);
                completed.push(step.name.clone());

                if let Some(next) = &result.next_step {
                    skip_until = Some(next.clone());
                }

                if self.should_checkpoint(step) {
                    self.persist_checkpoint(workflow, &step.name, &mut ctx).await?;
                }
            } else {
                events.push(StepEvent::now(
                    ctx.run_id,
                    &workflow.name,
                    &step.name,
                    StepEventKind::Failed,
                    Some(elapsed.as_millis() as u64),
                ));
                warn!(
                    step = %step.name,
                    error = result.error.as_deref(),
                    category = result.error_category.map(|c| c.as_str()),
                    "step failed"
                );

                match &step.on_error {
                    ErrorPolicy::Continue => {
                        failed_steps.push(step.name.clone());
                        continue;
                    }
                    // Stop, or Retry whose attempts/categories are exhausted
                    _ => {
                        failure = Some((
                            step.name.clone(),
                            result.error.unwrap_or_else(|| "step failed".to_string()),
                            result.error_category,
                        ));
                        break;
                    }
                }
            }
        }

        let (status, error, error_category, error_step) = match failure {
            Some((step, error, category)) => {
                (WorkflowStatus::Failed, Some(error), category, Some(step))
            }
            None => (WorkflowStatus::Completed, None, None, None),
        };

        Ok(WorkflowResult {
            run_id: ctx.run_id,
            workflow_name: workflow.name.clone(),
            status,
            context: ctx,
            completed_steps: completed,
            skipped_steps: skipped,
            failed_steps,
            step_durations: durations,
            events,
            error,
            error_category,
            error_step,
        })
    }

    async fn run_step_with_retry(
        &self,
        workflow: &Workflow,
        step: &StepDefinition,
        ctx: &WorkflowContext,
    ) -> StepResult {
        let mut attempt: u32 = 1;
        loop {
            let result = self.run_step_bounded(workflow, step, ctx).await;
            if result.success {
                return result;
            }

            if let ErrorPolicy::Retry(policy) = &step.on_error {
                if policy.should_retry(result.error_category)
                    && policy.has_attempts_remaining(attempt)
                {
                    let delay = policy.delay_for_attempt(attempt + 1);
                    warn!(
                        step = %step.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying step"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            }
            return result;
        }
    }

    async fn run_step_bounded(
        &self,
        workflow: &Workflow,
        step: &StepDefinition,
        ctx: &WorkflowContext,
    ) -> StepResult {
        match step.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.run_step_once(workflow, step, ctx)).await
                {
                    Ok(result) => result,
                    Err(_) => StepResult::fail(
                        format!("step timed out after {}s", limit.as_secs()),
                        ErrorCategory::Timeout,
                    ),
                }
            }
            None => self.run_step_once(workflow, step, ctx).await,
        }
    }

    async fn run_step_once(
        &self,
        workflow: &Workflow,
        step: &StepDefinition,
        ctx: &WorkflowContext,
    ) -> StepResult {
        match &step.kind {
            StepKind::Lambda { handler } => {
                let view = if self.options.dry_run {
                    ctx.with_param(keys::DRY_RUN, true)
                } else {
                    ctx.clone()
                };
                handler(view).await
            }

            StepKind::Pipeline { pipeline, params } => {
                self.run_pipeline_step(pipeline, params, ctx).await
            }

            StepKind::Choice {
                condition,
                then_step,
                else_step,
            } => match condition(ctx) {
                Ok(chosen) => {
                    let target = if chosen {
                        Some(then_step.as_str())
                    } else {
                        else_step.as_deref()
                    };
                    if let Some(target) = target {
                        if workflow.position_of(target).is_none() {
                            return StepResult::fail(
                                format!("choice target '{target}' is not a step"),
                                ErrorCategory::Internal,
                            );
                        }
                    }
                    let mut result =
                        StepResult::ok(json!({ "condition": chosen, "chosen": target }));
                    if let Some(target) = target {
                        result = result.with_next_step(target);
                    }
                    result
                }
                Err(e) => StepResult::fail(
                    format!("choice condition failed: {e}"),
                    ErrorCategory::Internal,
                ),
            },

            StepKind::Wait { wait } => {
                if self.options.dry_run {
                    return StepResult::ok(json!({ "waited_ms": 0, "dry_run": true }));
                }
                let duration = match wait {
                    WaitFor::Duration(d) => *d,
                    WaitFor::Until(at) => (*at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                };
                tokio::time::sleep(duration).await;
                StepResult::ok(json!({ "waited_ms": duration.as_millis() as u64 }))
            }

            StepKind::Map {
                items,
                item_param,
                iterator,
                max_concurrency,
                on_item_failure,
            } => {
                self.run_map_step(
                    items,
                    item_param,
                    iterator.clone(),
                    *max_concurrency,
                    *on_item_failure,
                    ctx,
                )
                .await
            }
        }
    }

    async fn run_pipeline_step(
        &self,
        pipeline: &str,
        step_params: &Params,
        ctx: &WorkflowContext,
    ) -> StepResult {
        if self.options.dry_run {
            return StepResult::ok(json!({
                "pipeline": pipeline,
                "status": "completed",
                "dry_run": true,
            }));
        }

        let mut merged = ctx.params.merged(step_params);
        // Context-aware pipelines may read prior outputs
        let outputs: serde_json::Map<String, Value> = ctx
            .step_outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        merged.set(keys::STEP_OUTPUTS, Value::Object(outputs));

        let submitted = self
            .dispatcher
            .submit(
                pipeline,
                merged,
                self.options.trigger_source,
                Some(ctx.batch_id.clone()),
            )
            .await;

        match submitted {
            Ok(execution) => match execution.status {
                PipelineStatus::Failed => StepResult::fail(
                    execution
                        .result
                        .error
                        .unwrap_or_else(|| "pipeline failed".to_string()),
                    execution
                        .result
                        .error_category
                        .unwrap_or(ErrorCategory::Internal),
                ),
                status => {
                    let mut result = StepResult::ok(json!({
                        "status": status,
                        "capture_id": execution.result.capture_id,
                        "row_count": execution.result.row_count,
                        "metrics": execution.result.metrics,
                    }));
                    if let Some(quality) = execution.result.quality {
                        result = result.with_quality(quality);
                    }
                    result
                }
            },
            Err(e) => {
                let category = e.category();
                StepResult::fail(e.to_string(), category)
            }
        }
    }

    async fn run_map_step(
        &self,
        items: &MapItems,
        item_param: &str,
        iterator: Arc<Workflow>,
        max_concurrency: usize,
        on_item_failure: MapFailureMode,
        ctx: &WorkflowContext,
    ) -> StepResult {
        let resolved: Vec<Value> = match items {
            MapItems::Fixed(values) => values.clone(),
            MapItems::FromContext(key) => {
                let found = ctx
                    .params
                    .get(key)
                    .cloned()
                    .or_else(|| ctx.step_outputs.get(key).cloned());
                match found {
                    Some(Value::Array(values)) => values,
                    Some(_) => {
                        return StepResult::fail(
                            format!("map items at '{key}' are not an array"),
                            ErrorCategory::Configuration,
                        )
                    }
                    None => {
                        return StepResult::fail(
                            format!("map items not found at '{key}'"),
                            ErrorCategory::Dependency,
                        )
                    }
                }
            }
        };

        let total = resolved.len();
        if total == 0 {
            return StepResult::ok(json!({ "items": 0, "outputs": [] }));
        }

        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut join_set: JoinSet<(usize, Result<WorkflowResult, WorkflowRunError>)> =
            JoinSet::new();

        for (index, item) in resolved.into_iter().enumerate() {
            let child = ctx.child_for_item(item_param, item);
            let sub_runner = self.map_sub_runner();
            let iterator = iterator.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = sub_runner.execute_boxed(iterator, child).await;
                (index, result)
            });
        }

        let mut outputs: Vec<Value> = vec![Value::Null; total];
        let mut failures: Vec<(usize, String, Option<ErrorCategory>)> = Vec::new();

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(run))) => {
                    if run.is_completed() {
                        let published: serde_json::Map<String, Value> = run
                            .context
                            .step_outputs
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        outputs[index] = Value::Object(published);
                    } else {
                        failures.push((
                            index,
                            run.error.unwrap_or_else(|| "iteration failed".to_string()),
                            run.error_category,
                        ));
                    }
                }
                Ok((index, Err(e))) => {
                    failures.push((index, e.to_string(), Some(ErrorCategory::Internal)));
                }
                Err(join_error) => {
                    failures.push((usize::MAX, join_error.to_string(), Some(ErrorCategory::Internal)));
                }
            }
        }

        if failures.is_empty() {
            return StepResult::ok(json!({ "items": total, "outputs": outputs }));
        }

        failures.sort_by_key(|(index, _, _)| *index);
        match on_item_failure {
            MapFailureMode::FailFast => {
                let (index, error, category) = failures.remove(0);
                StepResult::fail(
                    format!("map item {index} failed: {error}"),
                    category.unwrap_or(ErrorCategory::Internal),
                )
            }
            MapFailureMode::Partial => {
                let failed: Vec<Value> = failures
                    .iter()
                    .map(|(index, error, _)| json!({ "index": index, "error": error }))
                    .collect();
                StepResult::ok(json!({
                    "items": total,
                    "outputs": outputs,
                    "failed": failed,
                }))
            }
        }
    }

    /// Sub-runs never checkpoint and never dry-run pipelines differently
    fn map_sub_runner(&self) -> WorkflowRunner {
        let mut sub = self.clone();
        sub.options.checkpoint_mode = CheckpointMode::Off;
        sub
    }

    /// Boxed entry point for map fan-out (breaks async recursion)
    fn execute_boxed(
        self,
        workflow: Arc<Workflow>,
        ctx: WorkflowContext,
    ) -> BoxFuture<'static, Result<WorkflowResult, WorkflowRunError>> {
        Box::pin(async move { self.execute(&workflow, ctx, 0, vec![]).await })
    }

    fn checkpoints_enabled(&self) -> bool {
        !self.options.dry_run && self.options.checkpoint_mode != CheckpointMode::Off
    }

    fn should_checkpoint(&self, step: &StepDefinition) -> bool {
        match self.options.checkpoint_mode {
            CheckpointMode::Off => false,
            CheckpointMode::EveryStep => !self.options.dry_run,
            CheckpointMode::FlaggedOnly => step.checkpoint && !self.options.dry_run,
        }
    }

    async fn persist_checkpoint(
        &self,
        workflow: &Workflow,
        step_name: &str,
        ctx: &mut WorkflowContext,
    ) -> Result<(), WorkflowRunError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        *ctx = ctx.with_checkpoint_step(step_name);
        let snapshot = serde_json::to_value(&*ctx)?;
        let now = Utc::now();
        let expires_at = self
            .options
            .checkpoint_ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);

        store
            .save_checkpoint(WorkflowCheckpoint {
                run_id: ctx.run_id,
                workflow_name: workflow.name.clone(),
                step_name: step_name.to_string(),
                context_snapshot: snapshot,
                created_at: now,
                expires_at,
            })
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRunner")
            .field("checkpoint_mode", &self.options.checkpoint_mode)
            .field("dry_run", &self.options.dry_run)
            .finish()
    }
}
