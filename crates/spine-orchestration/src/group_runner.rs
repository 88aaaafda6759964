//! Executes a resolved plan sequentially or with bounded parallelism
//!
//! Parallel mode keeps a ready set (steps whose dependencies all completed)
//! and submits up to `max_concurrency` at a time. On a Stop-policy failure
//! it refuses to submit further steps, awaits whatever is in flight, and
//! marks un-started steps Skipped; running pipelines are never
//! interrupted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use spine_core::context::TriggerSource;
use spine_core::dispatcher::{Dispatcher, Execution};
use spine_core::pipeline::PipelineStatus;

use crate::group::{ExecutionMode, OnFailure};
use crate::plan::{ExecutionPlan, PlannedStep};

/// Status of one step in a group run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// Aggregate status of the whole group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Partial,
}

/// Aggregation table: child statuses -> group status
pub fn aggregate_status(statuses: &[StepStatus]) -> GroupStatus {
    if statuses.iter().all(|s| *s == StepStatus::Completed) {
        return GroupStatus::Completed;
    }
    if statuses.iter().any(|s| *s == StepStatus::Running) {
        return GroupStatus::Running;
    }
    if statuses.iter().any(|s| *s == StepStatus::Failed) {
        return GroupStatus::Failed;
    }
    if statuses.iter().any(|s| *s == StepStatus::Cancelled) {
        return GroupStatus::Cancelled;
    }
    if statuses.iter().all(|s| *s == StepStatus::Pending) {
        return GroupStatus::Pending;
    }
    GroupStatus::Partial
}

/// Outcome of one step
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub name: String,
    pub pipeline: String,
    pub status: StepStatus,
    pub execution: Option<Execution>,
    pub error: Option<String>,
}

impl StepExecution {
    fn pending(step: &PlannedStep) -> Self {
        Self {
            name: step.name.clone(),
            pipeline: step.pipeline.clone(),
            status: StepStatus::Pending,
            execution: None,
            error: None,
        }
    }
}

/// Result of running a group
#[derive(Debug, Clone)]
pub struct GroupRunResult {
    pub batch_id: String,
    pub group_name: String,
    pub status: GroupStatus,
    pub steps: Vec<StepExecution>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl GroupRunResult {
    pub fn step(&self, name: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Runs execution plans through the dispatcher
pub struct GroupRunner {
    dispatcher: Arc<Dispatcher>,
    trigger_source: TriggerSource,
}

impl GroupRunner {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            trigger_source: TriggerSource::Scheduler,
        }
    }

    pub fn with_trigger(mut self, trigger_source: TriggerSource) -> Self {
        self.trigger_source = trigger_source;
        self
    }

    #[instrument(skip(self, plan), fields(group = %plan.group_name, batch_id = %plan.batch_id))]
    pub async fn run(&self, plan: ExecutionPlan) -> GroupRunResult {
        let started_at = Utc::now();
        info!(steps = plan.steps.len(), mode = ?plan.policy.execution, "group run started");

        let steps = match plan.policy.execution {
            ExecutionMode::Sequential => self.run_sequential(&plan).await,
            ExecutionMode::Parallel => self.run_parallel(&plan).await,
        };

        let status = aggregate_status(&steps.iter().map(|s| s.status).collect::<Vec<_>>());
        info!(status = ?status, "group run finished");

        GroupRunResult {
            batch_id: plan.batch_id,
            group_name: plan.group_name,
            status,
            steps,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_sequential(&self, plan: &ExecutionPlan) -> Vec<StepExecution> {
        let mut out: Vec<StepExecution> = plan.steps.iter().map(StepExecution::pending).collect();
        let mut aborted = false;

        for (i, step) in plan.steps.iter().enumerate() {
            if aborted {
                out[i].status = StepStatus::Skipped;
                continue;
            }

            out[i] = submit_step(
                self.dispatcher.clone(),
                step.clone(),
                plan.batch_id.clone(),
                self.trigger_source,
                plan.policy.timeout,
            )
            .await;

            if out[i].status == StepStatus::Failed && plan.policy.on_failure == OnFailure::Stop {
                warn!(step = %step.name, "step failed; stopping group");
                aborted = true;
            }
        }
        out
    }

    async fn run_parallel(&self, plan: &ExecutionPlan) -> Vec<StepExecution> {
        let n = plan.steps.len();
        let mut statuses = vec![StepStatus::Pending; n];
        let mut out: Vec<StepExecution> = plan.steps.iter().map(StepExecution::pending).collect();
        let index_of: HashMap<&str, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let semaphore = Arc::new(Semaphore::new(plan.policy.max_concurrency.max(1)));
        let mut join_set: JoinSet<(usize, StepExecution)> = JoinSet::new();
        let mut aborted = false;

        loop {
            // Submit every ready step, unless we are draining after a stop
            if !aborted {
                for (i, step) in plan.steps.iter().enumerate() {
                    if statuses[i] != StepStatus::Pending {
                        continue;
                    }
                    let ready = step
                        .depends_on
                        .iter()
                        .all(|d| statuses[index_of[d.as_str()]] == StepStatus::Completed);
                    if !ready {
                        continue;
                    }

                    statuses[i] = StepStatus::Running;
                    let semaphore = semaphore.clone();
                    let dispatcher = self.dispatcher.clone();
                    let step = step.clone();
                    let batch_id = plan.batch_id.clone();
                    let trigger = self.trigger_source;
                    let timeout = plan.policy.timeout;
                    join_set.spawn(async move {
                        let _permit = semaphore.acquire_owned().await;
                        let result =
                            submit_step(dispatcher, step, batch_id, trigger, timeout).await;
                        (i, result)
                    });
                }
            }

            // Steps whose dependencies can no longer complete are skipped
            loop {
                let mut changed = false;
                for (i, step) in plan.steps.iter().enumerate() {
                    if statuses[i] != StepStatus::Pending {
                        continue;
                    }
                    let blocked = step.depends_on.iter().any(|d| {
                        matches!(
                            statuses[index_of[d.as_str()]],
                            StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
                        )
                    });
                    if blocked || aborted {
                        statuses[i] = StepStatus::Skipped;
                        out[i].status = StepStatus::Skipped;
                        changed = true;
                    }
                }
                if !changed {
                    break;
                }
            }

            match join_set.join_next().await {
                Some(Ok((i, step_execution))) => {
                    statuses[i] = step_execution.status;
                    if step_execution.status == StepStatus::Failed
                        && plan.policy.on_failure == OnFailure::Stop
                    {
                        warn!(step = %step_execution.name, "step failed; draining in-flight work");
                        aborted = true;
                    }
                    out[i] = step_execution;
                }
                Some(Err(join_error)) => {
                    error!("group worker task failed: {join_error}");
                }
                None => break,
            }
        }

        out
    }
}

async fn submit_step(
    dispatcher: Arc<Dispatcher>,
    step: PlannedStep,
    batch_id: String,
    trigger_source: TriggerSource,
    timeout: Option<Duration>,
) -> StepExecution {
    let submit = dispatcher.submit(&step.pipeline, step.params.clone(), trigger_source, Some(batch_id));

    let submitted = match timeout {
        Some(limit) => match tokio::time::timeout(limit, submit).await {
            Ok(result) => result,
            Err(_) => {
                return StepExecution {
                    name: step.name,
                    pipeline: step.pipeline,
                    status: StepStatus::Failed,
                    execution: None,
                    error: Some(format!("step timed out after {}s", limit.as_secs())),
                }
            }
        },
        None => submit.await,
    };

    match submitted {
        Ok(execution) => {
            let (status, error) = match execution.status {
                PipelineStatus::Failed => {
                    (StepStatus::Failed, execution.result.error.clone())
                }
                // A pipeline that decided to no-op still completes its step
                PipelineStatus::Completed | PipelineStatus::Skipped => {
                    (StepStatus::Completed, None)
                }
            };
            StepExecution {
                name: step.name,
                pipeline: step.pipeline,
                status,
                execution: Some(execution),
                error,
            }
        }
        Err(e) => StepExecution {
            name: step.name,
            pipeline: step.pipeline,
            status: StepStatus::Failed,
            execution: None,
            error: Some(e.to_string()),
        },
    }
}
