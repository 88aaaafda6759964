//! End-to-end tests for plan resolution + group execution

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use spine_core::prelude::*;
use spine_orchestration::{
    ExecutionPolicy, GroupRunner, GroupStatus, OnFailure, PipelineGroup, PipelineStep,
    PlanResolver, StepStatus,
};

/// Records invocation order; fails when params carry fail=true
struct Recording {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Pipeline for Recording {
    async fn run(&self, _ctx: &ExecutionContext, params: &Params) -> PipelineResult {
        self.log.lock().push(self.name.to_string());
        if params.get_bool("fail").unwrap_or(false) {
            PipelineResult::failed("induced failure", ErrorCategory::Internal)
        } else {
            PipelineResult::completed().with_metric("ran", 1.0)
        }
    }
}

struct Fixture {
    dispatcher: Arc<Dispatcher>,
    log: Arc<Mutex<Vec<String>>>,
}

fn fixture() -> Fixture {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));
    let registry = Arc::new(PipelineRegistry::new());
    for name in ["ingest", "normalize", "enrich", "calc"] {
        let log = log.clone();
        registry
            .register(
                format!("finra.{name}"),
                Arc::new(move || {
                    Arc::new(Recording {
                        name,
                        log: log.clone(),
                    }) as Arc<dyn Pipeline>
                }),
            )
            .unwrap();
    }
    Fixture {
        dispatcher: Arc::new(Dispatcher::new(registry)),
        log,
    }
}

fn linear_group() -> PipelineGroup {
    PipelineGroup::new("weekly", "finra")
        .step(PipelineStep::new("a", "finra.ingest"))
        .step(PipelineStep::new("b", "finra.normalize").depends_on(["a"]))
        .step(PipelineStep::new("c", "finra.calc").depends_on(["b"]))
}

#[tokio::test]
async fn test_sequential_all_complete() {
    let f = fixture();
    let plan = PlanResolver::new()
        .resolve(&linear_group(), &Params::new())
        .unwrap();
    let batch_id = plan.batch_id.clone();

    let result = GroupRunner::new(f.dispatcher.clone()).run(plan).await;

    assert_eq!(result.status, GroupStatus::Completed);
    assert_eq!(result.batch_id, batch_id);
    for step in &result.steps {
        assert_eq!(step.status, StepStatus::Completed);
        // Every execution joined the plan's batch
        assert_eq!(step.execution.as_ref().unwrap().batch_id, batch_id);
    }
}

#[tokio::test]
async fn test_sequential_stop_skips_rest() {
    let f = fixture();
    let group = PipelineGroup::new("weekly", "finra")
        .step(PipelineStep::new("a", "finra.ingest"))
        .step(
            PipelineStep::new("b", "finra.normalize")
                .depends_on(["a"])
                .with_params(Params::new().with("fail", true)),
        )
        .step(PipelineStep::new("c", "finra.calc").depends_on(["b"]));
    let plan = PlanResolver::new().resolve(&group, &Params::new()).unwrap();

    let result = GroupRunner::new(f.dispatcher.clone()).run(plan).await;

    assert_eq!(result.status, GroupStatus::Failed);
    assert_eq!(result.step("a").unwrap().status, StepStatus::Completed);
    assert_eq!(result.step("b").unwrap().status, StepStatus::Failed);
    assert_eq!(result.step("c").unwrap().status, StepStatus::Skipped);
    assert_eq!(
        result.step("b").unwrap().error.as_deref(),
        Some("induced failure")
    );
}

#[tokio::test]
async fn test_sequential_continue_runs_rest() {
    let f = fixture();
    let group = PipelineGroup::new("weekly", "finra")
        .with_policy(ExecutionPolicy::sequential().with_on_failure(OnFailure::Continue))
        .step(
            PipelineStep::new("a", "finra.ingest")
                .with_params(Params::new().with("fail", true)),
        )
        .step(PipelineStep::new("b", "finra.normalize"));
    let plan = PlanResolver::new().resolve(&group, &Params::new()).unwrap();

    let result = GroupRunner::new(f.dispatcher.clone()).run(plan).await;

    assert_eq!(result.status, GroupStatus::Failed);
    assert_eq!(result.step("a").unwrap().status, StepStatus::Failed);
    assert_eq!(result.step("b").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn test_parallel_diamond_completes() {
    let f = fixture();
    let group = PipelineGroup::new("weekly", "finra")
        .with_policy(ExecutionPolicy::parallel(4))
        .step(PipelineStep::new("a", "finra.ingest"))
        .step(PipelineStep::new("b", "finra.normalize").depends_on(["a"]))
        .step(PipelineStep::new("c", "finra.enrich").depends_on(["a"]))
        .step(PipelineStep::new("d", "finra.calc").depends_on(["b", "c"]));
    let plan = PlanResolver::new().resolve(&group, &Params::new()).unwrap();

    let result = GroupRunner::new(f.dispatcher.clone()).run(plan).await;

    assert_eq!(result.status, GroupStatus::Completed);
    assert_eq!(f.log.lock().len(), 4);
}

#[tokio::test]
async fn test_parallel_stop_skips_dependents() {
    let f = fixture();
    let group = PipelineGroup::new("weekly", "finra")
        .with_policy(ExecutionPolicy::parallel(2))
        .step(PipelineStep::new("a", "finra.ingest"))
        .step(
            PipelineStep::new("b", "finra.normalize")
                .depends_on(["a"])
                .with_params(Params::new().with("fail", true)),
        )
        .step(PipelineStep::new("c", "finra.enrich").depends_on(["a"]))
        .step(PipelineStep::new("d", "finra.calc").depends_on(["b", "c"]));
    let plan = PlanResolver::new().resolve(&group, &Params::new()).unwrap();

    let result = GroupRunner::new(f.dispatcher.clone()).run(plan).await;

    assert_eq!(result.status, GroupStatus::Failed);
    assert_eq!(result.step("b").unwrap().status, StepStatus::Failed);
    // d depends on the failed step and never started
    assert_eq!(result.step("d").unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_unregistered_pipeline_fails_step_at_runtime() {
    let f = fixture();
    // No registry check at resolution; failure surfaces when the step runs
    let group = PipelineGroup::new("weekly", "finra")
        .step(PipelineStep::new("a", "finra.not_registered"));
    let plan = PlanResolver::new().resolve(&group, &Params::new()).unwrap();

    let result = GroupRunner::new(f.dispatcher.clone()).run(plan).await;

    assert_eq!(result.status, GroupStatus::Failed);
    assert!(result
        .step("a")
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("pipeline not found"));
}

#[tokio::test]
async fn test_step_timeout_fails_step() {
    struct Slow;

    #[async_trait]
    impl Pipeline for Slow {
        async fn run(&self, _ctx: &ExecutionContext, _params: &Params) -> PipelineResult {
            tokio::time::sleep(Duration::from_secs(5)).await;
            PipelineResult::completed()
        }
    }

    let registry = Arc::new(PipelineRegistry::new());
    registry.register("slow.step", factory(|| Slow)).unwrap();
    let dispatcher = Arc::new(Dispatcher::new(registry));

    let group = PipelineGroup::new("slow", "test")
        .with_policy(ExecutionPolicy::sequential().with_timeout(Duration::from_millis(50)))
        .step(PipelineStep::new("a", "slow.step"));
    let plan = PlanResolver::new().resolve(&group, &Params::new()).unwrap();

    let result = GroupRunner::new(dispatcher).run(plan).await;

    assert_eq!(result.status, GroupStatus::Failed);
    assert!(result
        .step("a")
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("timed out"));
}
