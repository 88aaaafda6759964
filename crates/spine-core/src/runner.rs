//! Synchronous pipeline runner: scoped timing and structured logging

use chrono::Utc;
use tracing::{error, info, instrument};

use crate::context::ExecutionContext;
use crate::dispatcher::Execution;
use crate::params::Params;
use crate::pipeline::{Pipeline, PipelineStatus};

/// Run a pipeline to completion and materialize the execution record
#[instrument(
    skip(pipeline, params),
    fields(execution_id = %ctx.execution_id, batch_id = %ctx.batch_id)
)]
pub async fn run_pipeline(
    pipeline_name: &str,
    pipeline: &dyn Pipeline,
    ctx: &ExecutionContext,
    params: &Params,
) -> Execution {
    let started_at = Utc::now();
    info!(pipeline = pipeline_name, "pipeline started");

    let result = pipeline.run(ctx, params).await;

    let finished_at = Utc::now();
    let elapsed_ms = (finished_at - started_at).num_milliseconds();

    match result.status {
        PipelineStatus::Completed => info!(
            pipeline = pipeline_name,
            elapsed_ms,
            row_count = result.row_count,
            capture_id = result.capture_id.as_deref(),
            "pipeline completed"
        ),
        PipelineStatus::Skipped => info!(pipeline = pipeline_name, elapsed_ms, "pipeline skipped"),
        PipelineStatus::Failed => error!(
            pipeline = pipeline_name,
            elapsed_ms,
            error = result.error.as_deref(),
            category = result.error_category.map(|c| c.as_str()),
            "pipeline failed"
        ),
    }

    Execution {
        execution_id: ctx.execution_id,
        pipeline_name: pipeline_name.to_string(),
        batch_id: ctx.batch_id.clone(),
        trigger_source: ctx.trigger_source,
        status: result.status,
        result,
        started_at,
        finished_at,
    }
}
