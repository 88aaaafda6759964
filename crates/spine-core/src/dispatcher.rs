//! The single entry point for executing a pipeline by name
//!
//! `submit` resolves the factory, creates the execution context, and
//! delegates to the runner. It returns only when the pipeline has
//! finished; the dispatcher never detaches work.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SpineConfig;
use crate::context::{ExecutionContext, TriggerSource};
use crate::error::CoreError;
use crate::params::Params;
use crate::pipeline::{PipelineResult, PipelineStatus};
use crate::registry::PipelineRegistry;
use crate::runner;

/// Materialized record of one pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub pipeline_name: String,
    pub batch_id: String,
    pub trigger_source: TriggerSource,
    pub status: PipelineStatus,
    pub result: PipelineResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Execution {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Resolves pipeline names and runs them to completion
pub struct Dispatcher {
    registry: Arc<PipelineRegistry>,
    config: Arc<SpineConfig>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PipelineRegistry>) -> Self {
        Self {
            registry,
            config: Arc::new(SpineConfig::default()),
        }
    }

    pub fn with_config(registry: Arc<PipelineRegistry>, config: SpineConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SpineConfig {
        &self.config
    }

    /// Execute a pipeline by name and wait for its result
    ///
    /// Fails with `PipelineNotFound` before any side effect when the name
    /// is unknown. A provided batch id is inherited; otherwise a fresh one
    /// is minted with the new context.
    pub async fn submit(
        &self,
        pipeline_name: &str,
        params: Params,
        trigger_source: TriggerSource,
        batch_id: Option<String>,
    ) -> Result<Execution, CoreError> {
        let factory = self.registry.get(pipeline_name)?;

        let mut ctx = ExecutionContext::new(trigger_source);
        if let Some(batch_id) = batch_id {
            ctx = ctx.with_batch_id(batch_id);
        }

        let pipeline = factory();
        Ok(runner::run_pipeline(pipeline_name, pipeline.as_ref(), &ctx, &params).await)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pipelines", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::pipeline::{factory, Pipeline, PipelineResult};
    use crate::registry::RegistryError;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Pipeline for Echo {
        async fn run(&self, _ctx: &ExecutionContext, params: &Params) -> PipelineResult {
            match params.get_str("mode") {
                Some("fail") => PipelineResult::failed("boom", ErrorCategory::Internal),
                _ => PipelineResult::completed().with_capture("d:{}:20250101", 7),
            }
        }
    }

    fn dispatcher() -> Dispatcher {
        let registry = Arc::new(PipelineRegistry::new());
        registry.register("test.echo", factory(|| Echo)).unwrap();
        Dispatcher::new(registry)
    }

    #[tokio::test]
    async fn test_submit_success() {
        let exec = dispatcher()
            .submit("test.echo", Params::new(), TriggerSource::Test, None)
            .await
            .unwrap();

        assert_eq!(exec.status, PipelineStatus::Completed);
        assert_eq!(exec.result.row_count, Some(7));
        assert!(exec.finished_at >= exec.started_at);
    }

    #[tokio::test]
    async fn test_submit_unknown_pipeline() {
        let err = dispatcher()
            .submit("test.missing", Params::new(), TriggerSource::Test, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoreError::Registry(RegistryError::PipelineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_inherits_batch_id() {
        let exec = dispatcher()
            .submit(
                "test.echo",
                Params::new(),
                TriggerSource::Scheduler,
                Some("sweep_abc".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(exec.batch_id, "sweep_abc");
    }

    #[tokio::test]
    async fn test_failed_pipeline_is_materialized_not_error() {
        let exec = dispatcher()
            .submit(
                "test.echo",
                Params::new().with("mode", "fail"),
                TriggerSource::Test,
                None,
            )
            .await
            .unwrap();

        assert_eq!(exec.status, PipelineStatus::Failed);
        assert_eq!(exec.result.error.as_deref(), Some("boom"));
    }
}
