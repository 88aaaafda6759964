//! The queue worker: claim -> dispatch -> complete/fail
//!
//! Any number of worker processes may run against the same store; the
//! claim transaction guarantees single-reader-wins. Failures are written
//! back through `fail` (which applies the retry backoff) and recorded as
//! anomalies so no partition failure is silent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use spine_core::context::TriggerSource;
use spine_core::dispatcher::Dispatcher;
use spine_core::error::ErrorCategory;
use spine_core::pipeline::PipelineStatus;
use spine_core::Lane;
use spine_storage::{NewAnomaly, Severity, SpineStore, StoreError, WorkItem};

use crate::poller::{PollerConfig, WorkPoller};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Lanes this worker serves; None serves all lanes
    pub lanes: Option<Vec<Lane>>,

    pub poller: PollerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            lanes: None,
            poller: PollerConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_lanes(mut self, lanes: Vec<Lane>) -> Self {
        self.lanes = Some(lanes);
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }
}

/// Drains the work queue by running claimed items through the dispatcher
pub struct QueueWorker {
    store: Arc<dyn SpineStore>,
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl QueueWorker {
    pub fn new(
        store: Arc<dyn SpineStore>,
        dispatcher: Arc<Dispatcher>,
        config: WorkerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            shutdown_rx,
        }
    }

    /// Run until the shutdown signal flips
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run(mut self) {
        info!("queue worker started");
        let mut poller = WorkPoller::new(
            self.store.clone(),
            self.config.worker_id.clone(),
            self.config.lanes.clone(),
            self.config.poller.clone(),
        );

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            match poller.poll().await {
                Ok(Some(item)) => {
                    self.process(item).await;
                }
                Ok(None) => {
                    let sleep = tokio::time::sleep(poller.interval());
                    tokio::select! {
                        _ = sleep => {}
                        _ = self.shutdown_rx.changed() => {}
                    }
                }
                Err(e) => {
                    error!("claim failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("queue worker stopped");
    }

    /// Process one claimed item and settle its state
    pub async fn process(&self, item: WorkItem) {
        let outcome = self.run_item(&item).await;
        if let Err(e) = outcome {
            error!(item = %item.id, "failed to settle work item: {e}");
        }
    }

    async fn run_item(&self, item: &WorkItem) -> Result<(), StoreError> {
        // Partition dimensions ride along as params; explicit params win
        let mut params = item.params.clone();
        for (dimension, value) in item.partition.iter() {
            if !params.contains_key(dimension) {
                params.set(dimension, value);
            }
        }

        let submitted = self
            .dispatcher
            .submit(&item.pipeline, params, TriggerSource::Scheduler, None)
            .await;

        match submitted {
            Ok(execution) => {
                self.store
                    .assign_execution(item.id, execution.execution_id)
                    .await?;

                if execution.status == PipelineStatus::Failed {
                    let error = execution
                        .result
                        .error
                        .unwrap_or_else(|| "pipeline failed".to_string());
                    let category = execution
                        .result
                        .error_category
                        .unwrap_or(ErrorCategory::Internal);
                    let state = self.store.fail(item.id, &error).await?;
                    warn!(item = %item.id, next = %state, "work item failed");

                    self.store
                        .record_anomaly(NewAnomaly {
                            domain: item.domain.clone(),
                            partition: Some(item.partition.clone()),
                            severity: Severity::Error,
                            category,
                            message: format!("{} failed: {error}", item.pipeline),
                        })
                        .await?;
                } else {
                    self.store.complete(item.id).await?;
                }
            }
            Err(e) => {
                // Dispatch-level failure (unregistered pipeline, config)
                let state = self.store.fail(item.id, &e.to_string()).await?;
                warn!(item = %item.id, next = %state, "work item dispatch failed");
                self.store
                    .record_anomaly(NewAnomaly {
                        domain: item.domain.clone(),
                        partition: Some(item.partition.clone()),
                        severity: Severity::Error,
                        category: e.category(),
                        message: e.to_string(),
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use spine_core::prelude::*;
    use spine_storage::{MemorySpineStore, NewWorkItem, WorkItemState};

    struct FlakyIngest;

    #[async_trait]
    impl Pipeline for FlakyIngest {
        async fn run(&self, _ctx: &ExecutionContext, params: &Params) -> PipelineResult {
            match params.get_str("tier") {
                Some("BAD") => PipelineResult::failed("upstream 503", ErrorCategory::Transient),
                _ => PipelineResult::completed().with_capture("finra:p:20250101", 5),
            }
        }
    }

    fn fixture() -> (Arc<MemorySpineStore>, QueueWorker) {
        let registry = Arc::new(PipelineRegistry::new());
        registry
            .register("finra.ingest_week", factory(|| FlakyIngest))
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(registry));
        let store = Arc::new(MemorySpineStore::new());
        let (_tx, rx) = watch::channel(false);
        let worker = QueueWorker::new(
            store.clone(),
            dispatcher,
            WorkerConfig::default().with_worker_id("w-test"),
            rx,
        );
        (store, worker)
    }

    #[tokio::test]
    async fn test_claimed_item_completes() {
        let (store, worker) = fixture();
        let id = store
            .enqueue(NewWorkItem::new(
                "finra",
                "finra.ingest_week",
                PartitionKey::new().with("tier", "T1").with("week_ending", "2025-12-26"),
            ))
            .await
            .unwrap();

        let item = store.claim("w-test", None).await.unwrap().unwrap();
        worker.process(item).await;

        let settled = store.get_work_item(id).await.unwrap();
        assert_eq!(settled.state, WorkItemState::Complete);
    }

    #[tokio::test]
    async fn test_failed_item_goes_to_retry_wait_with_anomaly() {
        let (store, worker) = fixture();
        let id = store
            .enqueue(NewWorkItem::new(
                "finra",
                "finra.ingest_week",
                PartitionKey::new().with("tier", "BAD"),
            ))
            .await
            .unwrap();

        let item = store.claim("w-test", None).await.unwrap().unwrap();
        worker.process(item).await;

        let settled = store.get_work_item(id).await.unwrap();
        assert_eq!(settled.state, WorkItemState::RetryWait);
        assert_eq!(settled.last_error.as_deref(), Some("upstream 503"));

        let anomalies = store
            .list_anomalies(Default::default())
            .await
            .unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_unregistered_pipeline_fails_item() {
        let (store, worker) = fixture();
        let id = store
            .enqueue(NewWorkItem::new(
                "finra",
                "finra.not_registered",
                PartitionKey::new().with("tier", "T1"),
            ))
            .await
            .unwrap();

        let item = store.claim("w-test", None).await.unwrap().unwrap();
        worker.process(item).await;

        let settled = store.get_work_item(id).await.unwrap();
        assert_eq!(settled.state, WorkItemState::RetryWait);
        assert!(settled.last_error.unwrap().contains("pipeline not found"));
    }
}
