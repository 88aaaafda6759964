//! Daily price scheduler
//!
//! Iterates a symbol list, submitting the configured daily ingest pipeline
//! per symbol with a rate-limit sleep between calls. Exit-code contract
//! matches the weekly scheduler, with code 3 reserved for configuration
//! errors (no symbols, unregistered pipeline).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tracing::{info, instrument, warn};

use spine_core::capture::capture_id;
use spine_core::context::{new_batch_id, TriggerSource};
use spine_core::dispatcher::Dispatcher;
use spine_core::error::ErrorCategory;
use spine_core::params::{keys, Params};
use spine_core::partition::PartitionKey;
use spine_core::pipeline::PipelineStatus;
use spine_core::stage;
use spine_storage::{ManifestWrite, NewAnomaly, SpineStore};

use crate::report::{OutcomeKind, PartitionOutcome, PhaseKind, ScheduleReport};
use crate::weekly::{RunMode, ScheduleError};

/// How much history the upstream price API should return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputSize {
    #[default]
    Compact,
    Full,
}

impl OutputSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Full => "full",
        }
    }
}

impl FromStr for OutputSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compact" => Ok(Self::Compact),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown outputsize: {other} (expected compact|full)")),
        }
    }
}

/// Price sweep configuration
#[derive(Debug, Clone)]
pub struct PriceScheduleConfig {
    pub domain: String,
    pub pipeline: String,
    pub symbols: Vec<String>,
    /// Sleep between consecutive submissions (upstream rate limits)
    pub sleep: Duration,
    pub outputsize: OutputSize,
    pub mode: RunMode,
    pub fail_fast: bool,
    /// Capture date; defaults to today UTC
    pub as_of: Option<NaiveDate>,
}

impl PriceScheduleConfig {
    pub fn new(pipeline: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            domain: "prices".to_string(),
            pipeline: pipeline.into(),
            symbols,
            sleep: Duration::from_millis(1000),
            outputsize: OutputSize::Compact,
            mode: RunMode::Run,
            fail_fast: false,
            as_of: None,
        }
    }
}

/// Drives per-symbol daily ingests
pub struct PriceScheduler {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn SpineStore>,
    config: PriceScheduleConfig,
}

impl PriceScheduler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn SpineStore>,
        config: PriceScheduleConfig,
    ) -> Self {
        Self {
            dispatcher,
            store,
            config,
        }
    }

    #[instrument(skip(self), fields(symbols = self.config.symbols.len()))]
    pub async fn run(&self) -> Result<ScheduleReport, ScheduleError> {
        let cfg = &self.config;
        if cfg.symbols.is_empty() {
            return Err(ScheduleError::Configuration(
                "no symbols provided".to_string(),
            ));
        }
        if !self.dispatcher.registry().contains(&cfg.pipeline) {
            return Err(ScheduleError::Configuration(format!(
                "pipeline '{}' is not registered",
                cfg.pipeline
            )));
        }

        let as_of = cfg.as_of.unwrap_or_else(|| Utc::now().date_naive());
        let batch_id = new_batch_id(&format!("sweep_{}", cfg.domain));
        let mut report = ScheduleReport::new(cfg.domain.clone(), batch_id.clone(), vec![]);
        info!(%as_of, "price sweep started");

        for (index, symbol) in cfg.symbols.iter().enumerate() {
            let outcome = self.ingest_symbol(symbol, as_of, &batch_id).await;
            let failed = outcome.outcome == OutcomeKind::Failed;
            report.record(outcome);

            if failed && cfg.fail_fast {
                warn!(symbol, "fail-fast: aborting price sweep");
                break;
            }
            // Rate limit between upstream calls, not after the last one
            if cfg.mode == RunMode::Run && index + 1 < cfg.symbols.len() {
                tokio::time::sleep(cfg.sleep).await;
            }
        }

        report.finish();
        info!(exit_code = report.exit_code(), "price sweep finished");
        Ok(report)
    }

    async fn ingest_symbol(
        &self,
        symbol: &str,
        as_of: NaiveDate,
        batch_id: &str,
    ) -> PartitionOutcome {
        let cfg = &self.config;
        let partition = PartitionKey::symbol(symbol);
        let cid = capture_id(&cfg.domain, &partition, as_of);

        if cfg.mode == RunMode::DryRun {
            return PartitionOutcome {
                phase: PhaseKind::Ingest,
                partition,
                outcome: OutcomeKind::DryRun,
                detail: Some(format!("would ingest {symbol}")),
                capture_id: Some(cid),
                row_count: None,
            };
        }

        let params = Params::new()
            .with(keys::SYMBOL, symbol)
            .with(keys::OUTPUT_SIZE, cfg.outputsize.as_str())
            .with(keys::CAPTURE_ID, cid.clone());

        let submitted = self
            .dispatcher
            .submit(
                &cfg.pipeline,
                params,
                TriggerSource::Scheduler,
                Some(batch_id.to_string()),
            )
            .await;

        match submitted {
            Ok(execution) if execution.status == PipelineStatus::Failed => {
                let detail = execution
                    .result
                    .error
                    .unwrap_or_else(|| "price ingest failed".to_string());
                let category = execution
                    .result
                    .error_category
                    .unwrap_or(ErrorCategory::Internal);
                self.record_failure(&partition, category, &detail).await;
                PartitionOutcome {
                    phase: PhaseKind::Ingest,
                    partition,
                    outcome: OutcomeKind::Failed,
                    detail: Some(detail),
                    capture_id: None,
                    row_count: None,
                }
            }
            Ok(execution) => {
                let row_count = execution.result.row_count.unwrap_or(0);
                let write = ManifestWrite::new(
                    &cfg.domain,
                    &cfg.pipeline,
                    partition.clone(),
                    stage::RAW,
                    cid.clone(),
                    row_count,
                )
                .with_execution_id(execution.execution_id);

                if let Err(e) = self.store.record_completion(write).await {
                    let detail = format!("manifest write failed: {e}");
                    self.record_failure(&partition, ErrorCategory::Internal, &detail)
                        .await;
                    return PartitionOutcome {
                        phase: PhaseKind::Ingest,
                        partition,
                        outcome: OutcomeKind::Failed,
                        detail: Some(detail),
                        capture_id: None,
                        row_count: None,
                    };
                }

                PartitionOutcome {
                    phase: PhaseKind::Ingest,
                    partition,
                    outcome: OutcomeKind::Succeeded,
                    detail: None,
                    capture_id: Some(cid),
                    row_count: Some(row_count),
                }
            }
            Err(e) => {
                let detail = e.to_string();
                self.record_failure(&partition, e.category(), &detail).await;
                PartitionOutcome {
                    phase: PhaseKind::Ingest,
                    partition,
                    outcome: OutcomeKind::Failed,
                    detail: Some(detail),
                    capture_id: None,
                    row_count: None,
                }
            }
        }
    }

    async fn record_failure(
        &self,
        partition: &PartitionKey,
        category: ErrorCategory,
        message: &str,
    ) {
        let anomaly = NewAnomaly::error(
            self.config.domain.clone(),
            partition.clone(),
            category,
            message,
        );
        if let Err(e) = self.store.record_anomaly(anomaly).await {
            warn!("anomaly write failed: {e}");
        }
    }
}
