//! Multi-week, revision-aware scheduler
//!
//! One sweep covers the last N period-ends (or an explicit week list) and
//! drives each (week, tier) partition through ingest -> normalize -> calc,
//! then evaluates readiness per week. Revision detection compares the
//! source content hash against the stored hash on the latest RAW manifest;
//! unchanged partitions are skipped unless forced. Partition failures are
//! isolated: the error lands in core_anomalies and the sweep moves on.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, instrument, warn};

use spine_core::capture::{capture_id, content_hash};
use spine_core::context::{new_batch_id, TriggerSource};
use spine_core::dispatcher::Dispatcher;
use spine_core::error::ErrorCategory;
use spine_core::params::{keys, Params};
use spine_core::partition::{dims, PartitionKey};
use spine_core::pipeline::PipelineStatus;
use spine_core::quality::QualityReport;
use spine_core::stage;
use spine_core::strategy::{PeriodStrategy, SourceRegistry, SourceStrategy};
use spine_storage::{
    AnomalyFilter, ManifestWrite, NewAnomaly, QualityEntry, ReadinessEntry, Severity,
    SpineStore, StoreError,
};

use crate::report::{OutcomeKind, PartitionOutcome, PhaseKind, ScheduleReport};

/// Errors that abort a whole sweep (partition failures do not)
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// Invalid configuration: bad weeks, no tiers, unregistered pipelines
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run for real or report what would run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Run,
    DryRun,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Self::Run),
            "dry-run" => Ok(Self::DryRun),
            other => Err(format!("unknown mode: {other} (expected run|dry-run)")),
        }
    }
}

/// Restrict a sweep to one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagePhase {
    Ingest,
    Normalize,
    Calc,
    #[default]
    All,
}

impl StagePhase {
    fn includes(&self, phase: PhaseKind) -> bool {
        match self {
            Self::All => true,
            Self::Ingest => phase == PhaseKind::Ingest,
            Self::Normalize => phase == PhaseKind::Normalize,
            Self::Calc => phase == PhaseKind::Calc,
        }
    }
}

impl FromStr for StagePhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(Self::Ingest),
            "normalize" => Ok(Self::Normalize),
            "calc" => Ok(Self::Calc),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown stage: {other} (expected ingest|normalize|calc|all)"
            )),
        }
    }
}

/// The registered pipelines a weekly domain sweep drives
#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyPipelines {
    pub ingest: String,
    pub normalize: String,
    pub calcs: Vec<String>,
}

/// Sweep configuration
#[derive(Debug, Clone)]
pub struct WeeklyScheduleConfig {
    pub domain: String,
    pub lookback_weeks: usize,
    /// Explicit week list; used verbatim when present
    pub weeks: Option<Vec<NaiveDate>>,
    pub tiers: Vec<String>,
    /// Key into the domain's source registry (e.g. "file", "api")
    pub source_key: String,
    pub mode: RunMode,
    pub force: bool,
    pub only_stage: StagePhase,
    pub fail_fast: bool,
    /// Capture date; defaults to today UTC. Injectable for determinism.
    pub as_of: Option<NaiveDate>,
    pub pipelines: WeeklyPipelines,
}

impl WeeklyScheduleConfig {
    pub fn new(domain: impl Into<String>, pipelines: WeeklyPipelines) -> Self {
        Self {
            domain: domain.into(),
            lookback_weeks: 4,
            weeks: None,
            tiers: vec![],
            source_key: "api".to_string(),
            mode: RunMode::Run,
            force: false,
            only_stage: StagePhase::All,
            fail_fast: false,
            as_of: None,
            pipelines,
        }
    }
}

/// Drives phased multi-week sweeps for one domain
pub struct WeeklyScheduler {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn SpineStore>,
    sources: Arc<SourceRegistry>,
    period: Arc<dyn PeriodStrategy>,
    config: WeeklyScheduleConfig,
}

impl WeeklyScheduler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn SpineStore>,
        sources: Arc<SourceRegistry>,
        period: Arc<dyn PeriodStrategy>,
        config: WeeklyScheduleConfig,
    ) -> Self {
        Self {
            dispatcher,
            store,
            sources,
            period,
            config,
        }
    }

    /// Run one sweep: target selection, ingest, normalize, calc, readiness
    #[instrument(skip(self), fields(domain = %self.config.domain))]
    pub async fn run(&self) -> Result<ScheduleReport, ScheduleError> {
        let cfg = &self.config;
        let as_of = cfg.as_of.unwrap_or_else(|| Utc::now().date_naive());

        // Phase 0: target selection
        if cfg.tiers.is_empty() {
            return Err(ScheduleError::Configuration(
                "at least one tier is required".to_string(),
            ));
        }
        let weeks = match &cfg.weeks {
            Some(weeks) => {
                for week in weeks {
                    self.period
                        .validate(*week)
                        .map_err(|e| ScheduleError::Configuration(e.to_string()))?;
                }
                weeks.clone()
            }
            None => {
                if cfg.lookback_weeks == 0 {
                    return Err(ScheduleError::Configuration(
                        "lookback window must be at least 1 week".to_string(),
                    ));
                }
                self.period.recent_period_ends(as_of, cfg.lookback_weeks)
            }
        };

        self.check_registrations()?;
        let source = if cfg.only_stage.includes(PhaseKind::Ingest) {
            Some(self.sources.get(&cfg.source_key).map_err(|e| {
                ScheduleError::Configuration(format!("source '{}': {e}", cfg.source_key))
            })?)
        } else {
            None
        };

        let batch_id = new_batch_id(&format!("sweep_{}", cfg.domain));
        let mut report = ScheduleReport::new(cfg.domain.clone(), batch_id.clone(), weeks.clone());
        info!(weeks = weeks.len(), tiers = cfg.tiers.len(), %as_of, "sweep started");

        let mut aborted = false;

        // Phase 1: ingest with revision detection
        if let Some(source) = &source {
            'ingest: for week in &weeks {
                for tier in &cfg.tiers {
                    let outcome = self
                        .ingest_partition(source, *week, tier, as_of, &batch_id)
                        .await;
                    let failed = outcome.outcome == OutcomeKind::Failed;
                    report.record(outcome);
                    if failed && cfg.fail_fast {
                        warn!("fail-fast: aborting sweep after ingest failure");
                        aborted = true;
                        break 'ingest;
                    }
                }
            }
        }

        // Phase 2: normalize every partition that has RAW
        if !aborted && cfg.only_stage.includes(PhaseKind::Normalize) {
            'normalize: for week in &weeks {
                for tier in &cfg.tiers {
                    let outcome = self.normalize_partition(*week, tier, &batch_id).await;
                    let failed = outcome.outcome == OutcomeKind::Failed;
                    report.record(outcome);
                    if failed && cfg.fail_fast {
                        aborted = true;
                        break 'normalize;
                    }
                }
            }
        }

        // Phase 3: calc per week, gated on tier completeness
        if !aborted && cfg.only_stage.includes(PhaseKind::Calc) {
            'calc: for week in &weeks {
                for outcome in self.calc_week(*week, as_of, &batch_id).await {
                    let failed = outcome.outcome == OutcomeKind::Failed;
                    report.record(outcome);
                    if failed && cfg.fail_fast {
                        aborted = true;
                        break 'calc;
                    }
                }
            }
        }

        // Phase 4: readiness (full sweeps only)
        if !aborted && cfg.only_stage == StagePhase::All {
            for week in &weeks {
                let outcome = self.evaluate_readiness(*week).await;
                report.record(outcome);
            }
        }

        report.finish();
        info!(exit_code = report.exit_code(), "sweep finished");
        Ok(report)
    }

    fn check_registrations(&self) -> Result<(), ScheduleError> {
        let cfg = &self.config;
        let registry = self.dispatcher.registry();
        let mut required: Vec<&str> = Vec::new();
        if cfg.only_stage.includes(PhaseKind::Ingest) {
            required.push(&cfg.pipelines.ingest);
        }
        if cfg.only_stage.includes(PhaseKind::Normalize) {
            required.push(&cfg.pipelines.normalize);
        }
        if cfg.only_stage.includes(PhaseKind::Calc) {
            required.extend(cfg.pipelines.calcs.iter().map(String::as_str));
        }
        for name in required {
            if !registry.contains(name) {
                return Err(ScheduleError::Configuration(format!(
                    "pipeline '{name}' is not registered"
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Phase 1: ingest
    // =========================================================================

    async fn ingest_partition(
        &self,
        source: &Arc<dyn SourceStrategy>,
        week: NaiveDate,
        tier: &str,
        as_of: NaiveDate,
        batch_id: &str,
    ) -> PartitionOutcome {
        let cfg = &self.config;
        let partition = PartitionKey::week_tier(week, tier);

        let payload = match source.fetch(&partition).await {
            Ok(payload) => payload,
            Err(e) => {
                let detail = format!("source fetch failed: {e}");
                self.record_failure(&partition, e.category(), &detail).await;
                return self.outcome(PhaseKind::Ingest, partition, OutcomeKind::Failed, detail);
            }
        };
        let hash = content_hash(&payload.content);

        // Revision detection against the latest RAW capture
        if !cfg.force {
            if let Ok(Some(entry)) = self
                .store
                .query_manifest(&cfg.domain, &partition, Some(stage::RAW))
                .await
            {
                if entry.content_hash.as_deref() == Some(hash.as_str()) {
                    info!(%partition, "content unchanged; skipping");
                    return self.outcome(
                        PhaseKind::Ingest,
                        partition,
                        OutcomeKind::Unchanged,
                        format!("content hash {hash} unchanged"),
                    );
                }
            }
        }

        let cid = capture_id(&cfg.domain, &partition, as_of);
        if cfg.mode == RunMode::DryRun {
            return PartitionOutcome {
                phase: PhaseKind::Ingest,
                partition,
                outcome: OutcomeKind::DryRun,
                detail: Some("would ingest".to_string()),
                capture_id: Some(cid),
                row_count: None,
            };
        }

        let mut params = Params::new()
            .with(keys::WEEK_ENDING, week.format("%Y-%m-%d").to_string())
            .with(keys::TIER, tier)
            .with(keys::CAPTURE_ID, cid.clone())
            .with(keys::CONTENT_HASH, hash.clone())
            .with(keys::FORCE, cfg.force);
        if let Some(path) = payload.metadata.get(keys::FILE_PATH) {
            params.set(keys::FILE_PATH, path.clone());
        }

        let submitted = self
            .dispatcher
            .submit(
                &cfg.pipelines.ingest,
                params,
                TriggerSource::Scheduler,
                Some(batch_id.to_string()),
            )
            .await;

        let execution = match submitted {
            Ok(execution) => execution,
            Err(e) => {
                let detail = e.to_string();
                self.record_failure(&partition, e.category(), &detail).await;
                return self.outcome(PhaseKind::Ingest, partition, OutcomeKind::Failed, detail);
            }
        };

        match execution.status {
            PipelineStatus::Failed => {
                let detail = execution
                    .result
                    .error
                    .unwrap_or_else(|| "ingest failed".to_string());
                let category = execution
                    .result
                    .error_category
                    .unwrap_or(ErrorCategory::Internal);
                self.record_failure(&partition, category, &detail).await;
                self.outcome(PhaseKind::Ingest, partition, OutcomeKind::Failed, detail)
            }
            PipelineStatus::Skipped => self.outcome(
                PhaseKind::Ingest,
                partition,
                OutcomeKind::Unchanged,
                "pipeline skipped".to_string(),
            ),
            PipelineStatus::Completed => {
                let row_count = execution.result.row_count.unwrap_or(0);
                let write = ManifestWrite::new(
                    &cfg.domain,
                    &cfg.pipelines.ingest,
                    partition.clone(),
                    stage::RAW,
                    cid.clone(),
                    row_count,
                )
                .with_content_hash(hash)
                .with_execution_id(execution.execution_id);

                if let Err(e) = self.store.record_completion(write).await {
                    let detail = format!("manifest write failed: {e}");
                    self.record_failure(&partition, ErrorCategory::Internal, &detail)
                        .await;
                    return self.outcome(
                        PhaseKind::Ingest,
                        partition,
                        OutcomeKind::Failed,
                        detail,
                    );
                }

                let quality = execution
                    .result
                    .quality
                    .unwrap_or_else(|| QualityReport::passing(row_count));
                if let Err(e) = self
                    .store
                    .record_quality(QualityEntry {
                        domain: cfg.domain.clone(),
                        pipeline: cfg.pipelines.ingest.clone(),
                        partition: partition.clone(),
                        stage: stage::RAW.to_string(),
                        capture_id: cid.clone(),
                        report: quality,
                        recorded_at: Utc::now(),
                    })
                    .await
                {
                    warn!("quality write failed: {e}");
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
        }
    }

    // =========================================================================
    // Phase 2: normalize
    // =========================================================================

    async fn normalize_partition(
        &self,
        week: NaiveDate,
        tier: &str,
        batch_id: &str,
    ) -> PartitionOutcome {
        let cfg = &self.config;
        let partition = PartitionKey::week_tier(week, tier);

        let raw = match self
            .store
            .query_manifest(&cfg.domain, &partition, Some(stage::RAW))
            .await
        {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return self.outcome(
                    PhaseKind::Normalize,
                    partition,
                    OutcomeKind::Skipped,
                    "no RAW manifest; run ingest first".to_string(),
                )
            }
            Err(e) => {
                let detail = format!("manifest query failed: {e}");
                self.record_failure(&partition, ErrorCategory::Internal, &detail)
                    .await;
                return self.outcome(
                    PhaseKind::Normalize,
                    partition,
                    OutcomeKind::Failed,
                    detail,
                );
            }
        };

        if cfg.mode == RunMode::DryRun {
            return PartitionOutcome {
                phase: PhaseKind::Normalize,
                partition,
                outcome: OutcomeKind::DryRun,
                detail: Some("would normalize".to_string()),
                capture_id: Some(raw.capture_id),
                row_count: None,
            };
        }

        let params = Params::new()
            .with(keys::WEEK_ENDING, week.format("%Y-%m-%d").to_string())
            .with(keys::TIER, tier)
            .with(keys::CAPTURE_ID, raw.capture_id.clone());

        let submitted = self
            .dispatcher
            .submit(
                &cfg.pipelines.normalize,
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
                    .unwrap_or_else(|| "normalize failed".to_string());
                let category = execution
                    .result
                    .error_category
                    .unwrap_or(ErrorCategory::Internal);
                self.record_failure(&partition, category, &detail).await;
                self.outcome(PhaseKind::Normalize, partition, OutcomeKind::Failed, detail)
            }
            Ok(execution) => {
                let row_count = execution.result.row_count.unwrap_or(raw.row_count);
                let write = ManifestWrite::new(
                    &cfg.domain,
                    &cfg.pipelines.normalize,
                    partition.clone(),
                    stage::NORMALIZED,
                    raw.capture_id.clone(),
                    row_count,
                )
                .with_execution_id(execution.execution_id);

                match self.store.record_completion(write).await {
                    Ok(()) => PartitionOutcome {
                        phase: PhaseKind::Normalize,
                        partition,
                        outcome: OutcomeKind::Succeeded,
                        detail: None,
                        capture_id: Some(raw.capture_id),
                        row_count: Some(row_count),
                    },
                    Err(e) => {
                        let detail = format!("manifest write failed: {e}");
                        self.record_failure(&partition, ErrorCategory::Internal, &detail)
                            .await;
                        self.outcome(
                            PhaseKind::Normalize,
                            partition,
                            OutcomeKind::Failed,
                            detail,
                        )
                    }
                }
            }
            Err(e) => {
                let detail = e.to_string();
                self.record_failure(&partition, e.category(), &detail).await;
                self.outcome(PhaseKind::Normalize, partition, OutcomeKind::Failed, detail)
            }
        }
    }

    // =========================================================================
    // Phase 3: calc
    // =========================================================================

    async fn calc_week(
        &self,
        week: NaiveDate,
        as_of: NaiveDate,
        batch_id: &str,
    ) -> Vec<PartitionOutcome> {
        let cfg = &self.config;
        let week_partition =
            PartitionKey::new().with(dims::WEEK_ENDING, week.format("%Y-%m-%d").to_string());

        // Tier completeness gate
        let mut missing = Vec::new();
        for tier in &cfg.tiers {
            let partition = PartitionKey::week_tier(week, tier);
            match self
                .store
                .query_manifest(&cfg.domain, &partition, Some(stage::NORMALIZED))
                .await
            {
                Ok(Some(_)) => {}
                _ => missing.push(tier.clone()),
            }
        }
        if !missing.is_empty() {
            return vec![self.outcome(
                PhaseKind::Calc,
                week_partition,
                OutcomeKind::Skipped,
                format!("missing NORMALIZED for tiers: {}", missing.join(", ")),
            )];
        }

        let mut outcomes = Vec::new();
        for calc in &cfg.pipelines.calcs {
            if cfg.mode == RunMode::DryRun {
                outcomes.push(PartitionOutcome {
                    phase: PhaseKind::Calc,
                    partition: week_partition.clone(),
                    outcome: OutcomeKind::DryRun,
                    detail: Some(format!("would run {calc}")),
                    capture_id: None,
                    row_count: None,
                });
                continue;
            }

            let params = Params::new()
                .with(keys::WEEK_ENDING, week.format("%Y-%m-%d").to_string());

            let submitted = self
                .dispatcher
                .submit(calc, params, TriggerSource::Scheduler, Some(batch_id.to_string()))
                .await;

            let outcome = match submitted {
                Ok(execution) if execution.status == PipelineStatus::Failed => {
                    let detail = execution
                        .result
                        .error
                        .unwrap_or_else(|| format!("{calc} failed"));
                    let category = execution
                        .result
                        .error_category
                        .unwrap_or(ErrorCategory::Internal);
                    self.record_failure(&week_partition, category, &detail).await;
                    self.outcome(
                        PhaseKind::Calc,
                        week_partition.clone(),
                        OutcomeKind::Failed,
                        detail,
                    )
                }
                Ok(execution) => {
                    let cid = capture_id(&cfg.domain, &week_partition, as_of);
                    let row_count = execution.result.row_count.unwrap_or(0);
                    let write = ManifestWrite::new(
                        &cfg.domain,
                        calc,
                        week_partition.clone(),
                        stage::COMPUTED,
                        cid.clone(),
                        row_count,
                    )
                    .with_execution_id(execution.execution_id);

                    match self.store.record_completion(write).await {
                        Ok(()) => PartitionOutcome {
                            phase: PhaseKind::Calc,
                            partition: week_partition.clone(),
                            outcome: OutcomeKind::Succeeded,
                            detail: Some(calc.clone()),
                            capture_id: Some(cid),
                            row_count: Some(row_count),
                        },
                        Err(e) => {
                            let detail = format!("manifest write failed: {e}");
                            self.record_failure(&week_partition, ErrorCategory::Internal, &detail)
                                .await;
                            self.outcome(
                                PhaseKind::Calc,
                                week_partition.clone(),
                                OutcomeKind::Failed,
                                detail,
                            )
                        }
                    }
                }
                Err(e) => {
                    let detail = e.to_string();
                    self.record_failure(&week_partition, e.category(), &detail).await;
                    self.outcome(
                        PhaseKind::Calc,
                        week_partition.clone(),
                        OutcomeKind::Failed,
                        detail,
                    )
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    // =========================================================================
    // Phase 4: readiness
    // =========================================================================

    async fn evaluate_readiness(&self, week: NaiveDate) -> PartitionOutcome {
        let cfg = &self.config;
        let week_partition =
            PartitionKey::new().with(dims::WEEK_ENDING, week.format("%Y-%m-%d").to_string());
        let mut issues = Vec::new();

        for tier in &cfg.tiers {
            let partition = PartitionKey::week_tier(week, tier);
            for stage_name in [stage::RAW, stage::NORMALIZED] {
                let present = matches!(
                    self.store
                        .query_manifest(&cfg.domain, &partition, Some(stage_name))
                        .await,
                    Ok(Some(_))
                );
                if !present {
                    issues.push(format!("missing {stage_name} for tier {tier}"));
                }
            }
        }
        for calc in &cfg.pipelines.calcs {
            let present = matches!(
                self.store
                    .latest_capture(&cfg.domain, calc, &week_partition)
                    .await,
                Ok(Some(_))
            );
            if !present {
                issues.push(format!("missing COMPUTED output from {calc}"));
            }
        }

        // Unresolved blocking anomalies for this week
        if let Ok(anomalies) = self
            .store
            .list_anomalies(AnomalyFilter {
                domain: Some(cfg.domain.clone()),
                partition: None,
                unresolved_only: true,
                min_severity: Some(Severity::Error),
            })
            .await
        {
            let week_str = week.format("%Y-%m-%d").to_string();
            for anomaly in anomalies {
                let matches_week = anomaly
                    .partition
                    .as_ref()
                    .and_then(|p| p.get(dims::WEEK_ENDING))
                    .map_or(false, |w| w == week_str);
                if matches_week {
                    issues.push(format!("unresolved anomaly: {}", anomaly.message));
                }
            }
        }

        let is_ready = issues.is_empty();
        if cfg.mode == RunMode::DryRun {
            return PartitionOutcome {
                phase: PhaseKind::Readiness,
                partition: week_partition,
                outcome: OutcomeKind::DryRun,
                detail: Some(format!("would mark ready={is_ready}")),
                capture_id: None,
                row_count: None,
            };
        }

        let entry = ReadinessEntry {
            domain: cfg.domain.clone(),
            partition: week_partition.clone(),
            is_ready,
            blocking_issues: issues.clone(),
            evaluated_at: Utc::now(),
        };
        match self.store.set_readiness(entry).await {
            Ok(()) => self.outcome(
                PhaseKind::Readiness,
                week_partition,
                OutcomeKind::Succeeded,
                if is_ready {
                    "ready".to_string()
                } else {
                    format!("blocked: {}", issues.join("; "))
                },
            ),
            Err(e) => self.outcome(
                PhaseKind::Readiness,
                week_partition,
                OutcomeKind::Failed,
                format!("readiness write failed: {e}"),
            ),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn outcome(
        &self,
        phase: PhaseKind,
        partition: PartitionKey,
        outcome: OutcomeKind,
        detail: String,
    ) -> PartitionOutcome {
        PartitionOutcome {
            phase,
            partition,
            outcome,
            detail: Some(detail),
            capture_id: None,
            row_count: None,
        }
    }

    async fn record_failure(
        &self,
        partition: &PartitionKey,
        category: ErrorCategory,
        message: &str,
    ) {
        warn!(%partition, category = category.as_str(), message, "partition failed");
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
