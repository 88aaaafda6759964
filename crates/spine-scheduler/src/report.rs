//! Schedule report: per-partition outcomes, phase summaries, exit codes

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use spine_core::partition::PartitionKey;

/// Phase a partition outcome belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Ingest,
    Normalize,
    Calc,
    Readiness,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Normalize => "normalize",
            Self::Calc => "calc",
            Self::Readiness => "readiness",
        }
    }
}

/// How one partition fared in one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    /// Revision detection found identical content; nothing written
    Unchanged,
    /// Not attempted (missing upstream stage, fail-fast abort)
    Skipped,
    Failed,
    /// Dry-run mode: would have run
    DryRun,
}

/// One (phase, partition) outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionOutcome {
    pub phase: PhaseKind,
    pub partition: PartitionKey,
    pub outcome: OutcomeKind,
    pub detail: Option<String>,
    pub capture_id: Option<String>,
    pub row_count: Option<u64>,
}

/// Counts for one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub succeeded: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub dry_run: usize,
}

impl PhaseSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.unchanged + self.skipped + self.failed + self.dry_run
    }
}

/// Result of one scheduler sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub domain: String,
    pub batch_id: String,
    pub weeks: Vec<NaiveDate>,
    pub outcomes: Vec<PartitionOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScheduleReport {
    pub fn new(domain: impl Into<String>, batch_id: impl Into<String>, weeks: Vec<NaiveDate>) -> Self {
        Self {
            domain: domain.into(),
            batch_id: batch_id.into(),
            weeks,
            outcomes: vec![],
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record(&mut self, outcome: PartitionOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn summary(&self, phase: PhaseKind) -> PhaseSummary {
        let mut summary = PhaseSummary::default();
        for outcome in self.outcomes.iter().filter(|o| o.phase == phase) {
            match outcome.outcome {
                OutcomeKind::Succeeded => summary.succeeded += 1,
                OutcomeKind::Unchanged => summary.unchanged += 1,
                OutcomeKind::Skipped => summary.skipped += 1,
                OutcomeKind::Failed => summary.failed += 1,
                OutcomeKind::DryRun => summary.dry_run += 1,
            }
        }
        summary
    }

    fn healthy_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.outcome,
                    OutcomeKind::Succeeded | OutcomeKind::Unchanged | OutcomeKind::DryRun
                )
            })
            .count()
    }

    fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == OutcomeKind::Failed)
            .count()
    }

    /// Exit-code contract: 0 all healthy, 1 partial failure, 2 all failed
    pub fn exit_code(&self) -> i32 {
        let failed = self.failed_count();
        if failed == 0 {
            0
        } else if self.healthy_count() > 0 {
            1
        } else {
            2
        }
    }

    /// Human-readable summary table
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "domain: {}  batch: {}  weeks: {}\n",
            self.domain,
            self.batch_id,
            self.weeks.len()
        ));
        out.push_str("phase       ok  unchanged  skipped  failed  dry-run\n");
        for phase in [
            PhaseKind::Ingest,
            PhaseKind::Normalize,
            PhaseKind::Calc,
            PhaseKind::Readiness,
        ] {
            let s = self.summary(phase);
            if s.total() == 0 {
                continue;
            }
            out.push_str(&format!(
                "{:<10} {:>3}  {:>9}  {:>7}  {:>6}  {:>7}\n",
                phase.as_str(),
                s.succeeded,
                s.unchanged,
                s.skipped,
                s.failed,
                s.dry_run
            ));
        }
        for outcome in self.outcomes.iter().filter(|o| o.outcome == OutcomeKind::Failed) {
            out.push_str(&format!(
                "FAILED {} {}: {} (see core_anomalies)\n",
                outcome.phase.as_str(),
                outcome.partition,
                outcome.detail.as_deref().unwrap_or("unknown error"),
            ));
        }
        out
    }

    /// JSON rendering for `--json` output
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "domain": self.domain,
            "batch_id": self.batch_id,
            "weeks": self.weeks,
            "exit_code": self.exit_code(),
            "phases": {
                "ingest": self.summary(PhaseKind::Ingest),
                "normalize": self.summary(PhaseKind::Normalize),
                "calc": self.summary(PhaseKind::Calc),
                "readiness": self.summary(PhaseKind::Readiness),
            },
            "outcomes": self.outcomes,
        })
    }
}
