//! SpineStore trait definition
//!
//! The core's only dependency on a storage backend. Implementations must be
//! thread-safe; every operation is transactional per call. Concrete engines
//! (SQLite file, in-memory) are interchangeable behind this trait.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use spine_core::error::ErrorCategory;
use spine_core::params::Params;
use spine_core::partition::PartitionKey;
use spine_core::quality::QualityReport;
use spine_core::stage::stage_rank;
use spine_core::Lane;

/// Default retry backoff base: attempt N waits `base * 3^(N-1)`
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(5 * 60);

/// Default maximum delivery attempts per work item
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default threshold after which a RUNNING lock is considered abandoned
pub const DEFAULT_STALE_LOCK: Duration = Duration::from_secs(30 * 60);

/// Backoff before the Nth re-attempt (1-based attempt that just failed)
pub fn retry_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    RETRY_BACKOFF_BASE * 3u32.pow(exponent)
}

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Work item not found
    #[error("work item not found: {0}")]
    WorkItemNotFound(Uuid),

    /// Enqueue of an already-queued (domain, pipeline, partition)
    #[error("duplicate work item: {domain}/{pipeline} {partition}")]
    DuplicateWorkItem {
        domain: String,
        pipeline: String,
        partition: String,
    },

    /// Operation not valid for the item's current state
    #[error("invalid transition: cannot {action} item in state {state}")]
    InvalidTransition {
        action: &'static str,
        state: WorkItemState,
    },

    /// Anomaly not found
    #[error("anomaly not found: {0}")]
    AnomalyNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

// =============================================================================
// Manifest
// =============================================================================

/// Durable record that a partition reached a stage under a capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub domain: String,
    pub pipeline: String,
    pub partition: PartitionKey,
    pub stage: String,
    pub stage_rank: i64,
    pub capture_id: String,
    pub row_count: u64,
    /// Source content hash, when the writer computed one (revision detection)
    pub content_hash: Option<String>,
    pub execution_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// Input to `record_completion`; the store stamps rank and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestWrite {
    pub domain: String,
    pub pipeline: String,
    pub partition: PartitionKey,
    pub stage: String,
    pub capture_id: String,
    pub row_count: u64,
    pub content_hash: Option<String>,
    pub execution_id: Option<Uuid>,
}

impl ManifestWrite {
    pub fn new(
        domain: impl Into<String>,
        pipeline: impl Into<String>,
        partition: PartitionKey,
        stage: impl Into<String>,
        capture_id: impl Into<String>,
        row_count: u64,
    ) -> Self {
        Self {
            domain: domain.into(),
            pipeline: pipeline.into(),
            partition,
            stage: stage.into(),
            capture_id: capture_id.into(),
            row_count,
            content_hash: None,
            execution_id: None,
        }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub(crate) fn into_entry(self, now: DateTime<Utc>) -> ManifestEntry {
        ManifestEntry {
            stage_rank: stage_rank(&self.stage),
            domain: self.domain,
            pipeline: self.pipeline,
            partition: self.partition,
            stage: self.stage,
            capture_id: self.capture_id,
            row_count: self.row_count,
            content_hash: self.content_hash,
            execution_id: self.execution_id,
            updated_at: now,
        }
    }
}

// =============================================================================
// Quality, rejects, anomalies, readiness
// =============================================================================

/// Per-(partition, stage, capture) quality record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityEntry {
    pub domain: String,
    pub pipeline: String,
    pub partition: PartitionKey,
    pub stage: String,
    pub capture_id: String,
    pub report: QualityReport,
    pub recorded_at: DateTime<Utc>,
}

/// A record that failed validation, kept with its reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectEntry {
    pub domain: String,
    pub pipeline: String,
    pub partition: PartitionKey,
    pub capture_id: String,
    pub row: Value,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}

/// Incident severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Partition-level incident (ingest failure, source 5xx, schema drift)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEntry {
    pub id: Uuid,
    pub domain: String,
    pub partition: Option<PartitionKey>,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub message: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Input to `record_anomaly`
#[derive(Debug, Clone, PartialEq)]
pub struct NewAnomaly {
    pub domain: String,
    pub partition: Option<PartitionKey>,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub message: String,
}

impl NewAnomaly {
    pub fn error(
        domain: impl Into<String>,
        partition: PartitionKey,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            partition: Some(partition),
            severity: Severity::Error,
            category,
            message: message.into(),
        }
    }
}

/// Filter for listing anomalies
#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub domain: Option<String>,
    pub partition: Option<PartitionKey>,
    pub unresolved_only: bool,
    pub min_severity: Option<Severity>,
}

/// The scheduler's final judgment on whether a partition may be consumed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessEntry {
    pub domain: String,
    pub partition: PartitionKey,
    pub is_ready: bool,
    pub blocking_issues: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

// =============================================================================
// Work queue
// =============================================================================

/// Work item state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Pending,
    Running,
    RetryWait,
    Failed,
    Complete,
    Cancelled,
}

impl WorkItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::RetryWait => "retry_wait",
            Self::Failed => "failed",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the item has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Complete | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "retry_wait" => Ok(Self::RetryWait),
            "failed" => Ok(Self::Failed),
            "complete" => Ok(Self::Complete),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown work item state: {other}")),
        }
    }
}

/// Definition of a work item to be enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkItem {
    pub domain: String,
    pub pipeline: String,
    pub partition: PartitionKey,
    pub params: Params,
    pub priority: i32,
    pub lane: Lane,
    pub max_attempts: u32,
    pub desired_at: Option<DateTime<Utc>>,
}

impl NewWorkItem {
    pub fn new(
        domain: impl Into<String>,
        pipeline: impl Into<String>,
        partition: PartitionKey,
    ) -> Self {
        Self {
            domain: domain.into(),
            pipeline: pipeline.into(),
            partition,
            params: Params::new(),
            priority: 0,
            lane: Lane::Normal,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            desired_at: None,
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_desired_at(mut self, at: DateTime<Utc>) -> Self {
        self.desired_at = Some(at);
        self
    }
}

/// A durable request that a (domain, pipeline, partition) be run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub domain: String,
    pub pipeline: String,
    pub partition: PartitionKey,
    pub params: Params,
    pub priority: i32,
    pub lane: Lane,
    pub state: WorkItemState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub current_execution_id: Option<Uuid>,
    pub desired_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filter for listing work items
#[derive(Debug, Clone, Default)]
pub struct WorkItemFilter {
    pub domain: Option<String>,
    pub state: Option<WorkItemState>,
    pub lane: Option<Lane>,
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Serialized workflow state, one row per run, advancing as it progresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub run_id: Uuid,
    pub workflow_name: String,
    /// Last successfully completed step
    pub step_name: String,
    /// Serialized `WorkflowContext`, bit-exact with its serde form
    pub context_snapshot: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

// =============================================================================
// The trait
// =============================================================================

/// Durable coordination store for the pipeline framework
///
/// Implementations must be thread-safe and give single-reader-wins claim
/// semantics on the work queue.
#[async_trait]
pub trait SpineStore: Send + Sync + 'static {
    // =========================================================================
    // Manifest Operations
    // =========================================================================

    /// Upsert a manifest row keyed by (domain, pipeline, partition, stage,
    /// capture_id). Same key overwrites row_count/content_hash and advances
    /// updated_at; a new capture_id inserts a fresh row.
    async fn record_completion(&self, write: ManifestWrite) -> Result<(), StoreError>;

    /// Latest manifest row for a (domain, partition[, stage]); "latest" is
    /// the maximum capture_id, ties broken by updated_at.
    async fn query_manifest(
        &self,
        domain: &str,
        partition: &PartitionKey,
        stage: Option<&str>,
    ) -> Result<Option<ManifestEntry>, StoreError>;

    /// Maximum capture id recorded for a (domain, pipeline, partition)
    async fn latest_capture(
        &self,
        domain: &str,
        pipeline: &str,
        partition: &PartitionKey,
    ) -> Result<Option<String>, StoreError>;

    /// All manifest rows for a (domain, pipeline, partition), oldest first
    async fn manifest_history(
        &self,
        domain: &str,
        pipeline: &str,
        partition: &PartitionKey,
    ) -> Result<Vec<ManifestEntry>, StoreError>;

    // =========================================================================
    // Quality / Rejects / Anomalies / Readiness
    // =========================================================================

    async fn record_quality(&self, entry: QualityEntry) -> Result<(), StoreError>;

    /// Latest quality record for a (domain, partition, stage)
    async fn get_quality(
        &self,
        domain: &str,
        partition: &PartitionKey,
        stage: &str,
    ) -> Result<Option<QualityEntry>, StoreError>;

    /// Append rejected records (cumulative; never overwritten on replay)
    async fn record_rejects(&self, rejects: Vec<RejectEntry>) -> Result<(), StoreError>;

    async fn list_rejects(
        &self,
        domain: &str,
        partition: Option<&PartitionKey>,
        capture_id: Option<&str>,
    ) -> Result<Vec<RejectEntry>, StoreError>;

    /// Record a partition-level incident; returns its id
    async fn record_anomaly(&self, anomaly: NewAnomaly) -> Result<Uuid, StoreError>;

    async fn resolve_anomaly(&self, id: Uuid) -> Result<(), StoreError>;

    async fn list_anomalies(
        &self,
        filter: AnomalyFilter,
    ) -> Result<Vec<AnomalyEntry>, StoreError>;

    /// Upsert the readiness judgment for a partition
    async fn set_readiness(&self, entry: ReadinessEntry) -> Result<(), StoreError>;

    async fn get_readiness(
        &self,
        domain: &str,
        partition: &PartitionKey,
    ) -> Result<Option<ReadinessEntry>, StoreError>;

    // =========================================================================
    // Capture Rows (managed domain-output discipline)
    // =========================================================================

    /// Replace all rows of (dataset, partition, capture_id) in one
    /// transaction: delete matching rows, then insert the provided ones.
    /// Never touches rows under other capture ids.
    async fn replace_capture(
        &self,
        dataset: &str,
        partition: &PartitionKey,
        capture_id: &str,
        rows: &[Value],
    ) -> Result<u64, StoreError>;

    /// Rows stored under (dataset, partition, capture_id)
    async fn capture_rows(
        &self,
        dataset: &str,
        partition: &PartitionKey,
        capture_id: &str,
    ) -> Result<Vec<Value>, StoreError>;

    /// All capture ids present for (dataset, partition), ascending
    async fn dataset_captures(
        &self,
        dataset: &str,
        partition: &PartitionKey,
    ) -> Result<Vec<String>, StoreError>;

    // =========================================================================
    // Work Queue Operations
    // =========================================================================

    /// Enqueue a work item; duplicate (domain, pipeline, partition) is
    /// rejected atomically.
    async fn enqueue(&self, item: NewWorkItem) -> Result<Uuid, StoreError>;

    /// Atomically claim one eligible item (Pending and due, or RetryWait
    /// whose next_attempt_at has passed), transition it to Running, stamp
    /// the lock, and increment attempt_count. Priority descending, then
    /// desired_at ascending.
    async fn claim(
        &self,
        worker_id: &str,
        lanes: Option<&[Lane]>,
    ) -> Result<Option<WorkItem>, StoreError>;

    /// Record the execution currently serving a Running item
    async fn assign_execution(&self, id: Uuid, execution_id: Uuid) -> Result<(), StoreError>;

    /// Transition Running -> Complete
    async fn complete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Transition Running -> RetryWait (attempts remaining, backoff
    /// `base * 3^(N-1)`) or -> Failed (attempts exhausted). Returns the
    /// resulting state.
    async fn fail(&self, id: Uuid, error: &str) -> Result<WorkItemState, StoreError>;

    /// Manual retry: reset to Pending regardless of attempt count
    async fn retry(&self, id: Uuid) -> Result<(), StoreError>;

    /// Cancel a Pending or RetryWait item
    async fn cancel(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get_work_item(&self, id: Uuid) -> Result<WorkItem, StoreError>;

    async fn list_work_items(
        &self,
        filter: WorkItemFilter,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Return Running items whose lock is older than the threshold to
    /// Pending, clearing locked_by/locked_at/current_execution_id.
    async fn reap_stale(&self, stale_threshold: Duration) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Checkpoint Operations
    // =========================================================================

    /// Upsert the checkpoint for a run (one per run_id; advances in place)
    async fn save_checkpoint(&self, checkpoint: WorkflowCheckpoint) -> Result<(), StoreError>;

    async fn load_checkpoint(
        &self,
        run_id: Uuid,
    ) -> Result<Option<WorkflowCheckpoint>, StoreError>;

    async fn delete_checkpoint(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Delete checkpoints whose expires_at has passed; returns the count
    async fn sweep_expired_checkpoints(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_schedule() {
        assert_eq!(retry_backoff(1), Duration::from_secs(300));
        assert_eq!(retry_backoff(2), Duration::from_secs(900));
        assert_eq!(retry_backoff(3), Duration::from_secs(2700));
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            WorkItemState::Pending,
            WorkItemState::Running,
            WorkItemState::RetryWait,
            WorkItemState::Failed,
            WorkItemState::Complete,
            WorkItemState::Cancelled,
        ] {
            let parsed: WorkItemState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(WorkItemState::Complete.is_terminal());
        assert!(WorkItemState::Failed.is_terminal());
        assert!(WorkItemState::Cancelled.is_terminal());
        assert!(!WorkItemState::RetryWait.is_terminal());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warn);
        assert!(Severity::Warn > Severity::Info);
    }

    #[test]
    fn test_manifest_write_stamps_rank() {
        let write = ManifestWrite::new(
            "finra",
            "finra.ingest_week",
            PartitionKey::new().with("tier", "T1"),
            "RAW",
            "finra:{}:20250101",
            10,
        );
        let entry = write.into_entry(Utc::now());
        assert_eq!(entry.stage_rank, 10);
    }
}
