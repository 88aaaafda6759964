//! Execution identity and tracing for a single pipeline run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What initiated an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Cli,
    Api,
    Scheduler,
    Backfill,
    Test,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "cli"),
            Self::Api => write!(f, "api"),
            Self::Scheduler => write!(f, "scheduler"),
            Self::Backfill => write!(f, "backfill"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Execution lane, used by the work queue to segregate traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    #[default]
    Normal,
    Backfill,
    Slow,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Backfill => "backfill",
            Self::Slow => "slow",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "backfill" => Ok(Self::Backfill),
            "slow" => Ok(Self::Slow),
            other => Err(format!("unknown lane: {other}")),
        }
    }
}

/// Mint a new batch id with a human-readable prefix
///
/// UUID v7 keeps batch ids sortable by creation time.
pub fn new_batch_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7().simple())
}

/// Identity of a single pipeline run
///
/// Immutable after creation. Related executions (a group run, a scheduler
/// sweep) share a `batch_id`; [`ExecutionContext::child`] mints a fresh
/// execution id under the same batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub batch_id: String,
    pub trigger_source: TriggerSource,
    pub lane: Lane,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Create a context with a fresh execution id and batch id
    pub fn new(trigger_source: TriggerSource) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            batch_id: new_batch_id("batch"),
            trigger_source,
            lane: Lane::Normal,
            started_at: Utc::now(),
        }
    }

    /// Replace the batch id (used when joining an existing batch)
    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = batch_id.into();
        self
    }

    /// Set the execution lane
    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    /// Derive a child context: new execution id, same batch
    pub fn child(&self) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            batch_id: self.batch_id.clone(),
            trigger_source: self.trigger_source,
            lane: self.lane,
            started_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits_batch() {
        let ctx = ExecutionContext::new(TriggerSource::Scheduler);
        let child = ctx.child();

        assert_eq!(child.batch_id, ctx.batch_id);
        assert_ne!(child.execution_id, ctx.execution_id);
        assert_eq!(child.trigger_source, TriggerSource::Scheduler);
    }

    #[test]
    fn test_batch_id_prefix() {
        let id = new_batch_id("group_weekly");
        assert!(id.starts_with("group_weekly_"));
    }

    #[test]
    fn test_lane_round_trip() {
        for lane in [Lane::Normal, Lane::Backfill, Lane::Slow] {
            let parsed: Lane = lane.as_str().parse().unwrap();
            assert_eq!(parsed, lane);
        }
    }
}
