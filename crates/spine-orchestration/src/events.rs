//! Structured step events emitted by the workflow runner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEventKind {
    Started,
    Completed,
    Failed,
    Skipped,
}

/// One lifecycle event of one step in one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub run_id: Uuid,
    pub workflow: String,
    pub step: String,
    pub kind: StepEventKind,
    pub at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
}

impl StepEvent {
    pub fn now(
        run_id: Uuid,
        workflow: &str,
        step: &str,
        kind: StepEventKind,
        duration_ms: Option<u64>,
    ) -> Self {
        Self {
            run_id,
            workflow: workflow.to_string(),
            step: step.to_string(),
            kind,
            at: Utc::now(),
            duration_ms,
        }
    }
}
