//! Step and workflow result envelopes
//!
//! Every step returns a [`StepResult`]; the runner never propagates errors
//! as control flow across step boundaries. `output` is published under the
//! step's name in `context.step_outputs`; `context_updates` merge into the
//! global params for later steps.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use spine_core::error::ErrorCategory;
use spine_core::quality::QualityReport;

use crate::context::WorkflowContext;

/// Universal envelope returned by every step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,

    /// Stored under the step's name in `context.step_outputs`
    pub output: Value,

    /// Merged into `context.params`, visible to all later steps
    #[serde(default)]
    pub context_updates: BTreeMap<String, Value>,

    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,

    pub quality: Option<QualityReport>,

    /// Free-form event notes attached to the step record
    #[serde(default)]
    pub events: Vec<String>,

    /// Jump target set by choice steps
    pub next_step: Option<String>,
}

impl StepResult {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            success: true,
            output: output.into(),
            context_updates: BTreeMap::new(),
            error: None,
            error_category: None,
            quality: None,
            events: vec![],
            next_step: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self::ok(Value::Null)
    }

    pub fn fail(error: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            success: false,
            output: Value::Null,
            context_updates: BTreeMap::new(),
            error: Some(error.into()),
            error_category: Some(category),
            quality: None,
            events: vec![],
            next_step: None,
        }
    }

    pub fn with_update(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context_updates.insert(key.into(), value.into());
        self
    }

    pub fn with_quality(mut self, quality: QualityReport) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.events.push(event.into());
        self
    }

    pub fn with_next_step(mut self, step: impl Into<String>) -> Self {
        self.next_step = Some(step.into());
        self
    }
}

/// Terminal status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Failed,
}

/// Result of running (or resuming) a workflow
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: WorkflowStatus,

    /// Final context after the last executed step
    pub context: WorkflowContext,

    /// Steps that completed, in completion order (includes steps completed
    /// before a resume)
    pub completed_steps: Vec<String>,

    /// Steps never executed (choice-skipped or abandoned after a failure)
    pub skipped_steps: Vec<String>,

    /// Steps that failed but were passed over by a Continue policy
    pub failed_steps: Vec<String>,

    /// Wall-clock duration of each executed step
    pub step_durations: BTreeMap<String, Duration>,

    /// Step lifecycle events in emission order
    pub events: Vec<crate::events::StepEvent>,

    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub error_step: Option<String>,
}

impl WorkflowResult {
    pub fn is_completed(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_result() {
        let result = StepResult::ok(json!({"records": 100}))
            .with_update("validation_passed", true)
            .with_event("fetched 100 records");

        assert!(result.success);
        assert_eq!(result.output, json!({"records": 100}));
        assert_eq!(
            result.context_updates.get("validation_passed"),
            Some(&json!(true))
        );
    }

    #[test]
    fn test_fail_result() {
        let result = StepResult::fail("upstream 503", ErrorCategory::Transient);
        assert!(!result.success);
        assert_eq!(result.error_category, Some(ErrorCategory::Transient));
        assert_eq!(result.output, Value::Null);
    }

    #[test]
    fn test_serde_round_trip() {
        let result = StepResult::ok(json!([1, 2, 3])).with_next_step("load");
        let text = serde_json::to_string(&result).unwrap();
        let back: StepResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back, result);
    }
}
