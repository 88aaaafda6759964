//! The immutable context threaded through a workflow run
//!
//! Every mutator returns a new context with the change merged; the original
//! is never touched. That makes the context safe to serialize at any point
//! (checkpoints, resumes, map fan-out) and keeps reasoning deterministic:
//! `step_outputs[X]` is defined iff X completed earlier in the traversal.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use spine_core::context::new_batch_id;
use spine_core::params::Params;
use spine_core::partition::PartitionKey;

/// Immutable value carried through a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub run_id: Uuid,
    pub trace_id: String,
    pub batch_id: String,
    pub started_at: DateTime<Utc>,

    /// Run parameters; `context_updates` from steps merge here
    #[serde(default)]
    pub params: Params,

    /// Output of each completed step, keyed by step name
    #[serde(default)]
    pub step_outputs: BTreeMap<String, Value>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    pub partition: Option<PartitionKey>,
    pub as_of_date: Option<NaiveDate>,
    pub capture_id: Option<String>,
    pub idempotency_key: Option<String>,

    /// Name of the last step a checkpoint was written after
    pub last_checkpoint_step: Option<String>,
}

impl WorkflowContext {
    /// Fresh context for a new run of the named workflow
    pub fn new(workflow_name: &str) -> Self {
        let run_id = Uuid::now_v7();
        Self {
            run_id,
            trace_id: run_id.simple().to_string(),
            batch_id: new_batch_id(&format!("wf_{workflow_name}")),
            started_at: Utc::now(),
            params: Params::new(),
            step_outputs: BTreeMap::new(),
            metadata: BTreeMap::new(),
            partition: None,
            as_of_date: None,
            capture_id: None,
            idempotency_key: None,
            last_checkpoint_step: None,
        }
    }

    // =========================================================================
    // Immutable mutators: each returns a new context
    // =========================================================================

    pub fn with_param(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.params.set(key, value);
        next
    }

    pub fn with_params(&self, params: Params) -> Self {
        let mut next = self.clone();
        next.params = next.params.merged(&params);
        next
    }

    /// Publish a completed step's output under its name
    pub fn with_step_output(&self, step: impl Into<String>, output: Value) -> Self {
        let mut next = self.clone();
        next.step_outputs.insert(step.into(), output);
        next
    }

    /// Merge a step's context_updates into the global params
    pub fn with_updates(&self, updates: &BTreeMap<String, Value>) -> Self {
        let mut next = self.clone();
        for (k, v) in updates {
            next.params.set(k.clone(), v.clone());
        }
        next
    }

    pub fn with_batch_id(&self, batch_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.batch_id = batch_id.into();
        next
    }

    pub fn with_partition(&self, partition: PartitionKey) -> Self {
        let mut next = self.clone();
        next.partition = Some(partition);
        next
    }

    pub fn with_as_of_date(&self, date: NaiveDate) -> Self {
        let mut next = self.clone();
        next.as_of_date = Some(date);
        next
    }

    pub fn with_capture_id(&self, capture_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.capture_id = Some(capture_id.into());
        next
    }

    pub fn with_idempotency_key(&self, key: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.idempotency_key = Some(key.into());
        next
    }

    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value.into());
        next
    }

    pub fn with_checkpoint_step(&self, step: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.last_checkpoint_step = Some(step.into());
        next
    }

    /// Sub-context for one map iteration: fresh run id and step outputs,
    /// inherited params with the item bound under `item_param`
    pub fn child_for_item(&self, item_param: &str, item: Value) -> Self {
        let run_id = Uuid::now_v7();
        Self {
            run_id,
            trace_id: self.trace_id.clone(),
            batch_id: self.batch_id.clone(),
            started_at: Utc::now(),
            params: {
                let mut params = self.params.clone();
                params.set(item_param, item);
                params
            },
            step_outputs: BTreeMap::new(),
            metadata: self.metadata.clone(),
            partition: self.partition.clone(),
            as_of_date: self.as_of_date,
            capture_id: self.capture_id.clone(),
            idempotency_key: None,
            last_checkpoint_step: None,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Output of a completed step, if any
    pub fn get_output(&self, step: &str) -> Option<&Value> {
        self.step_outputs.get(step)
    }

    /// A field of a completed step's object output
    pub fn get_output_field(&self, step: &str, field: &str) -> Option<&Value> {
        self.step_outputs.get(step).and_then(|v| v.get(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutators_leave_original_unchanged() {
        let ctx = WorkflowContext::new("weekly");
        let next = ctx.with_param("force", true);

        assert!(ctx.params.is_empty());
        assert_eq!(next.params.get_bool("force"), Some(true));
        assert_eq!(ctx.run_id, next.run_id);
    }

    #[test]
    fn test_step_output_visibility() {
        let ctx = WorkflowContext::new("weekly");
        let ctx = ctx.with_step_output("fetch", json!({"records": 100}));

        assert_eq!(
            ctx.get_output_field("fetch", "records"),
            Some(&json!(100))
        );
        assert_eq!(ctx.get_output("validate"), None);
    }

    #[test]
    fn test_updates_merge_into_params() {
        let ctx = WorkflowContext::new("weekly").with_param("tier", "T1");
        let mut updates = BTreeMap::new();
        updates.insert("validation_passed".to_string(), json!(true));

        let ctx = ctx.with_updates(&updates);
        assert_eq!(ctx.params.get_bool("validation_passed"), Some(true));
        assert_eq!(ctx.params.get_str("tier"), Some("T1"));
    }

    #[test]
    fn test_child_for_item() {
        let ctx = WorkflowContext::new("fanout")
            .with_param("force", false)
            .with_step_output("plan", json!(["w1", "w2"]));

        let child = ctx.child_for_item("current_week", json!("w1"));

        assert_ne!(child.run_id, ctx.run_id);
        assert_eq!(child.batch_id, ctx.batch_id);
        assert_eq!(child.params.get_str("current_week"), Some("w1"));
        assert_eq!(child.params.get_bool("force"), Some(false));
        assert!(child.step_outputs.is_empty());
    }

    #[test]
    fn test_serde_round_trip_exact() {
        let ctx = WorkflowContext::new("weekly")
            .with_param("week_ending", "2025-12-26")
            .with_step_output("fetch", json!({"records": 3}))
            .with_partition(PartitionKey::new().with("tier", "T1"))
            .with_capture_id("finra:p:20251229")
            .with_checkpoint_step("fetch");

        let text = serde_json::to_string(&ctx).unwrap();
        let back: WorkflowContext = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ctx);
    }
}
