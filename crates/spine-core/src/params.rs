//! Run parameters: a JSON-valued map with typed accessors
//!
//! The core names a handful of keys (listed in [`keys`]); everything else is
//! opaque and passed through to pipelines unchanged.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameter keys referenced by the core framework
pub mod keys {
    pub const WEEK_ENDING: &str = "week_ending";
    pub const TIER: &str = "tier";
    pub const YEAR: &str = "year";
    pub const EXCHANGE_CODE: &str = "exchange_code";
    pub const FILE_PATH: &str = "file_path";
    pub const FORCE: &str = "force";
    pub const SYMBOL: &str = "symbol";
    pub const OUTPUT_SIZE: &str = "outputsize";
    pub const CAPTURE_ID: &str = "capture_id";
    pub const CONTENT_HASH: &str = "content_hash";
    pub const SKIP_ROLLING: &str = "skip_rolling";
    pub const SKIP_REASON: &str = "skip_reason";
    pub const CURRENT_WEEK: &str = "current_week";
    pub const CURRENT_PARTITION: &str = "current_partition";
    pub const PROCESSED_WEEKS: &str = "processed_weeks";

    /// Prior step outputs injected into pipeline steps by the workflow runner
    pub const STEP_OUTPUTS: &str = "__step_outputs";

    /// Set when a workflow runs in dry-run mode; lambdas should honor it
    pub const DRY_RUN: &str = "__dry_run__";
}

/// Ordered string->JSON map of run parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_date(&self, key: &str) -> Option<NaiveDate> {
        self.get_str(key)
            .and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Merge `overlay` on top of `self`, returning a new map.
    ///
    /// Overlay keys win ties. This is the primitive behind the
    /// defaults < run_params < step.params precedence chain.
    pub fn merged(&self, overlay: &Params) -> Params {
        let mut out = self.0.clone();
        for (k, v) in &overlay.0 {
            out.insert(k.clone(), v.clone());
        }
        Params(out)
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.0
    }
}

impl From<BTreeMap<String, Value>> for Params {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}
