//! Per-partition quality metrics

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Quality metrics for one (partition, stage) write
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub record_count: u64,
    pub valid_count: u64,
    pub null_rate: f64,

    /// Domain-defined metrics, opaque to the core
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,

    pub passed: bool,

    #[serde(default)]
    pub failure_reasons: Vec<String>,
}

impl QualityReport {
    /// A passing report where every record was valid
    pub fn passing(record_count: u64) -> Self {
        Self {
            record_count,
            valid_count: record_count,
            null_rate: 0.0,
            metrics: BTreeMap::new(),
            passed: true,
            failure_reasons: vec![],
        }
    }

    /// A failing report with the given reasons
    pub fn failing(record_count: u64, reasons: Vec<String>) -> Self {
        Self {
            record_count,
            valid_count: 0,
            null_rate: 0.0,
            metrics: BTreeMap::new(),
            passed: false,
            failure_reasons: reasons,
        }
    }

    pub fn with_valid_count(mut self, valid_count: u64) -> Self {
        self.valid_count = valid_count;
        self
    }

    pub fn with_null_rate(mut self, null_rate: f64) -> Self {
        self.null_rate = null_rate;
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passing_report() {
        let report = QualityReport::passing(100);
        assert!(report.passed);
        assert_eq!(report.valid_count, 100);
        assert!(report.failure_reasons.is_empty());
    }

    #[test]
    fn test_failing_report() {
        let report = QualityReport::failing(10, vec!["null_rate above threshold".into()]);
        assert!(!report.passed);
        assert_eq!(report.failure_reasons.len(), 1);
    }

    #[test]
    fn test_custom_metrics() {
        let report = QualityReport::passing(5).with_metric("max_share_qty", 1_000_000);
        assert_eq!(
            report.metrics.get("max_share_qty"),
            Some(&Value::from(1_000_000))
        );
    }
}
