//! Partition keys: the unit of work
//!
//! A partition key maps dimension names to values and uniquely identifies a
//! slice of data within a (domain, pipeline) namespace. Keys are
//! order-independent; storage and equality use the canonical JSON form
//! (keys sorted lexicographically, no whitespace).

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Dimension names referenced by the core
///
/// Everything outside this list is opaque to the core and passed through.
pub mod dims {
    pub const WEEK_ENDING: &str = "week_ending";
    pub const TIER: &str = "tier";
    pub const YEAR: &str = "year";
    pub const VENUE: &str = "venue";
    pub const SYMBOL: &str = "symbol";
}

/// A mapping from dimension name to value identifying one unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(BTreeMap<String, String>);

impl PartitionKey {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Add or replace a dimension
    pub fn with(mut self, dimension: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(dimension.into(), value.into());
        self
    }

    /// Convenience constructor for (week_ending, tier) partitions
    pub fn week_tier(week_ending: NaiveDate, tier: impl Into<String>) -> Self {
        Self::new()
            .with(dims::WEEK_ENDING, week_ending.format("%Y-%m-%d").to_string())
            .with(dims::TIER, tier)
    }

    /// Convenience constructor for single-symbol partitions
    pub fn symbol(symbol: impl Into<String>) -> Self {
        Self::new().with(dims::SYMBOL, symbol)
    }

    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.0.get(dimension).map(String::as_str)
    }

    /// Parse a dimension as an ISO date
    pub fn get_date(&self, dimension: &str) -> Option<NaiveDate> {
        self.get(dimension)
            .and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonical JSON form: keys sorted lexicographically, no whitespace
    ///
    /// This string is the storage and equality representation everywhere.
    pub fn canonical(&self) -> String {
        // BTreeMap iterates sorted; serde_json compact output has no spaces
        serde_json::to_string(&self.0).expect("string map serializes")
    }

    /// Parse a canonical (or any JSON object of strings) form back
    pub fn from_canonical(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromIterator<(String, String)> for PartitionKey {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_is_sorted_and_compact() {
        let key = PartitionKey::new()
            .with("tier", "NMS_TIER_1")
            .with("week_ending", "2025-12-22");

        assert_eq!(
            key.canonical(),
            r#"{"tier":"NMS_TIER_1","week_ending":"2025-12-22"}"#
        );
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        let a = PartitionKey::new().with("a", "1").with("b", "2");
        let b = PartitionKey::new().with("b", "2").with("a", "1");

        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_canonical_round_trip() {
        let key = PartitionKey::week_tier(
            NaiveDate::from_ymd_opt(2025, 12, 22).unwrap(),
            "NMS_TIER_1",
        );
        let parsed = PartitionKey::from_canonical(&key.canonical()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_get_date() {
        let key = PartitionKey::week_tier(NaiveDate::from_ymd_opt(2025, 12, 22).unwrap(), "T1");
        assert_eq!(
            key.get_date(dims::WEEK_ENDING),
            NaiveDate::from_ymd_opt(2025, 12, 22)
        );
        assert_eq!(key.get(dims::TIER), Some("T1"));
        assert_eq!(key.get("venue"), None);
    }
}
