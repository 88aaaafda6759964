//! Domain-local strategy interfaces: sources and periods
//!
//! Sources decide how a partition's payload is fetched; periods decide the
//! temporal semantics of a domain (how a period-end is derived from a
//! publication date and how dates are validated and formatted). Both live
//! in per-domain registries; the design deliberately keeps them out of any
//! global core registry so domains stay isolated.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Days, NaiveDate, Weekday};

use crate::error::CoreError;
use crate::partition::PartitionKey;
use crate::registry::StrategyRegistry;

/// Raw payload returned by a source fetch
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub content: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

impl Payload {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Pluggable fetcher for a partition's source data
#[async_trait]
pub trait SourceStrategy: Send + Sync {
    async fn fetch(&self, partition: &PartitionKey) -> Result<Payload, CoreError>;
}

/// Temporal semantics of a domain's periods
pub trait PeriodStrategy: Send + Sync {
    /// The period-end covering a publication date
    fn derive_period_end(&self, publish_date: NaiveDate) -> NaiveDate;

    /// Reject dates that are not valid period-ends
    fn validate(&self, date: NaiveDate) -> Result<(), CoreError>;

    fn format_for_filename(&self, date: NaiveDate) -> String;

    fn format_for_display(&self, date: NaiveDate) -> String;

    /// The most recent `count` period-ends as of a date, newest first
    fn recent_period_ends(&self, as_of: NaiveDate, count: usize) -> Vec<NaiveDate>;
}

/// Weekly periods ending on a fixed weekday (Friday by default)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyPeriod {
    period_end_weekday: Weekday,
}

impl WeeklyPeriod {
    /// Weeks ending on Friday
    pub fn new() -> Self {
        Self {
            period_end_weekday: Weekday::Fri,
        }
    }

    pub fn ending_on(weekday: Weekday) -> Self {
        Self {
            period_end_weekday: weekday,
        }
    }
}

impl Default for WeeklyPeriod {
    fn default() -> Self {
        Self::new()
    }
}

impl PeriodStrategy for WeeklyPeriod {
    fn derive_period_end(&self, publish_date: NaiveDate) -> NaiveDate {
        // Most recent period-end weekday on or before the publish date
        let days_back = (publish_date.weekday().num_days_from_monday() + 7
            - self.period_end_weekday.num_days_from_monday())
            % 7;
        publish_date - Days::new(days_back as u64)
    }

    fn validate(&self, date: NaiveDate) -> Result<(), CoreError> {
        if date.weekday() == self.period_end_weekday {
            Ok(())
        } else {
            Err(CoreError::Configuration(format!(
                "{date} is not a valid period end (expected {:?})",
                self.period_end_weekday
            )))
        }
    }

    fn format_for_filename(&self, date: NaiveDate) -> String {
        date.format("%Y%m%d").to_string()
    }

    fn format_for_display(&self, date: NaiveDate) -> String {
        date.format("%Y-%m-%d").to_string()
    }

    fn recent_period_ends(&self, as_of: NaiveDate, count: usize) -> Vec<NaiveDate> {
        let newest = self.derive_period_end(as_of);
        (0..count)
            .map(|i| newest - Days::new(7 * i as u64))
            .collect()
    }
}

/// Per-domain registry of source strategies
pub type SourceRegistry = StrategyRegistry<Arc<dyn SourceStrategy>>;

/// Per-domain registry of period strategies
pub type PeriodRegistry = StrategyRegistry<Arc<dyn PeriodStrategy>>;

pub fn source_registry() -> SourceRegistry {
    StrategyRegistry::new("source")
}

pub fn period_registry() -> PeriodRegistry {
    StrategyRegistry::new("period")
}
