//! Work-item polling with exponential backoff
//!
//! Claims work with adaptive intervals: resets to the minimum when an item
//! is found, backs off toward the maximum when the queue is idle.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use spine_core::Lane;
use spine_storage::{SpineStore, StoreError, WorkItem};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when items are available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no items are found
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollerConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Claims work items with adaptive backoff
pub struct WorkPoller {
    store: Arc<dyn SpineStore>,
    worker_id: String,
    lanes: Option<Vec<Lane>>,
    config: PollerConfig,
    current_interval: Duration,
}

impl WorkPoller {
    pub fn new(
        store: Arc<dyn SpineStore>,
        worker_id: impl Into<String>,
        lanes: Option<Vec<Lane>>,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            lanes,
            config: config.clone(),
            current_interval: config.min_interval,
        }
    }

    /// Claim one item if any is eligible, updating backoff state
    pub async fn poll(&mut self) -> Result<Option<WorkItem>, StoreError> {
        let claimed = self
            .store
            .claim(&self.worker_id, self.lanes.as_deref())
            .await?;

        match &claimed {
            Some(item) => {
                trace!(item = %item.id, "claimed work item");
                self.current_interval = self.config.min_interval;
            }
            None => {
                let next = self.current_interval.as_secs_f64() * self.config.backoff_multiplier;
                self.current_interval =
                    Duration::from_secs_f64(next).min(self.config.max_interval);
            }
        }
        Ok(claimed)
    }

    /// How long to sleep before the next poll
    pub fn interval(&self) -> Duration {
        self.current_interval
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
