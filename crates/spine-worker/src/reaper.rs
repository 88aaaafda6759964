//! Stale-lock reaper
//!
//! A crashed worker leaves its item in Running with a stale lock. The
//! reaper periodically returns such items to Pending so another worker can
//! pick them up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use spine_storage::{SpineStore, DEFAULT_STALE_LOCK};

/// Reaper configuration
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to sweep
    pub interval: Duration,

    /// Locks older than this are considered abandoned
    pub stale_threshold: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_threshold: DEFAULT_STALE_LOCK,
        }
    }
}

/// Periodically requeues items whose lock expired
pub struct Reaper {
    store: Arc<dyn SpineStore>,
    config: ReaperConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn SpineStore>,
        config: ReaperConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            shutdown_rx,
        }
    }

    /// Run until the shutdown signal flips
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        info!(
            interval_s = self.config.interval.as_secs(),
            threshold_s = self.config.stale_threshold.as_secs(),
            "reaper started"
        );

        loop {
            let sleep = tokio::time::sleep(self.config.interval);
            tokio::select! {
                _ = sleep => {}
                _ = self.shutdown_rx.changed() => {}
            }
            if *self.shutdown_rx.borrow() {
                break;
            }

            match self.store.reap_stale(self.config.stale_threshold).await {
                Ok(reaped) if !reaped.is_empty() => {
                    warn!(count = reaped.len(), "requeued stale work items");
                }
                Ok(_) => {}
                Err(e) => error!("reap failed: {e}"),
            }
        }
        info!("reaper stopped");
    }
}
