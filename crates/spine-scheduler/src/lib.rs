//! # Market Spine Scheduler
//!
//! Production drivers for periodic data:
//!
//! - [`WeeklyScheduler`]: the multi-week, revision-aware sweep. Target
//!   selection over a lookback window, ingest with content-hash revision
//!   detection, normalize, calc (tier-completeness gated), and readiness
//!   evaluation. Partition failures are isolated into `core_anomalies`.
//! - [`PriceScheduler`]: per-symbol daily ingests with rate limiting.
//!
//! Both produce a [`ScheduleReport`] with the shared exit-code contract:
//! 0 healthy, 1 partial failure, 2 all failed or critical.

pub mod prices;
pub mod report;
pub mod weekly;

pub use prices::{OutputSize, PriceScheduleConfig, PriceScheduler};
pub use report::{OutcomeKind, PartitionOutcome, PhaseKind, PhaseSummary, ScheduleReport};
pub use weekly::{
    RunMode, ScheduleError, StagePhase, WeeklyPipelines, WeeklyScheduleConfig, WeeklyScheduler,
};
