//! # Market Spine Worker
//!
//! Drains the durable work queue: an adaptive poller claims items, the
//! dispatcher runs them to completion, and results settle back into the
//! queue state machine. A companion reaper requeues items whose worker
//! died holding the lock.

pub mod poller;
pub mod reaper;
pub mod worker;

pub use poller::{PollerConfig, WorkPoller};
pub use reaper::{Reaper, ReaperConfig};
pub use worker::{QueueWorker, WorkerConfig};
