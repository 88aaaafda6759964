//! # Market Spine Core
//!
//! Core primitives for temporal, partition-oriented data pipelines.
//!
//! ## Features
//!
//! - **Execution identity**: contexts with batch inheritance and time-ordered ids
//! - **Partition keys**: canonical, order-independent units of work
//! - **Capture ids**: the deterministic idempotency knob (`domain:partition:YYYYMMDD`)
//! - **Registries**: explicit name->factory maps for pipelines, periods, and sources
//! - **Dispatcher**: resolve by name, run to completion, materialize an execution record
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                           │
//! │   (resolve name -> ExecutionContext -> run -> Execution)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     PipelineRegistry                        │
//! │   (dotted name -> zero-arg factory, explicit registration)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Pipeline (contract)                      │
//! │   (run(ctx, params) -> PipelineResult, idempotent per       │
//! │    capture id, no infrastructure imports)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod params;
pub mod partition;
pub mod pipeline;
pub mod quality;
pub mod registry;
pub mod runner;
pub mod stage;
pub mod strategy;
pub mod version;

/// Prelude for common imports
pub mod prelude {
    pub use crate::capture::{capture_id, content_hash};
    pub use crate::config::SpineConfig;
    pub use crate::context::{new_batch_id, ExecutionContext, Lane, TriggerSource};
    pub use crate::dispatcher::{Dispatcher, Execution};
    pub use crate::error::{CoreError, ErrorCategory};
    pub use crate::params::Params;
    pub use crate::partition::PartitionKey;
    pub use crate::pipeline::{
        factory, Pipeline, PipelineFactory, PipelineResult, PipelineStatus,
    };
    pub use crate::quality::QualityReport;
    pub use crate::registry::{PipelineRegistry, RegistryError, StrategyRegistry};
    pub use crate::strategy::{
        period_registry, source_registry, Payload, PeriodRegistry, PeriodStrategy,
        SourceRegistry, SourceStrategy, WeeklyPeriod,
    };
}

// Re-export key types at crate root
pub use capture::{capture_id, content_hash};
pub use config::SpineConfig;
pub use context::{new_batch_id, ExecutionContext, Lane, TriggerSource};
pub use dispatcher::{Dispatcher, Execution};
pub use error::{CoreError, ErrorCategory};
pub use params::Params;
pub use partition::PartitionKey;
pub use pipeline::{factory, Pipeline, PipelineFactory, PipelineResult, PipelineStatus};
pub use quality::QualityReport;
pub use registry::{PipelineRegistry, RegistryError, StrategyRegistry};
pub use strategy::{Payload, PeriodStrategy, SourceStrategy, WeeklyPeriod};
