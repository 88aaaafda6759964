//! The pipeline contract every registered pipeline honors
//!
//! A pipeline is constructed by a zero-arg factory, receives its
//! `ExecutionContext` and `Params` at run time, and returns a
//! [`PipelineResult`]. Pipelines must be idempotent for the same params and
//! source content: re-running produces identical rows under the same
//! capture id. Domain pipelines depend only on this crate (domain purity:
//! no storage drivers, HTTP clients, or orchestration imports).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::ErrorCategory;
use crate::params::Params;
use crate::quality::QualityReport;

/// Terminal status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Envelope returned by every pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub status: PipelineStatus,

    /// Failure text when status is Failed
    pub error: Option<String>,

    /// Taxonomy category when status is Failed
    pub error_category: Option<ErrorCategory>,

    /// Numeric run metrics (durations, counters)
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,

    /// Capture written by this run, if any
    pub capture_id: Option<String>,

    /// Rows written under the capture, if any
    pub row_count: Option<u64>,

    /// Quality evaluation for the written partition, if computed
    pub quality: Option<QualityReport>,
}

impl PipelineResult {
    pub fn completed() -> Self {
        Self {
            status: PipelineStatus::Completed,
            error: None,
            error_category: None,
            metrics: BTreeMap::new(),
            capture_id: None,
            row_count: None,
            quality: None,
        }
    }

    pub fn failed(error: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            status: PipelineStatus::Failed,
            error: Some(error.into()),
            error_category: Some(category),
            metrics: BTreeMap::new(),
            capture_id: None,
            row_count: None,
            quality: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: PipelineStatus::Skipped,
            error: None,
            error_category: None,
            metrics: BTreeMap::new(),
            capture_id: None,
            row_count: None,
            quality: None,
        }
    }

    pub fn with_capture(mut self, capture_id: impl Into<String>, row_count: u64) -> Self {
        self.capture_id = Some(capture_id.into());
        self.row_count = Some(row_count);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_quality(mut self, quality: QualityReport) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == PipelineStatus::Failed
    }
}

/// A runnable pipeline
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn run(&self, ctx: &ExecutionContext, params: &Params) -> PipelineResult;
}

/// Zero-arg factory producing pipeline instances
pub type PipelineFactory = Arc<dyn Fn() -> Arc<dyn Pipeline> + Send + Sync>;

/// Wrap a constructor closure as a [`PipelineFactory`]
pub fn factory<P, F>(make: F) -> PipelineFactory
where
    P: Pipeline + 'static,
    F: Fn() -> P + Send + Sync + 'static,
{
    Arc::new(move || Arc::new(make()) as Arc<dyn Pipeline>)
}
