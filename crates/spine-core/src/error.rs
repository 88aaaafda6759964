//! Error taxonomy shared across the framework
//!
//! Every failure that crosses a component boundary carries an
//! [`ErrorCategory`] so runners and schedulers can decide whether to retry,
//! surface, or abort without inspecting error text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::registry::RegistryError;

/// Category of a failure, carried in step results and anomaly records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Timeouts, upstream 5xx, connection resets. Retryable.
    Transient,

    /// Schema drift, threshold breach, missing required symbols.
    /// Not auto-retryable; the partition fails and is surfaced.
    DataQuality,

    /// Missing credentials, malformed params. Fatal at run scope.
    Configuration,

    /// Upstream partition missing, registry lookup failed. The scheduler
    /// may pick it up again on the next sweep.
    Dependency,

    /// Step or workflow timeout expired. Retryable by policy.
    Timeout,

    /// Code bug or invariant violation (cycle detected, duplicate
    /// registration). Fatal; never auto-retried.
    Internal,
}

impl ErrorCategory {
    /// Whether this category is safe to retry automatically
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::DataQuality => "data_quality",
            Self::Configuration => "configuration",
            Self::Dependency => "dependency",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "data_quality" => Ok(Self::DataQuality),
            "configuration" => Ok(Self::Configuration),
            "dependency" => Ok(Self::Dependency),
            "timeout" => Ok(Self::Timeout),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown error category: {other}")),
        }
    }
}

/// Errors raised by the core framework
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Registry lookup or registration failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A required upstream artifact is missing. The hint embeds the
    /// remediation command where one is known.
    #[error("missing dependency: {what}. {hint}")]
    DependencyMissing { what: String, hint: String },

    /// Invalid configuration or parameters
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Source fetch failed (network, upstream 5xx)
    #[error("source fetch failed: {0}")]
    Source(String),

    /// Invariant violation inside the framework
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Map this error to its taxonomy category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Registry(RegistryError::PipelineNotFound(_)) => ErrorCategory::Dependency,
            Self::Registry(RegistryError::StrategyNotFound { .. }) => ErrorCategory::Dependency,
            Self::Registry(RegistryError::DuplicateRegistration(_)) => ErrorCategory::Internal,
            Self::DependencyMissing { .. } => ErrorCategory::Dependency,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Source(_) => ErrorCategory::Transient,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Build a dependency error with a remediation hint
    pub fn dependency_missing(what: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::DependencyMissing {
            what: what.into(),
            hint: hint.into(),
        }
    }
}
