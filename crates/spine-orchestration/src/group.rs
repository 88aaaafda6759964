//! Pipeline groups: named static DAGs of registered pipelines (v1)

use std::time::Duration;

use serde::{Deserialize, Serialize};

use spine_core::params::Params;

/// One node in a group's DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Step name, unique within the group
    pub name: String,

    /// Registry key of the pipeline to run
    pub pipeline: String,

    /// Names of steps that must complete before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Step-level parameter overrides (win over group defaults and run params)
    #[serde(default)]
    pub params: Params,
}

impl PipelineStep {
    pub fn new(name: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipeline: pipeline.into(),
            depends_on: vec![],
            params: Params::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

/// Sequential or parallel execution of the resolved plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// What to do when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Abort: skip every step that has not started
    #[default]
    Stop,
    /// Mark the failure and keep going
    Continue,
}

/// Group execution policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub execution: ExecutionMode,
    pub max_concurrency: usize,
    pub on_failure: OnFailure,
    /// Per-step wall-clock limit
    pub timeout: Option<Duration>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            execution: ExecutionMode::Sequential,
            max_concurrency: 4,
            on_failure: OnFailure::Stop,
            timeout: None,
        }
    }
}

impl ExecutionPolicy {
    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn parallel(max_concurrency: usize) -> Self {
        Self {
            execution: ExecutionMode::Parallel,
            max_concurrency: max_concurrency.max(1),
            ..Self::default()
        }
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A named static DAG of pipelines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineGroup {
    pub name: String,
    pub domain: String,
    pub version: String,

    /// Parameter floor: overridden by run params, then by step params
    #[serde(default)]
    pub defaults: Params,

    pub steps: Vec<PipelineStep>,

    #[serde(default)]
    pub policy: ExecutionPolicy,
}

impl PipelineGroup {
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            version: "v1".to_string(),
            defaults: Params::new(),
            steps: vec![],
            policy: ExecutionPolicy::default(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_defaults(mut self, defaults: Params) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn step(mut self, step: PipelineStep) -> Self {
        self.steps.push(step);
        self
    }
}
