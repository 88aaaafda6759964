//! Workflow step definitions (v2)
//!
//! Five step kinds: lambda (inline async function), pipeline (registry
//! key), choice (condition -> branch target), wait, and map (fan-out over
//! items with a sub-workflow). Each step carries its own error policy,
//! optional timeout, and a checkpoint flag.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

use spine_core::params::Params;

use crate::context::WorkflowContext;
use crate::result::StepResult;
use crate::retry::RetryPolicy;

/// Inline step body: receives the current context, returns a result
pub type LambdaHandler =
    Arc<dyn Fn(WorkflowContext) -> BoxFuture<'static, StepResult> + Send + Sync>;

/// Choice predicate; pure and total. An Err fails the step as INTERNAL
pub type ChoiceCondition =
    Arc<dyn Fn(&WorkflowContext) -> Result<bool, String> + Send + Sync>;

/// Where a map step finds its items
#[derive(Debug, Clone, PartialEq)]
pub enum MapItems {
    /// A fixed list
    Fixed(Vec<Value>),
    /// A context key holding an array (params first, then step_outputs)
    FromContext(String),
}

/// What a single item failure does to the whole map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapFailureMode {
    /// First failure aborts the map (all-or-nothing)
    #[default]
    FailFast,
    /// Failures are collected; the map itself succeeds
    Partial,
}

/// What a step failure does to the workflow
#[derive(Clone, Default)]
pub enum ErrorPolicy {
    /// Abort the workflow, surfacing the error
    #[default]
    Stop,
    /// Record the failure and proceed to the next step
    Continue,
    /// Re-execute per the policy; falls back to Stop when exhausted
    Retry(RetryPolicy),
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "Stop"),
            Self::Continue => write!(f, "Continue"),
            Self::Retry(policy) => write!(f, "Retry(max_attempts={})", policy.max_attempts),
        }
    }
}

/// Wait target
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitFor {
    Duration(Duration),
    Until(DateTime<Utc>),
}

/// The five step kinds
#[derive(Clone)]
pub enum StepKind {
    Lambda {
        handler: LambdaHandler,
    },
    Pipeline {
        pipeline: String,
        params: Params,
    },
    Choice {
        condition: ChoiceCondition,
        then_step: String,
        else_step: Option<String>,
    },
    Wait {
        wait: WaitFor,
    },
    Map {
        items: MapItems,
        item_param: String,
        iterator: Arc<Workflow>,
        max_concurrency: usize,
        on_item_failure: MapFailureMode,
    },
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lambda { .. } => write!(f, "Lambda"),
            Self::Pipeline { pipeline, .. } => write!(f, "Pipeline({pipeline})"),
            Self::Choice { then_step, .. } => write!(f, "Choice(then={then_step})"),
            Self::Wait { wait } => write!(f, "Wait({wait:?})"),
            Self::Map { item_param, .. } => write!(f, "Map(item_param={item_param})"),
        }
    }
}

/// One step of a workflow
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub name: String,
    pub kind: StepKind,
    pub on_error: ErrorPolicy,
    /// Persist a checkpoint after this step (FlaggedOnly mode)
    pub checkpoint: bool,
    pub timeout: Option<Duration>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            on_error: ErrorPolicy::Stop,
            checkpoint: false,
            timeout: None,
        }
    }

    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An ordered sequence of steps with explicit context flow
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<StepDefinition>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: vec![],
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a lambda step
    pub fn lambda<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        self.step(StepDefinition::new(name, lambda(handler)))
    }

    /// Append a pipeline step
    pub fn pipeline(
        self,
        name: impl Into<String>,
        pipeline: impl Into<String>,
        params: Params,
    ) -> Self {
        self.step(StepDefinition::new(
            name,
            StepKind::Pipeline {
                pipeline: pipeline.into(),
                params,
            },
        ))
    }

    /// Append a choice step
    pub fn choice<F>(
        self,
        name: impl Into<String>,
        condition: F,
        then_step: impl Into<String>,
        else_step: Option<String>,
    ) -> Self
    where
        F: Fn(&WorkflowContext) -> Result<bool, String> + Send + Sync + 'static,
    {
        self.step(StepDefinition::new(
            name,
            StepKind::Choice {
                condition: Arc::new(condition),
                then_step: then_step.into(),
                else_step,
            },
        ))
    }

    /// Append a fixed-duration wait step
    pub fn wait(self, name: impl Into<String>, duration: Duration) -> Self {
        self.step(StepDefinition::new(
            name,
            StepKind::Wait {
                wait: WaitFor::Duration(duration),
            },
        ))
    }

    /// Append a map step fanning out over items
    pub fn map(
        self,
        name: impl Into<String>,
        items: MapItems,
        item_param: impl Into<String>,
        iterator: Workflow,
        max_concurrency: usize,
    ) -> Self {
        self.step(StepDefinition::new(
            name,
            StepKind::Map {
                items,
                item_param: item_param.into(),
                iterator: Arc::new(iterator),
                max_concurrency: max_concurrency.max(1),
                on_item_failure: MapFailureMode::default(),
            },
        ))
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn position_of(&self, step_name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == step_name)
    }
}

/// Wrap an async closure as a lambda step kind
pub fn lambda<F, Fut>(handler: F) -> StepKind
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    StepKind::Lambda {
        handler: Arc::new(move |ctx| -> BoxFuture<'static, StepResult> {
            Box::pin(handler(ctx))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_produces_ordered_steps() {
        let inner = Workflow::new("per_week").lambda("noop", |_ctx| async {
            StepResult::ok_empty()
        });

        let wf = Workflow::new("weekly")
            .lambda("fetch", |_ctx| async { StepResult::ok(json!({"records": 1})) })
            .pipeline("ingest", "finra.ingest_week", Params::new())
            .choice("gate", |_ctx| Ok(true), "load", None)
            .wait("cool_off", Duration::from_millis(1))
            .map(
                "fanout",
                MapItems::Fixed(vec![json!("w1")]),
                "current_week",
                inner,
                2,
            );

        assert_eq!(
            wf.step_names(),
            vec!["fetch", "ingest", "gate", "cool_off", "fanout"]
        );
        assert_eq!(wf.position_of("gate"), Some(2));
        assert_eq!(wf.position_of("missing"), None);
    }

    #[test]
    fn test_step_options() {
        let step = StepDefinition::new("s", lambda(|_ctx| async { StepResult::ok_empty() }))
            .on_error(ErrorPolicy::Continue)
            .with_checkpoint()
            .with_timeout(Duration::from_secs(30));

        assert!(step.checkpoint);
        assert_eq!(step.timeout, Some(Duration::from_secs(30)));
        assert!(matches!(step.on_error, ErrorPolicy::Continue));
    }
}
