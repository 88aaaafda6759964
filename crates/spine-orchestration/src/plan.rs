//! Plan resolution: validation, cycle detection, topological sort
//!
//! Consumes a [`PipelineGroup`] and produces an [`ExecutionPlan`] whose
//! steps are topologically ordered (Kahn's algorithm, ties broken by step
//! name so the same group always resolves to the same plan) and carry fully
//! merged parameters (defaults < run params < step params).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use spine_core::context::new_batch_id;
use spine_core::params::Params;
use spine_core::registry::PipelineRegistry;

use crate::group::{ExecutionPolicy, PipelineGroup};

/// Errors from plan resolution
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    /// Two steps share a name
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    /// A depends_on entry names no step in the group
    #[error("step '{step}' depends on unknown step '{missing}'")]
    UnknownDependency { step: String, missing: String },

    /// The depends_on graph contains a cycle; the path is a closed walk
    #[error("cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// A step references a pipeline absent from the registry
    #[error("step '{step}' references unregistered pipeline '{pipeline}'")]
    UnknownPipeline { step: String, pipeline: String },
}

/// One step of a resolved plan, with merged params and a stable order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub name: String,
    pub pipeline: String,
    pub params: Params,
    pub depends_on: Vec<String>,
    pub sequence_order: usize,
}

/// A resolved group, ready for the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub batch_id: String,
    pub group_name: String,
    pub group_version: String,
    pub policy: ExecutionPolicy,
    /// Steps in topological order
    pub steps: Vec<PlannedStep>,
}

/// Resolves groups into execution plans
#[derive(Default)]
pub struct PlanResolver {
    /// When set, every step's pipeline must exist in this registry
    registry: Option<Arc<PipelineRegistry>>,
}

impl PlanResolver {
    pub fn new() -> Self {
        Self { registry: None }
    }

    /// Verify step pipelines against a registry during resolution
    pub fn with_registry_check(mut self, registry: Arc<PipelineRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate, detect cycles, topo-sort, and merge parameters
    pub fn resolve(
        &self,
        group: &PipelineGroup,
        run_params: &Params,
    ) -> Result<ExecutionPlan, PlanError> {
        // Step names must be unique
        let mut seen = BTreeSet::new();
        for step in &group.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(PlanError::DuplicateStep(step.name.clone()));
            }
        }

        // Every dependency must resolve within the group
        for step in &group.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        step: step.name.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }

        // Optional registry existence check
        if let Some(registry) = &self.registry {
            for step in &group.steps {
                if !registry.contains(&step.pipeline) {
                    return Err(PlanError::UnknownPipeline {
                        step: step.name.clone(),
                        pipeline: step.pipeline.clone(),
                    });
                }
            }
        }

        if let Some(path) = detect_cycle(group) {
            return Err(PlanError::CycleDetected { path });
        }

        let order = topo_sort(group);

        let steps = order
            .into_iter()
            .enumerate()
            .map(|(sequence_order, name)| {
                let step = group
                    .steps
                    .iter()
                    .find(|s| s.name == name)
                    .expect("topo order contains only group steps");
                PlannedStep {
                    name: step.name.clone(),
                    pipeline: step.pipeline.clone(),
                    params: group.defaults.merged(run_params).merged(&step.params),
                    depends_on: step.depends_on.clone(),
                    sequence_order,
                }
            })
            .collect();

        Ok(ExecutionPlan {
            batch_id: new_batch_id(&format!("group_{}", group.name)),
            group_name: group.name.clone(),
            group_version: group.version.clone(),
            policy: group.policy.clone(),
            steps,
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-color DFS over the depends_on edges; returns a closed walk on a hit
fn detect_cycle(group: &PipelineGroup) -> Option<Vec<String>> {
    let deps: HashMap<&str, &Vec<String>> = group
        .steps
        .iter()
        .map(|s| (s.name.as_str(), &s.depends_on))
        .collect();

    let mut colors: HashMap<&str, Color> =
        group.steps.iter().map(|s| (s.name.as_str(), Color::White)).collect();

    fn visit<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, &'a Vec<String>>,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for dep in deps.get(node).copied().into_iter().flatten() {
            match colors.get(dep.as_str()) {
                Some(Color::Gray) => {
                    // Re-entered an in-progress node: the cycle is the path
                    // from its first occurrence back to it.
                    let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Some(Color::White) => {
                    if let Some(cycle) = visit(dep, deps, colors, path) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
        None
    }

    // Deterministic start order: step declaration order
    for step in &group.steps {
        if colors[step.name.as_str()] == Color::White {
            let mut path = Vec::new();
            if let Some(cycle) = visit(step.name.as_str(), &deps, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Kahn's algorithm; the ready set is a BTreeSet so ties break by name
fn topo_sort(group: &PipelineGroup) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = group
        .steps
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.len()))
        .collect();

    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &group.steps {
        for dep in &step.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();

    let mut order = Vec::with_capacity(group.steps.len());
    while let Some(&name) = ready.iter().next() {
        ready.remove(name);
        order.push(name.to_string());

        for dependent in dependents.get(name).into_iter().flatten() {
            let degree = in_degree.get_mut(dependent).expect("known step");
            *degree -= 1;
            if *degree == 0 {
                ready.insert(dependent);
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::PipelineStep;

    fn diamond() -> PipelineGroup {
        // B->[A], C->[A], D->[B, C]
        PipelineGroup::new("weekly", "finra")
            .step(PipelineStep::new("A", "finra.ingest"))
            .step(PipelineStep::new("B", "finra.normalize").depends_on(["A"]))
            .step(PipelineStep::new("C", "finra.enrich").depends_on(["A"]))
            .step(PipelineStep::new("D", "finra.calc").depends_on(["B", "C"]))
    }

    #[test]
    fn test_topological_order_deterministic() {
        let plan = PlanResolver::new()
            .resolve(&diamond(), &Params::new())
            .unwrap();

        let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        // B before C by name tie-break
        assert_eq!(names, vec!["A", "B", "C", "D"]);
        assert_eq!(
            plan.steps.iter().map(|s| s.sequence_order).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert!(plan.batch_id.starts_with("group_weekly_"));
    }

    #[test]
    fn test_topo_order_respects_dependencies() {
        let plan = PlanResolver::new()
            .resolve(&diamond(), &Params::new())
            .unwrap();

        let position: HashMap<&str, usize> = plan
            .steps
            .iter()
            .map(|s| (s.name.as_str(), s.sequence_order))
            .collect();

        for step in &plan.steps {
            for dep in &step.depends_on {
                assert!(position[dep.as_str()] < position[step.name.as_str()]);
            }
        }
    }

    #[test]
    fn test_cycle_detected_with_valid_path() {
        // A->[C], B->[A], C->[B]
        let group = PipelineGroup::new("cyclic", "finra")
            .step(PipelineStep::new("A", "p").depends_on(["C"]))
            .step(PipelineStep::new("B", "p").depends_on(["A"]))
            .step(PipelineStep::new("C", "p").depends_on(["B"]));

        let err = PlanResolver::new()
            .resolve(&group, &Params::new())
            .unwrap_err();

        let PlanError::CycleDetected { path } = err else {
            panic!("expected cycle error");
        };
        // A rotation of [A, C, B, A]: closed, length 4, visits all three
        assert_eq!(path.len(), 4);
        assert_eq!(path.first(), path.last());
        for name in ["A", "B", "C"] {
            assert!(path.contains(&name.to_string()));
        }
    }

    #[test]
    fn test_self_loop_detected() {
        let group = PipelineGroup::new("selfie", "finra")
            .step(PipelineStep::new("A", "p").depends_on(["A"]));

        let err = PlanResolver::new()
            .resolve(&group, &Params::new())
            .unwrap_err();

        let PlanError::CycleDetected { path } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(path, vec!["A", "A"]);
    }

    #[test]
    fn test_unknown_dependency_at_resolution() {
        let group = PipelineGroup::new("broken", "finra")
            .step(PipelineStep::new("A", "p").depends_on(["ghost"]));

        let err = PlanResolver::new()
            .resolve(&group, &Params::new())
            .unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let group = PipelineGroup::new("dupes", "finra")
            .step(PipelineStep::new("A", "p"))
            .step(PipelineStep::new("A", "q"));

        let err = PlanResolver::new()
            .resolve(&group, &Params::new())
            .unwrap_err();
        assert!(matches!(err, PlanError::DuplicateStep(_)));
    }

    #[test]
    fn test_param_merge_precedence() {
        let group = PipelineGroup::new("merge", "finra")
            .with_defaults(Params::new().with("tier", "T1").with("force", false))
            .step(
                PipelineStep::new("A", "p").with_params(Params::new().with("tier", "T2")),
            );

        let run_params = Params::new().with("force", true);
        let plan = PlanResolver::new().resolve(&group, &run_params).unwrap();

        let params = &plan.steps[0].params;
        assert_eq!(params.get_str("tier"), Some("T2"));
        assert_eq!(params.get_bool("force"), Some(true));
    }

    #[test]
    fn test_registry_check() {
        let registry = Arc::new(PipelineRegistry::new());
        let group = PipelineGroup::new("checked", "finra")
            .step(PipelineStep::new("A", "finra.missing"));

        let err = PlanResolver::new()
            .with_registry_check(registry)
            .resolve(&group, &Params::new())
            .unwrap_err();
        assert!(matches!(err, PlanError::UnknownPipeline { .. }));
    }
}
