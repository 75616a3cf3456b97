//! Plan graph validation and ready-set computation.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::model::{PlanRequest, PlanStep};
use crate::core::types::{Protocol, StepId, StepStatus};

/// Check structural invariants of a plan before it is persisted:
/// - at least one step, unique step ids
/// - every dependency names a known step other than itself
/// - the dependency graph is acyclic
/// - protocol shape (`ping_pong`: exactly two steps; `consensus`: two or more
///   independent steps sharing one task)
/// - `max_parallel > 0`
pub fn validate_plan(request: &PlanRequest) -> Vec<String> {
    let mut errors = Vec::new();

    if request.steps.is_empty() {
        errors.push("plan must contain at least one step".to_string());
        return errors;
    }
    if request.max_parallel == 0 {
        errors.push("max_parallel must be > 0".to_string());
    }
    if request.project_id.trim().is_empty() {
        errors.push("project_id must be non-empty".to_string());
    }

    let mut seen = HashSet::new();
    for step in &request.steps {
        if step.id.as_str().trim().is_empty() {
            errors.push("step id must be non-empty".to_string());
        }
        if !seen.insert(&step.id) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
    }

    for step in &request.steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                errors.push(format!("step '{}' depends on itself", step.id));
            } else if !seen.contains(dep) {
                errors.push(format!("step '{}' depends on unknown step '{dep}'", step.id));
            }
        }
    }

    if errors.is_empty() {
        let nodes: Vec<(&StepId, &[StepId])> = request
            .steps
            .iter()
            .map(|s| (&s.id, s.depends_on.as_slice()))
            .collect();
        if let Err(cycle) = topological(&nodes) {
            let ids: Vec<&str> = cycle.iter().map(|id| id.as_str()).collect();
            errors.push(format!("dependency cycle among steps: {}", ids.join(", ")));
        }
    }

    match request.protocol {
        Protocol::Sequential | Protocol::Parallel => {}
        Protocol::PingPong => {
            if request.steps.len() != 2 {
                errors.push(format!(
                    "ping_pong requires exactly 2 steps, got {}",
                    request.steps.len()
                ));
            }
            if request.steps.iter().any(|s| !s.depends_on.is_empty()) {
                errors.push("ping_pong steps must not declare dependencies".to_string());
            }
        }
        Protocol::Consensus => {
            if request.steps.len() < 2 {
                errors.push(format!(
                    "consensus requires at least 2 steps, got {}",
                    request.steps.len()
                ));
            }
            let tasks: HashSet<&str> = request.steps.iter().map(|s| s.task_id.as_str()).collect();
            if tasks.len() > 1 {
                errors.push("consensus steps must share one task_id".to_string());
            }
            if request.steps.iter().any(|s| !s.depends_on.is_empty()) {
                errors.push("consensus steps must not declare dependencies".to_string());
            }
        }
    }

    for (name, value) in [
        ("ping_pong_max_rounds", request.ping_pong_max_rounds),
        ("consensus_max_rounds", request.consensus_max_rounds),
    ] {
        if value == Some(0) {
            errors.push(format!("{name} must be > 0"));
        }
    }
    if request.round_timeout_secs == Some(0) {
        errors.push("round_timeout_secs must be > 0".to_string());
    }

    errors
}

/// Topological order of a valid plan, ties broken by creation order.
pub fn execution_order(request: &PlanRequest) -> Result<Vec<StepId>, Vec<StepId>> {
    let nodes: Vec<(&StepId, &[StepId])> = request
        .steps
        .iter()
        .map(|s| (&s.id, s.depends_on.as_slice()))
        .collect();
    topological(&nodes)
        .map(|order| order.into_iter().map(|i| request.steps[i].id.clone()).collect())
        .map_err(|cycle| cycle.into_iter().cloned().collect())
}

/// Kahn's algorithm over `(id, deps)` pairs. Returns node indices in order, or
/// the ids left over when a cycle prevents progress. Unknown deps are ignored.
fn topological<'a>(nodes: &[(&'a StepId, &[StepId])]) -> Result<Vec<usize>, Vec<&'a StepId>> {
    let index: HashMap<&StepId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (*id, i))
        .collect();
    let mut indegree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, (_, deps)) in nodes.iter().enumerate() {
        for dep in deps.iter() {
            if let Some(&d) = index.get(dep) {
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        Err((0..nodes.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| nodes[i].0)
            .collect())
    }
}

/// Pending steps whose dependencies are all `completed` or `skipped`, in
/// creation order.
pub fn ready_steps(steps: &[PlanStep]) -> Vec<&PlanStep> {
    let status: HashMap<&StepId, StepStatus> = steps.iter().map(|s| (&s.id, s.status)).collect();
    let mut ready: Vec<&PlanStep> = steps
        .iter()
        .filter(|step| step.status == StepStatus::Pending)
        .filter(|step| {
            step.depends_on.iter().all(|dep| {
                status
                    .get(dep)
                    .is_some_and(|status| status.satisfies_dependency())
            })
        })
        .collect();
    ready.sort_by_key(|step| step.position);
    ready
}

/// Input handed to a step's run: its own instructions followed by the outputs
/// of its dependencies in declaration order.
pub fn dependency_input(step: &PlanStep, steps: &[PlanStep]) -> String {
    let mut input = step.input.clone();
    for dep in &step.depends_on {
        let Some(output) = steps
            .iter()
            .find(|s| &s.id == dep)
            .and_then(|s| s.output.as_deref())
        else {
            continue;
        };
        if !input.is_empty() {
            input.push_str("\n\n");
        }
        input.push_str(&format!("## Output of step {dep}\n{}", output.trim()));
    }
    input
}

/// Steps nothing depends on, in creation order.
pub fn sink_steps(steps: &[PlanStep]) -> Vec<&PlanStep> {
    let referenced: HashSet<&StepId> = steps.iter().flat_map(|s| s.depends_on.iter()).collect();
    let mut sinks: Vec<&PlanStep> = steps
        .iter()
        .filter(|s| !referenced.contains(&s.id))
        .collect();
    sinks.sort_by_key(|step| step.position);
    sinks
}
