//! Property tests for DAG scheduling: on random acyclic plans every step is
//! dispatched only after all of its dependencies completed, and the plan's
//! parallelism limit is never exceeded.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use orchestrator::core::model::{PlanRequest, PlanStepRequest, Selection};
use orchestrator::core::policy::PLAN_READONLY;
use orchestrator::core::types::{PlanStatus, Protocol, StepId, StepStatus};
use orchestrator::io::store::InMemoryStore;
use orchestrator::test_support::{FnDispatcher, Harness, done};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

const MAX_STEPS: usize = 7;

/// `deps[j]` lists indices `< j`, so every generated graph is acyclic.
fn dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=MAX_STEPS).prop_flat_map(|n| {
        prop::collection::vec(prop::collection::vec(any::<bool>(), MAX_STEPS), n).prop_map(
            |matrix| {
                matrix
                    .iter()
                    .enumerate()
                    .map(|(j, row)| (0..j).filter(|&i| row[i]).collect())
                    .collect()
            },
        )
    })
}

fn plan(protocol: Protocol, max_parallel: usize, deps: &[Vec<usize>]) -> PlanRequest {
    PlanRequest {
        project_id: "proj".to_string(),
        name: "random".to_string(),
        protocol,
        max_parallel,
        workspace: "/workspace".into(),
        ping_pong_max_rounds: None,
        consensus_max_rounds: None,
        round_timeout_secs: None,
        selection: Selection::Majority,
        steps: deps
            .iter()
            .enumerate()
            .map(|(j, deps)| PlanStepRequest {
                id: StepId::new(format!("s{j}")),
                task_id: format!("s{j}"),
                agent_id: "agent".to_string(),
                policy_profile: PLAN_READONLY.to_string(),
                execution_mode: Default::default(),
                deliver_mode: Default::default(),
                input: String::new(),
                depends_on: deps.iter().map(|i| StepId::new(format!("s{i}"))).collect(),
            })
            .collect(),
    }
}

struct Outcome {
    status: PlanStatus,
    violations: Vec<String>,
    dispatched: usize,
    max_in_flight: usize,
    all_completed: bool,
}

fn schedule(protocol: Protocol, max_parallel: usize, deps: &[Vec<usize>]) -> Outcome {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();
    runtime.block_on(async {
        let store: Arc<OnceLock<InMemoryStore>> = Arc::new(OnceLock::new());
        let violations = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = {
            let store = Arc::clone(&store);
            let violations = Arc::clone(&violations);
            FnDispatcher::with_delay(Duration::from_millis(5), move |request| {
                let steps = store.get().map(InMemoryStore::all_steps).unwrap_or_default();
                if let Some(step) = steps.iter().find(|s| s.task_id == request.task_id) {
                    for dep in &step.depends_on {
                        let satisfied = steps
                            .iter()
                            .any(|s| &s.id == dep && s.status == StepStatus::Completed);
                        if !satisfied {
                            violations
                                .lock()
                                .unwrap()
                                .push(format!("{} dispatched before {dep}", step.id));
                        }
                    }
                }
                Ok(done(&format!("{} done", request.task_id)))
            })
        };
        let harness = Harness::builder(dispatcher.clone()).build();
        store.set(harness.store.clone()).ok();
        let scheduler = harness.scheduler(16);

        let created = scheduler
            .create_plan(plan(protocol, max_parallel, deps))
            .await
            .unwrap();
        let finished = scheduler
            .run_plan(&created.id, CancellationToken::new())
            .await
            .unwrap();
        let steps = scheduler.list_steps(&created.id).await.unwrap();
        let violations = violations.lock().unwrap().clone();
        Outcome {
            status: finished.status,
            violations,
            dispatched: dispatcher.requests().len(),
            max_in_flight: dispatcher.max_in_flight(),
            all_completed: steps.iter().all(|s| s.status == StepStatus::Completed),
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn parallel_plans_respect_dependencies_and_width(
        deps in dag(),
        max_parallel in 1usize..4,
    ) {
        let outcome = schedule(Protocol::Parallel, max_parallel, &deps);
        prop_assert_eq!(outcome.status, PlanStatus::Completed);
        prop_assert!(outcome.violations.is_empty(), "{:?}", outcome.violations);
        prop_assert_eq!(outcome.dispatched, deps.len());
        prop_assert!(outcome.max_in_flight <= max_parallel);
        prop_assert!(outcome.all_completed);
    }

    #[test]
    fn sequential_plans_run_one_step_at_a_time(deps in dag()) {
        let outcome = schedule(Protocol::Sequential, 4, &deps);
        prop_assert_eq!(outcome.status, PlanStatus::Completed);
        prop_assert!(outcome.violations.is_empty(), "{:?}", outcome.violations);
        prop_assert_eq!(outcome.max_in_flight, 1);
        prop_assert_eq!(outcome.dispatched, deps.len());
    }
}
