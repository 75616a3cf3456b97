//! Plans under each coordination protocol, end to end on scripted workers.

use std::time::Duration;

use orchestrator::core::model::{ExecutionPlan, PlanRequest, PlanStep, PlanStepRequest, Selection};
use orchestrator::core::policy::PLAN_READONLY;
use orchestrator::core::types::{PlanStatus, Protocol, StepId, StepStatus};
use orchestrator::io::dispatch::DispatchError;
use orchestrator::scheduler::PlanScheduler;
use orchestrator::test_support::{FnDispatcher, Harness, done};
use tokio_util::sync::CancellationToken;

struct Step {
    id: &'static str,
    task: &'static str,
    agent: &'static str,
    deps: &'static [&'static str],
}

fn step(id: &'static str, deps: &'static [&'static str]) -> Step {
    Step {
        id,
        task: id,
        agent: "agent",
        deps,
    }
}

fn voter(id: &'static str, agent: &'static str) -> Step {
    Step {
        id,
        task: "solve",
        agent,
        deps: &[],
    }
}

fn plan_request(protocol: Protocol, max_parallel: usize, steps: &[Step]) -> PlanRequest {
    PlanRequest {
        project_id: "proj".to_string(),
        name: "plan".to_string(),
        protocol,
        max_parallel,
        workspace: "/workspace".into(),
        ping_pong_max_rounds: None,
        consensus_max_rounds: None,
        round_timeout_secs: None,
        selection: Selection::Majority,
        steps: steps
            .iter()
            .map(|s| PlanStepRequest {
                id: StepId::new(s.id),
                task_id: s.task.to_string(),
                agent_id: s.agent.to_string(),
                policy_profile: PLAN_READONLY.to_string(),
                execution_mode: Default::default(),
                deliver_mode: Default::default(),
                input: format!("work on {}", s.id),
                depends_on: s.deps.iter().map(|d| StepId::new(*d)).collect(),
            })
            .collect(),
    }
}

async fn run_to_end(scheduler: &PlanScheduler, request: PlanRequest) -> (ExecutionPlan, Vec<PlanStep>) {
    let plan = scheduler.create_plan(request).await.unwrap();
    let plan = scheduler
        .run_plan(&plan.id, CancellationToken::new())
        .await
        .unwrap();
    let steps = scheduler.list_steps(&plan.id).await.unwrap();
    (plan, steps)
}

fn status_of(steps: &[PlanStep], id: &str) -> StepStatus {
    steps
        .iter()
        .find(|s| s.id.as_str() == id)
        .map(|s| s.status)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn sequential_runs_one_step_at_a_time_in_creation_order() {
    let dispatcher = FnDispatcher::with_delay(Duration::from_millis(20), |r| {
        Ok(done(&format!("{} done", r.task_id)))
    });
    let harness = Harness::builder(dispatcher.clone()).build();
    let scheduler = harness.scheduler(8);

    let (plan, steps) = run_to_end(
        &scheduler,
        plan_request(
            Protocol::Sequential,
            4,
            &[step("a", &[]), step("b", &[]), step("c", &[])],
        ),
    )
    .await;

    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(dispatcher.max_in_flight(), 1);
    let order: Vec<String> = dispatcher.requests().into_iter().map(|r| r.task_id).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed && s.run_id.is_some()));
    assert_eq!(
        plan.output.as_deref(),
        Some("## a\na done\n\n## b\nb done\n\n## c\nc done")
    );
}

#[tokio::test(start_paused = true)]
async fn parallel_respects_max_parallel() {
    let dispatcher = FnDispatcher::with_delay(Duration::from_millis(20), |r| {
        Ok(done(&format!("{} done", r.task_id)))
    });
    let harness = Harness::builder(dispatcher.clone()).build();
    let scheduler = harness.scheduler(8);

    let (plan, _) = run_to_end(
        &scheduler,
        plan_request(
            Protocol::Parallel,
            2,
            &[step("a", &[]), step("b", &[]), step("c", &[]), step("d", &[])],
        ),
    )
    .await;

    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(dispatcher.max_in_flight(), 2);
    assert_eq!(dispatcher.requests().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn global_run_slots_cap_every_plan() {
    let dispatcher = FnDispatcher::with_delay(Duration::from_millis(20), |r| {
        Ok(done(&format!("{} done", r.task_id)))
    });
    let harness = Harness::builder(dispatcher.clone()).build();
    let scheduler = harness.scheduler(1);

    let first = scheduler
        .create_plan(plan_request(Protocol::Parallel, 3, &[step("a", &[]), step("b", &[])]))
        .await
        .unwrap();
    let second = scheduler
        .create_plan(plan_request(Protocol::Parallel, 3, &[step("c", &[]), step("d", &[])]))
        .await
        .unwrap();
    let one = scheduler.spawn_plan(first.id.clone(), CancellationToken::new());
    let two = scheduler.spawn_plan(second.id.clone(), CancellationToken::new());

    assert_eq!(one.await.unwrap().unwrap().status, PlanStatus::Completed);
    assert_eq!(two.await.unwrap().unwrap().status, PlanStatus::Completed);
    assert_eq!(dispatcher.max_in_flight(), 1);
}

#[tokio::test]
async fn failed_step_skips_dependents_and_fails_the_plan() {
    let dispatcher = FnDispatcher::new(|r| {
        if r.task_id == "build" {
            Err(DispatchError::Fatal("compiler crashed".to_string()))
        } else {
            Ok(done(&format!("{} done", r.task_id)))
        }
    });
    let harness = Harness::builder(dispatcher.clone()).build();
    let scheduler = harness.scheduler(8);

    let (plan, steps) = run_to_end(
        &scheduler,
        plan_request(
            Protocol::Parallel,
            2,
            &[
                step("build", &[]),
                step("docs", &[]),
                step("deploy", &["build"]),
            ],
        ),
    )
    .await;

    assert_eq!(plan.status, PlanStatus::Failed);
    assert!(plan.error.as_deref().unwrap().contains("build"));
    assert_eq!(status_of(&steps, "build"), StepStatus::Failed);
    assert_eq!(status_of(&steps, "docs"), StepStatus::Completed);
    assert_eq!(status_of(&steps, "deploy"), StepStatus::Skipped);
    assert!(dispatcher.requests().iter().all(|r| r.task_id != "deploy"));
}

#[tokio::test]
async fn ping_pong_stops_at_the_round_limit_without_an_extra_turn() {
    let dispatcher = FnDispatcher::new(|r| Ok(done(&format!("{} revised", r.task_id))));
    let harness = Harness::builder(dispatcher.clone()).build();
    let scheduler = harness.scheduler(8);
    let mut request = plan_request(
        Protocol::PingPong,
        1,
        &[step("writer", &[]), step("reviewer", &[])],
    );
    request.ping_pong_max_rounds = Some(3);

    let (plan, steps) = run_to_end(&scheduler, request).await;

    assert_eq!(plan.status, PlanStatus::Failed);
    assert!(plan.error.as_deref().unwrap().contains("round_limit_exceeded"));
    let turns: Vec<String> = dispatcher.requests().into_iter().map(|r| r.task_id).collect();
    assert_eq!(turns, vec!["writer", "reviewer", "writer"]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Failed));
}

#[tokio::test]
async fn ping_pong_completes_on_convergence() {
    let dispatcher = FnDispatcher::new(|r| {
        if r.task_id == "reviewer" {
            Ok(done("looks good").converging())
        } else {
            Ok(done("draft v1"))
        }
    });
    let harness = Harness::builder(dispatcher.clone()).build();
    let scheduler = harness.scheduler(8);

    let (plan, steps) = run_to_end(
        &scheduler,
        plan_request(
            Protocol::PingPong,
            1,
            &[step("writer", &[]), step("reviewer", &[])],
        ),
    )
    .await;

    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.output.as_deref(), Some("looks good"));
    let requests = dispatcher.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].context.contains("## Previous turn (1)\ndraft v1"));
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    let reviewer = steps.iter().find(|s| s.id.as_str() == "reviewer").unwrap();
    assert_eq!(reviewer.round, 2);
}

#[tokio::test(start_paused = true)]
async fn ping_pong_turn_past_the_round_timeout_fails_the_plan() {
    let dispatcher = FnDispatcher::with_delay(Duration::from_secs(3), |_| Ok(done("slow")));
    let harness = Harness::builder(dispatcher).build();
    let scheduler = harness.scheduler(8);
    let mut request = plan_request(
        Protocol::PingPong,
        1,
        &[step("writer", &[]), step("reviewer", &[])],
    );
    request.round_timeout_secs = Some(1);

    let (plan, steps) = run_to_end(&scheduler, request).await;

    assert_eq!(plan.status, PlanStatus::Failed);
    assert_eq!(status_of(&steps, "writer"), StepStatus::Failed);
    assert_eq!(status_of(&steps, "reviewer"), StepStatus::Cancelled);
    let writer = steps.iter().find(|s| s.id.as_str() == "writer").unwrap();
    assert!(writer.error.as_deref().unwrap().contains("round timeout"));
}

#[tokio::test]
async fn unbounded_round_timeout_does_not_overflow_the_deadline() {
    let dispatcher = FnDispatcher::new(|r| {
        if r.task_id == "reviewer" {
            Ok(done("ship it").converging())
        } else {
            Ok(done("draft"))
        }
    });
    let harness = Harness::builder(dispatcher).build();
    let scheduler = harness.scheduler(8);
    let mut ping_pong = plan_request(
        Protocol::PingPong,
        1,
        &[step("writer", &[]), step("reviewer", &[])],
    );
    ping_pong.round_timeout_secs = Some(u64::MAX);
    let (plan, _) = run_to_end(&scheduler, ping_pong).await;
    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.output.as_deref(), Some("ship it"));

    let mut consensus = plan_request(
        Protocol::Consensus,
        2,
        &[voter("a", "alpha"), voter("b", "beta")],
    );
    consensus.round_timeout_secs = Some(u64::MAX);
    let (plan, _) = run_to_end(&scheduler, consensus).await;
    assert_eq!(plan.status, PlanStatus::Completed);
}

#[tokio::test]
async fn consensus_takes_the_strict_majority() {
    let dispatcher = FnDispatcher::new(|r| match r.agent_id.as_str() {
        "gamma" => Ok(done("answer: 41")),
        _ => Ok(done("answer: 42\n")),
    });
    let harness = Harness::builder(dispatcher.clone()).build();
    let scheduler = harness.scheduler(8);

    let (plan, steps) = run_to_end(
        &scheduler,
        plan_request(
            Protocol::Consensus,
            3,
            &[
                voter("a", "alpha"),
                voter("b", "beta"),
                voter("c", "gamma"),
            ],
        ),
    )
    .await;

    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.output.as_deref(), Some("answer: 42\n"));
    assert_eq!(dispatcher.requests().len(), 3);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
}

#[tokio::test]
async fn consensus_participants_keep_their_own_outcome_when_a_winner_is_picked() {
    let dispatcher = FnDispatcher::new(|r| match r.agent_id.as_str() {
        "gamma" => Err(DispatchError::Fatal("model unavailable".to_string())),
        _ => Ok(done("answer: 42")),
    });
    let harness = Harness::builder(dispatcher).build();
    let scheduler = harness.scheduler(8);

    let (plan, steps) = run_to_end(
        &scheduler,
        plan_request(
            Protocol::Consensus,
            3,
            &[
                voter("a", "alpha"),
                voter("b", "beta"),
                voter("c", "gamma"),
            ],
        ),
    )
    .await;

    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.output.as_deref(), Some("answer: 42"));
    assert_eq!(status_of(&steps, "a"), StepStatus::Completed);
    assert_eq!(status_of(&steps, "b"), StepStatus::Completed);
    assert_eq!(status_of(&steps, "c"), StepStatus::Failed);
    let failed = steps.iter().find(|s| s.id.as_str() == "c").unwrap();
    assert!(failed.error.as_deref().unwrap().contains("model unavailable"));
    assert!(failed.output.is_none());
}

#[tokio::test]
async fn consensus_without_majority_fails_after_the_round_limit() {
    let dispatcher = FnDispatcher::new(|r| Ok(done(&format!("{} thinks otherwise", r.agent_id))));
    let harness = Harness::builder(dispatcher.clone()).build();
    let scheduler = harness.scheduler(8);
    let mut request = plan_request(
        Protocol::Consensus,
        3,
        &[
            voter("a", "alpha"),
            voter("b", "beta"),
            voter("c", "gamma"),
        ],
    );
    request.consensus_max_rounds = Some(2);

    let (plan, steps) = run_to_end(&scheduler, request).await;

    assert_eq!(plan.status, PlanStatus::Failed);
    assert!(plan.error.as_deref().unwrap().contains("no_consensus"));
    assert_eq!(dispatcher.requests().len(), 6);
    assert!(steps.iter().all(|s| s.status == StepStatus::Failed && s.round == 2));
}

#[tokio::test]
async fn consensus_arbiter_picks_a_candidate() {
    let dispatcher = FnDispatcher::new(|r| match r.agent_id.as_str() {
        "judge" => Ok(done("Candidate 2 is the most complete.")),
        other => Ok(done(&format!("plan by {other}"))),
    });
    let harness = Harness::builder(dispatcher.clone()).build();
    let scheduler = harness.scheduler(8);
    let mut request = plan_request(
        Protocol::Consensus,
        2,
        &[voter("a", "alpha"), voter("b", "beta")],
    );
    request.selection = Selection::Arbiter {
        agent_id: "judge".to_string(),
        policy_profile: PLAN_READONLY.to_string(),
    };

    let (plan, _) = run_to_end(&scheduler, request).await;

    assert_eq!(plan.status, PlanStatus::Completed);
    let requests = dispatcher.requests();
    let judge = requests.iter().find(|r| r.agent_id == "judge").unwrap();
    assert!(judge.context.contains("plan by alpha"));
    assert!(judge.context.contains("plan by beta"));
    assert_eq!(plan.output.as_deref(), Some("plan by beta"));
    assert_eq!(requests.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_plan_cancels_running_and_pending_steps() {
    let dispatcher = FnDispatcher::with_delay(Duration::from_secs(2), |r| {
        Ok(done(&format!("{} done", r.task_id)))
    });
    let harness = Harness::builder(dispatcher.clone()).build();
    let scheduler = harness.scheduler(8);
    let plan = scheduler
        .create_plan(plan_request(
            Protocol::Parallel,
            1,
            &[step("a", &[]), step("b", &[]), step("c", &["a"])],
        ))
        .await
        .unwrap();
    let handle = scheduler.spawn_plan(plan.id.clone(), CancellationToken::new());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(scheduler.cancel_plan(&plan.id));
    let plan = handle.await.unwrap().unwrap();
    let steps = scheduler.list_steps(&plan.id).await.unwrap();

    assert_eq!(plan.status, PlanStatus::Cancelled);
    assert!(steps.iter().all(|s| s.status == StepStatus::Cancelled));
    assert_eq!(dispatcher.requests().len(), 1);
    let first = steps.iter().find(|s| s.id.as_str() == "a").unwrap();
    let run_id = first.run_id.clone().unwrap();
    assert!(harness.event_names(&run_id).contains(&"step_result_discarded"));
    assert!(!scheduler.cancel_plan(&plan.id));
}
