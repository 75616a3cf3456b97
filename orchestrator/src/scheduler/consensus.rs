//! N steps run the same task; a selection picks one winning output.
//!
//! Each round launches every step (at most `max_parallel` at a time) under a
//! shared round deadline. The winner is chosen by strict majority over output
//! signatures or by an arbiter run. Without a winner the next round starts;
//! after `consensus_max_rounds` every step fails with `no_consensus`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::consensus::{Candidate, arbiter_prompt, parse_arbiter_choice, select_majority};
use crate::core::model::{ExecutionPlan, PlanStep, RunSpec, Selection};
use crate::core::types::{RunStatus, StepId, StepStatus};
use crate::scheduler::{PlanError, PlanOutcome, PlanScheduler, StepRun, round_deadline};

/// What one step produced in a round.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Ballot {
    Output(String),
    Failed(String),
    Cancelled,
}

pub(crate) async fn run(
    scheduler: &PlanScheduler,
    plan: &ExecutionPlan,
    cancel: &CancellationToken,
) -> Result<PlanOutcome, PlanError> {
    let steps = scheduler.list_steps(&plan.id).await?;
    let max_rounds = plan.rounds.consensus_max_rounds;

    for round in 1..=max_rounds {
        let deadline = round_deadline(plan.rounds.round_timeout_secs);
        let ballots = run_round(scheduler, plan, &steps, round, cancel, deadline).await?;

        if cancel.is_cancelled() {
            for step in &steps {
                scheduler
                    .update_step(&plan.id, &step.id, |s| s.status = StepStatus::Cancelled)
                    .await?;
            }
            return Ok(PlanOutcome::cancelled());
        }

        let candidates: Vec<Candidate> = steps
            .iter()
            .filter_map(|step| match ballots.get(&step.id) {
                Some(Ballot::Output(output)) => Some(Candidate {
                    step_id: step.id.clone(),
                    output: output.clone(),
                }),
                _ => None,
            })
            .collect();
        debug!(round, candidates = candidates.len(), participants = steps.len(), "consensus round finished");

        let winner = select(scheduler, plan, &steps, &candidates, cancel).await?;
        if let Some(winner) = winner {
            info!(round, step_id = %winner.step_id, "consensus reached");
            for step in &steps {
                let ballot = ballots.get(&step.id).cloned();
                scheduler
                    .update_step(&plan.id, &step.id, |s| match &ballot {
                        Some(Ballot::Output(output)) => {
                            s.status = StepStatus::Completed;
                            s.output = Some(output.clone());
                            s.error = None;
                        }
                        Some(Ballot::Failed(error)) => {
                            s.status = StepStatus::Failed;
                            s.error = Some(error.clone());
                        }
                        Some(Ballot::Cancelled) | None => s.status = StepStatus::Cancelled,
                    })
                    .await?;
            }
            return Ok(PlanOutcome::completed(Some(winner.output)));
        }

        warn!(round, max_rounds, "no consensus this round");
        for step in &steps {
            let ballot = ballots.get(&step.id).cloned();
            scheduler
                .update_step(&plan.id, &step.id, |s| {
                    s.status = StepStatus::Pending;
                    match &ballot {
                        Some(Ballot::Output(output)) => s.output = Some(output.clone()),
                        Some(Ballot::Failed(error)) => s.error = Some(error.clone()),
                        Some(Ballot::Cancelled) | None => {}
                    }
                })
                .await?;
        }
    }

    if cancel.is_cancelled() {
        for step in &steps {
            scheduler
                .update_step(&plan.id, &step.id, |s| s.status = StepStatus::Cancelled)
                .await?;
        }
        return Ok(PlanOutcome::cancelled());
    }
    let no_consensus = PlanError::NoConsensus { rounds: max_rounds };
    for step in &steps {
        scheduler
            .update_step(&plan.id, &step.id, |s| {
                s.status = StepStatus::Failed;
                s.error = Some(no_consensus.to_string());
            })
            .await?;
    }
    Ok(PlanOutcome::failed(no_consensus.to_string()))
}

async fn run_round(
    scheduler: &PlanScheduler,
    plan: &ExecutionPlan,
    steps: &[PlanStep],
    round: u32,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<HashMap<StepId, Ballot>, PlanError> {
    let width = Arc::new(Semaphore::new(plan.max_parallel.max(1)));
    let round_cancel = cancel.child_token();
    let mut running: JoinSet<(StepId, Result<(StepRun, bool), PlanError>)> = JoinSet::new();

    for step in steps {
        let scheduler = scheduler.clone();
        let plan = plan.clone();
        let step_id = step.id.clone();
        let input = step.input.clone();
        let width = Arc::clone(&width);
        let round_cancel = round_cancel.clone();
        running.spawn(async move {
            let permit = tokio::select! {
                biased;
                () = round_cancel.cancelled() => None,
                () = tokio::time::sleep_until(deadline) => None,
                permit = width.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                return (step_id, Ok((StepRun::NotStarted, true)));
            };
            let result = scheduler
                .execute_step_until(&plan, &step_id, input, round, &round_cancel, deadline)
                .await;
            (step_id, result)
        });
    }

    let mut ballots = HashMap::new();
    while let Some(joined) = running.join_next().await {
        let (step_id, result) = joined.map_err(|err| PlanError::Join(err.to_string()))?;
        let ballot = match result? {
            (StepRun::Finished(run), _) if run.status == RunStatus::Completed => {
                Ballot::Output(run.output.unwrap_or_default())
            }
            (_, true) => Ballot::Failed(format!("round {round} timed out")),
            (StepRun::Finished(run), false) if run.status == RunStatus::Cancelled => {
                Ballot::Cancelled
            }
            (StepRun::Finished(run), false) => Ballot::Failed(
                run.error
                    .unwrap_or_else(|| format!("run {}", run.status)),
            ),
            (StepRun::Broken(message), false) => Ballot::Failed(message),
            (StepRun::NotStarted, false) => Ballot::Cancelled,
        };
        if let Ballot::Failed(reason) = &ballot {
            warn!(round, step_id = %step_id, reason = %reason, "consensus participant produced no output");
        }
        ballots.insert(step_id, ballot);
    }
    Ok(ballots)
}

async fn select(
    scheduler: &PlanScheduler,
    plan: &ExecutionPlan,
    steps: &[PlanStep],
    candidates: &[Candidate],
    cancel: &CancellationToken,
) -> Result<Option<Candidate>, PlanError> {
    match &plan.rounds.selection {
        Selection::Majority => Ok(select_majority(candidates, steps.len()).cloned()),
        Selection::Arbiter {
            agent_id,
            policy_profile,
        } => {
            if candidates.is_empty() {
                return Ok(None);
            }
            let Some(first) = steps.first() else {
                return Ok(None);
            };
            let spec = RunSpec {
                project_id: plan.project_id.clone(),
                task_id: first.task_id.clone(),
                agent_id: agent_id.clone(),
                policy_profile: policy_profile.clone(),
                execution_mode: first.execution_mode,
                deliver_mode: first.deliver_mode,
                workspace: plan.workspace.clone(),
                input: arbiter_prompt(&first.input, candidates),
            };
            let Some(run) = scheduler.execute_extra(spec, cancel).await? else {
                return Ok(None);
            };
            if run.status != RunStatus::Completed {
                warn!(run_id = %run.id, status = %run.status, "arbiter run did not complete");
                return Ok(None);
            }
            let choice = run
                .output
                .as_deref()
                .and_then(|output| parse_arbiter_choice(output, candidates.len()));
            match choice {
                Some(index) => Ok(candidates.get(index).cloned()),
                None => {
                    warn!(run_id = %run.id, "arbiter reply named no candidate");
                    Ok(None)
                }
            }
        }
    }
}
