//! Two steps alternate turns; each turn's output is the next turn's input.
//!
//! Turn `k` belongs to the first step (by creation order) when `k` is odd.
//! The exchange ends on a convergence signal or after `ping_pong_max_rounds`
//! turns, whichever comes first. There is never an extra turn.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::model::{ExecutionPlan, PlanStep};
use crate::core::types::{RunStatus, StepStatus};
use crate::scheduler::{
    PlanError, PlanOutcome, PlanScheduler, StepRun, round_deadline, step_status_for,
};

/// Input for turn `turn`: the step's own instructions plus the peer's last output.
fn turn_input(step: &PlanStep, previous: Option<&str>, turn: u32) -> String {
    match previous {
        None => step.input.clone(),
        Some(previous) => {
            let mut input = step.input.clone();
            if !input.is_empty() {
                input.push_str("\n\n");
            }
            input.push_str(&format!(
                "## Previous turn ({})\n{}",
                turn - 1,
                previous.trim()
            ));
            input
        }
    }
}

pub(crate) async fn run(
    scheduler: &PlanScheduler,
    plan: &ExecutionPlan,
    cancel: &CancellationToken,
) -> Result<PlanOutcome, PlanError> {
    let steps = scheduler.list_steps(&plan.id).await?;
    let [first, second] = steps.as_slice() else {
        return Err(PlanError::InvalidPlan(vec![format!(
            "ping_pong requires exactly 2 steps, found {}",
            steps.len()
        )]));
    };
    let max_rounds = plan.rounds.ping_pong_max_rounds;
    let mut previous: Option<String> = None;

    for turn in 1..=max_rounds {
        let (current, peer) = if turn % 2 == 1 {
            (first, second)
        } else {
            (second, first)
        };
        let input = turn_input(current, previous.as_deref(), turn);
        debug!(turn, step_id = %current.id, "ping_pong turn");
        let deadline = round_deadline(plan.rounds.round_timeout_secs);
        let (outcome, timed_out) = scheduler
            .execute_step_until(plan, &current.id, input, turn, cancel, deadline)
            .await?;

        let run = match outcome {
            StepRun::Finished(run) if run.status == RunStatus::Completed => run,
            StepRun::NotStarted if cancel.is_cancelled() => {
                return end_all(scheduler, plan, [first, second], StepStatus::Cancelled, None)
                    .await
                    .map(|()| PlanOutcome::cancelled());
            }
            StepRun::Finished(run) if cancel.is_cancelled() => {
                scheduler
                    .update_step(&plan.id, &current.id, |s| {
                        s.status = step_status_for(run.status);
                        s.error.clone_from(&run.error);
                    })
                    .await?;
                end_all(scheduler, plan, [peer], StepStatus::Cancelled, None).await?;
                return Ok(PlanOutcome::cancelled());
            }
            other => {
                let reason = match other {
                    _ if timed_out => format!("turn {turn} exceeded the round timeout"),
                    StepRun::Finished(run) => run
                        .error
                        .unwrap_or_else(|| format!("turn {turn} run {}", run.status)),
                    StepRun::Broken(message) => message,
                    StepRun::NotStarted => format!("turn {turn} never started"),
                };
                warn!(turn, step_id = %current.id, reason = %reason, "ping_pong turn failed");
                scheduler
                    .update_step(&plan.id, &current.id, |s| {
                        s.status = StepStatus::Failed;
                        s.error = Some(reason.clone());
                    })
                    .await?;
                end_all(
                    scheduler,
                    plan,
                    [peer],
                    StepStatus::Cancelled,
                    Some(format!("peer step {} failed", current.id)),
                )
                .await?;
                return Ok(PlanOutcome::failed(format!(
                    "step {} failed on turn {turn}: {reason}",
                    current.id
                )));
            }
        };

        let output = run.output.clone().unwrap_or_default();
        if run.converged {
            info!(turn, step_id = %current.id, "ping_pong converged");
            scheduler
                .update_step(&plan.id, &current.id, |s| {
                    s.status = StepStatus::Completed;
                    s.output = Some(output.clone());
                })
                .await?;
            scheduler
                .update_step(&plan.id, &peer.id, |s| s.status = StepStatus::Completed)
                .await?;
            return Ok(PlanOutcome::completed(Some(output)));
        }
        // Waits for its next turn.
        scheduler
            .update_step(&plan.id, &current.id, |s| {
                s.status = StepStatus::Pending;
                s.output = Some(output.clone());
            })
            .await?;
        previous = Some(output);
    }

    let limit = PlanError::RoundLimitExceeded { rounds: max_rounds };
    warn!(rounds = max_rounds, "ping_pong round limit exceeded");
    end_all(
        scheduler,
        plan,
        [first, second],
        StepStatus::Failed,
        Some(limit.to_string()),
    )
    .await?;
    Ok(PlanOutcome::failed(limit.to_string()))
}

async fn end_all<const N: usize>(
    scheduler: &PlanScheduler,
    plan: &ExecutionPlan,
    steps: [&PlanStep; N],
    status: StepStatus,
    error: Option<String>,
) -> Result<(), PlanError> {
    for step in steps {
        scheduler
            .update_step(&plan.id, &step.id, |s| {
                s.status = status;
                if error.is_some() {
                    s.error.clone_from(&error);
                }
            })
            .await?;
    }
    Ok(())
}
