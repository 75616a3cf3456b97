//! Multi-agent plan scheduling.
//!
//! A plan is a DAG of steps; each launched step becomes a run driven by the
//! [`RunStateMachine`]. `sequential` and `parallel` plans walk the DAG here;
//! the turn-based protocols live in [`ping_pong`] and [`consensus`].
//!
//! Concurrency is bounded twice: `max_parallel` per plan and a process-wide
//! run slot semaphore shared by every plan.

pub mod consensus;
pub mod ping_pong;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::dag::{dependency_input, ready_steps, sink_steps, validate_plan};
use crate::core::model::{ExecutionPlan, PlanRequest, PlanStep, RoundConfig, Run, RunSpec};
use crate::core::types::{PlanId, PlanStatus, Protocol, RunStatus, StepId, StepStatus};
use crate::io::config::PlanConfig;
use crate::io::store::{Store, StoreError};
use crate::retry::{RetryPolicy, Retryable, update_plan, update_step};
use crate::run::{RunError, RunStateMachine};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid plan: {}", .0.join("; "))]
    InvalidPlan(Vec<String>),
    #[error("no_consensus: no winner after {rounds} rounds")]
    NoConsensus { rounds: u32 },
    #[error("round_limit_exceeded: no convergence after {rounds} turns")]
    RoundLimitExceeded { rounds: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("step task failed: {0}")]
    Join(String),
    #[error("run slots closed")]
    Closed,
    #[error("plan {0} is already running")]
    AlreadyActive(PlanId),
    #[error("plan {id} is {status}; only pending plans can run")]
    NotPending { id: PlanId, status: PlanStatus },
}

impl Retryable for PlanError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }
}

/// How a launched step ended.
#[derive(Debug)]
pub(crate) enum StepRun {
    /// The run reached a terminal status.
    Finished(Run),
    /// The run could not be driven at all.
    Broken(String),
    /// Cancelled (or out of time) before a run slot was free.
    NotStarted,
}

/// Terminal plan status with its output or reason.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlanOutcome {
    pub status: PlanStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl PlanOutcome {
    pub fn completed(output: Option<String>) -> Self {
        Self {
            status: PlanStatus::Completed,
            output,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: PlanStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: PlanStatus::Cancelled,
            output: None,
            error: Some("cancelled".to_string()),
        }
    }
}

#[derive(Clone)]
pub struct PlanScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    machine: RunStateMachine,
    store: Arc<dyn Store>,
    slots: Semaphore,
    defaults: PlanConfig,
    retry: RetryPolicy,
    active: Mutex<HashMap<PlanId, CancellationToken>>,
}

struct ActivePlan<'a> {
    active: &'a Mutex<HashMap<PlanId, CancellationToken>>,
    plan_id: PlanId,
}

impl Drop for ActivePlan<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.plan_id);
    }
}

impl PlanScheduler {
    /// `max_concurrent_runs` caps runs across every plan this scheduler drives.
    pub fn new(machine: RunStateMachine, defaults: PlanConfig, max_concurrent_runs: usize) -> Self {
        let store = machine.store().clone();
        let retry = machine.settings().retry;
        Self {
            inner: Arc::new(SchedulerInner {
                machine,
                store,
                slots: Semaphore::new(max_concurrent_runs.max(1)),
                defaults,
                retry,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn machine(&self) -> &RunStateMachine {
        &self.inner.machine
    }

    /// Validate and persist a plan. Nothing runs until [`Self::run_plan`].
    #[instrument(skip_all, fields(name = %request.name, protocol = request.protocol.as_str()))]
    pub async fn create_plan(&self, request: PlanRequest) -> Result<ExecutionPlan, PlanError> {
        let problems = validate_plan(&request);
        if !problems.is_empty() {
            warn!(problems = problems.len(), "rejected invalid plan");
            return Err(PlanError::InvalidPlan(problems));
        }
        let defaults = &self.inner.defaults;
        let plan = ExecutionPlan {
            id: PlanId::generate(),
            project_id: request.project_id,
            name: request.name,
            protocol: request.protocol,
            max_parallel: request.max_parallel,
            workspace: request.workspace,
            rounds: RoundConfig {
                ping_pong_max_rounds: request
                    .ping_pong_max_rounds
                    .unwrap_or(defaults.ping_pong_max_rounds),
                consensus_max_rounds: request
                    .consensus_max_rounds
                    .unwrap_or(defaults.consensus_max_rounds),
                round_timeout_secs: request
                    .round_timeout_secs
                    .unwrap_or(defaults.round_timeout_secs),
                selection: request.selection,
            },
            status: PlanStatus::Pending,
            output: None,
            error: None,
            version: 0,
        };
        let steps: Vec<PlanStep> = request
            .steps
            .into_iter()
            .enumerate()
            .map(|(position, step)| PlanStep {
                id: step.id,
                plan_id: plan.id.clone(),
                position: u32::try_from(position).unwrap_or(u32::MAX),
                task_id: step.task_id,
                agent_id: step.agent_id,
                policy_profile: step.policy_profile,
                execution_mode: step.execution_mode,
                deliver_mode: step.deliver_mode,
                input: step.input,
                depends_on: step.depends_on,
                round: 0,
                status: StepStatus::Pending,
                run_id: None,
                output: None,
                error: None,
                version: 0,
            })
            .collect();
        self.inner.store.insert_plan(&plan, &steps).await?;
        info!(plan_id = %plan.id, steps = steps.len(), "plan created");
        Ok(plan)
    }

    pub async fn get_plan(&self, plan_id: &PlanId) -> Result<ExecutionPlan, PlanError> {
        Ok(self.inner.store.get_plan(plan_id).await?)
    }

    pub async fn list_steps(&self, plan_id: &PlanId) -> Result<Vec<PlanStep>, PlanError> {
        Ok(self.inner.store.list_steps(plan_id).await?)
    }

    /// Cancel a running plan and, through child tokens, all of its runs.
    pub fn cancel_plan(&self, plan_id: &PlanId) -> bool {
        let active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match active.get(plan_id) {
            Some(token) => {
                token.cancel();
                info!(plan_id = %plan_id, "plan cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn spawn_plan(
        &self,
        plan_id: PlanId,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<ExecutionPlan, PlanError>> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run_plan(&plan_id, cancel).await })
    }

    /// Drive a pending plan to `completed`, `failed` or `cancelled`.
    #[instrument(skip_all, fields(plan_id = %plan_id))]
    pub async fn run_plan(
        &self,
        plan_id: &PlanId,
        cancel: CancellationToken,
    ) -> Result<ExecutionPlan, PlanError> {
        let _active = self.register(plan_id, &cancel)?;
        let plan = self.inner.store.get_plan(plan_id).await?;
        if plan.status != PlanStatus::Pending {
            return Err(PlanError::NotPending {
                id: plan.id,
                status: plan.status,
            });
        }
        let plan = self
            .set_plan(plan_id, |p| p.status = PlanStatus::Running)
            .await?;
        info!(protocol = plan.protocol.as_str(), max_parallel = plan.max_parallel, "plan started");

        let outcome = match plan.protocol {
            Protocol::Sequential => self.run_dag(&plan, 1, &cancel).await,
            Protocol::Parallel => self.run_dag(&plan, plan.max_parallel.max(1), &cancel).await,
            Protocol::PingPong => ping_pong::run(self, &plan, &cancel).await,
            Protocol::Consensus => consensus::run(self, &plan, &cancel).await,
        };

        match outcome {
            Ok(outcome) => {
                let plan = self
                    .set_plan(plan_id, |p| {
                        p.status = outcome.status;
                        p.output.clone_from(&outcome.output);
                        p.error.clone_from(&outcome.error);
                    })
                    .await?;
                info!(status = %plan.status, "plan finished");
                Ok(plan)
            }
            Err(err) => {
                let message = err.to_string();
                let marked = self
                    .set_plan(plan_id, |p| {
                        p.status = PlanStatus::Failed;
                        p.error = Some(message.clone());
                    })
                    .await;
                if let Err(mark_err) = marked {
                    error!(err = %mark_err, cause = %message, "could not mark plan failed");
                }
                Err(err)
            }
        }
    }

    fn register(
        &self,
        plan_id: &PlanId,
        cancel: &CancellationToken,
    ) -> Result<ActivePlan<'_>, PlanError> {
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(plan_id) {
            return Err(PlanError::AlreadyActive(plan_id.clone()));
        }
        active.insert(plan_id.clone(), cancel.clone());
        Ok(ActivePlan {
            active: &self.inner.active,
            plan_id: plan_id.clone(),
        })
    }

    /// Walk the DAG with at most `limit` steps in flight.
    async fn run_dag(
        &self,
        plan: &ExecutionPlan,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<PlanOutcome, PlanError> {
        let mut running: JoinSet<(StepId, Result<StepRun, PlanError>)> = JoinSet::new();
        let mut in_flight: HashSet<StepId> = HashSet::new();
        let mut failure: Option<String> = None;

        loop {
            if failure.is_none() && !cancel.is_cancelled() {
                let steps = self.inner.store.list_steps(&plan.id).await?;
                for step in ready_steps(&steps) {
                    if in_flight.len() >= limit {
                        break;
                    }
                    if in_flight.contains(&step.id) {
                        continue;
                    }
                    let input = dependency_input(step, &steps);
                    let scheduler = self.clone();
                    let plan = plan.clone();
                    let step_id = step.id.clone();
                    let cancel = cancel.clone();
                    debug!(step_id = %step_id, "launching step");
                    in_flight.insert(step_id.clone());
                    running.spawn(async move {
                        let result = scheduler
                            .execute_step(&plan, &step_id, input, 1, &cancel)
                            .await;
                        (step_id, result)
                    });
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (step_id, result) = joined.map_err(|err| PlanError::Join(err.to_string()))?;
            in_flight.remove(&step_id);
            let status = self.record_step_run(&plan.id, &step_id, result?).await?;
            if status != StepStatus::Completed && failure.is_none() && !cancel.is_cancelled() {
                warn!(step_id = %step_id, %status, "step did not complete; no new steps will launch");
                failure = Some(format!("step {step_id} {status}"));
            }
        }

        let steps = self.inner.store.list_steps(&plan.id).await?;
        if cancel.is_cancelled() {
            self.close_pending(&plan.id, &steps, StepStatus::Cancelled)
                .await?;
            return Ok(PlanOutcome::cancelled());
        }
        if let Some(failure) = failure {
            self.close_pending(&plan.id, &steps, StepStatus::Skipped)
                .await?;
            return Ok(PlanOutcome::failed(failure));
        }
        if steps.iter().any(|s| s.status != StepStatus::Completed) {
            return Ok(PlanOutcome::failed("steps left unscheduled"));
        }
        Ok(PlanOutcome::completed(Some(sink_output(&steps))))
    }

    /// Store a finished step's terminal status and return it.
    async fn record_step_run(
        &self,
        plan_id: &PlanId,
        step_id: &StepId,
        run: StepRun,
    ) -> Result<StepStatus, PlanError> {
        let (status, output, error) = match run {
            StepRun::Finished(run) => (step_status_for(run.status), run.output, run.error),
            StepRun::Broken(message) => (StepStatus::Failed, None, Some(message)),
            StepRun::NotStarted => (StepStatus::Cancelled, None, Some("cancelled".to_string())),
        };
        self.update_step(plan_id, step_id, |s| {
            s.status = status;
            s.output.clone_from(&output);
            s.error.clone_from(&error);
        })
        .await?;
        Ok(status)
    }

    /// Move every still-pending step to `status`.
    pub(crate) async fn close_pending(
        &self,
        plan_id: &PlanId,
        steps: &[PlanStep],
        status: StepStatus,
    ) -> Result<(), PlanError> {
        for step in steps.iter().filter(|s| s.status == StepStatus::Pending) {
            self.update_step(plan_id, &step.id, |s| {
                if s.status == StepStatus::Pending {
                    s.status = status;
                }
            })
            .await?;
        }
        Ok(())
    }

    /// Launch one run for `step_id` and wait for it to finish.
    ///
    /// Waits for a global run slot first; a cancel while waiting returns
    /// [`StepRun::NotStarted`] without touching the step.
    pub(crate) async fn execute_step(
        &self,
        plan: &ExecutionPlan,
        step_id: &StepId,
        input: String,
        round: u32,
        cancel: &CancellationToken,
    ) -> Result<StepRun, PlanError> {
        let _slot = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(StepRun::NotStarted),
            permit = self.inner.slots.acquire() => permit.map_err(|_| PlanError::Closed)?,
        };
        let step = self.inner.store.get_step(&plan.id, step_id).await?;
        let run = self
            .inner
            .machine
            .submit(RunSpec {
                project_id: plan.project_id.clone(),
                task_id: step.task_id.clone(),
                agent_id: step.agent_id.clone(),
                policy_profile: step.policy_profile.clone(),
                execution_mode: step.execution_mode,
                deliver_mode: step.deliver_mode,
                workspace: plan.workspace.clone(),
                input,
            })
            .await?;
        let run_id = run.id.clone();
        self.update_step(&plan.id, step_id, |s| {
            s.status = StepStatus::Running;
            s.run_id = Some(run_id.clone());
            s.round = round;
            s.error = None;
        })
        .await?;
        debug!(step_id = %step_id, run_id = %run.id, round, "step running");

        match self.inner.machine.execute(&run.id, cancel.child_token()).await {
            Ok(run) => Ok(StepRun::Finished(run)),
            Err(err) => {
                warn!(step_id = %step_id, run_id = %run_id, err = %err, "run could not be driven");
                Ok(StepRun::Broken(err.to_string()))
            }
        }
    }

    /// [`Self::execute_step`] bounded by a round deadline. At the deadline the
    /// run is cancelled and awaited; the flag reports whether that happened.
    pub(crate) async fn execute_step_until(
        &self,
        plan: &ExecutionPlan,
        step_id: &StepId,
        input: String,
        round: u32,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(StepRun, bool), PlanError> {
        let turn = cancel.child_token();
        let execution = self.execute_step(plan, step_id, input, round, &turn);
        tokio::pin!(execution);
        tokio::select! {
            result = &mut execution => Ok((result?, false)),
            () = tokio::time::sleep_until(deadline) => {
                warn!(step_id = %step_id, round, "round deadline reached; cancelling step");
                turn.cancel();
                Ok((execution.await?, true))
            }
        }
    }

    /// Run an ad-hoc run that belongs to the plan but to no step (arbiters).
    pub(crate) async fn execute_extra(
        &self,
        spec: RunSpec,
        cancel: &CancellationToken,
    ) -> Result<Option<Run>, PlanError> {
        let _slot = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            permit = self.inner.slots.acquire() => permit.map_err(|_| PlanError::Closed)?,
        };
        let run = self.inner.machine.submit(spec).await?;
        Ok(Some(
            self.inner
                .machine
                .execute(&run.id, cancel.child_token())
                .await?,
        ))
    }

    pub(crate) async fn update_step<F>(
        &self,
        plan_id: &PlanId,
        step_id: &StepId,
        mutate: F,
    ) -> Result<PlanStep, PlanError>
    where
        F: Fn(&mut PlanStep) + Sync,
    {
        update_step(
            self.inner.store.as_ref(),
            &self.inner.retry,
            plan_id,
            step_id,
            |s: &mut PlanStep| -> Result<(), PlanError> {
                mutate(s);
                Ok(())
            },
        )
        .await
    }

    async fn set_plan<F>(&self, plan_id: &PlanId, mutate: F) -> Result<ExecutionPlan, PlanError>
    where
        F: Fn(&mut ExecutionPlan) + Sync,
    {
        update_plan(
            self.inner.store.as_ref(),
            &self.inner.retry,
            plan_id,
            |p: &mut ExecutionPlan| -> Result<(), PlanError> {
                mutate(p);
                Ok(())
            },
        )
        .await
    }
}

/// Upper bound on a round deadline; larger timeouts mean "no timeout".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline for a round that starts now. Saturates instead of overflowing
/// `Instant` for very large timeouts.
pub(crate) fn round_deadline(timeout_secs: u64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_secs(timeout_secs).min(FAR_FUTURE))
        .unwrap_or(now)
}

pub(crate) fn step_status_for(status: RunStatus) -> StepStatus {
    match status {
        RunStatus::Completed => StepStatus::Completed,
        RunStatus::Cancelled => StepStatus::Cancelled,
        _ => StepStatus::Failed,
    }
}

/// Plan output: the single sink's output, or every sink's output under a heading.
fn sink_output(steps: &[PlanStep]) -> String {
    let sinks = sink_steps(steps);
    if let [only] = sinks.as_slice() {
        return only.output.clone().unwrap_or_default();
    }
    sinks
        .iter()
        .map(|s| format!("## {}\n{}", s.id, s.output.as_deref().unwrap_or("").trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
