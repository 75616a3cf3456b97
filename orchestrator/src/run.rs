//! Run execution state machine.
//!
//! A run moves `pending -> running -> {awaiting_approval <-> running} ->
//! completed | failed | cancelled`. Each step is checkpointed, dispatched,
//! passed through the policy and safety gates, and (when the agent claims
//! completion) verified by the profile's quality gates. Every outcome is
//! appended to the event log before the store update it describes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::CheckpointManager;
use crate::core::events::{EventKind, NewEvent, RunEvent};
use crate::core::model::{Checkpoint, Run, RunSpec};
use crate::core::policy::{CompiledProfile, Decision, DecisionKind, evaluate};
use crate::core::safety::{SafetyMonitor, SafetyState, Verdict, output_hash};
use crate::core::transitions::{TransitionError, can_retry, validate_transition};
use crate::core::types::{ApprovalDecision, RunId, RunStatus, ToolCall};
use crate::io::approval::{ApprovalChannel, ApprovalRequest};
use crate::io::config::OrchestratorConfig;
use crate::io::context::{ContextError, StepContextBuilder, StepContextInputs};
use crate::io::dispatch::{DispatchError, StepDispatcher, StepRequest, StepResult, ToolFeedback};
use crate::io::event_log::{EventLog, EventLogError};
use crate::io::gates::{GateOutcome, QualityGateRunner};
use crate::io::profiles::ProfileSource;
use crate::io::store::{Store, StoreError};
use crate::retry::{RetryPolicy, Retryable, update_run, with_backoff};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("event log: {0}")]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("run {id} is {status}; only failed runs can be retried")]
    NotRetryable { id: RunId, status: RunStatus },
    #[error("run {0} is already executing")]
    AlreadyActive(RunId),
}

impl Retryable for RunError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }
}

/// Timeouts and retry ceilings for the step loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub step_timeout: Duration,
    /// `None` waits for an operator indefinitely.
    pub approval_timeout: Option<Duration>,
    /// Failed quality-gate attempts tolerated before the run fails.
    pub max_gate_retries: u32,
    pub retry: RetryPolicy,
    pub context_budget_bytes: usize,
}

impl RunSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            step_timeout: config.step_timeout(),
            approval_timeout: config.approval_timeout(),
            max_gate_retries: config.max_gate_retries,
            retry: RetryPolicy::from(&config.retry),
            context_budget_bytes: config.context.budget_bytes,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Collaborators a run needs. Cloning shares them.
#[derive(Clone)]
pub struct RunServices {
    pub store: Arc<dyn Store>,
    pub events: Arc<dyn EventLog>,
    pub dispatcher: Arc<dyn StepDispatcher>,
    pub approvals: Arc<dyn ApprovalChannel>,
    pub gates: Arc<dyn QualityGateRunner>,
    pub profiles: Arc<dyn ProfileSource>,
    pub checkpoints: CheckpointManager,
    /// Process-wide ceilings; each run tightens them with its profile.
    pub safety: SafetyMonitor,
}

/// Drives runs through their step loop. Cheap to clone.
#[derive(Clone)]
pub struct RunStateMachine {
    inner: Arc<Inner>,
}

struct Inner {
    services: RunServices,
    settings: RunSettings,
    context: StepContextBuilder,
    active: Mutex<HashMap<RunId, CancellationToken>>,
}

/// Removes a run from the active table when its execution ends.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<RunId, CancellationToken>>,
    run_id: RunId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

/// Counters flushed to the run record on a status change.
#[derive(Debug, Clone, Default)]
struct Progress {
    steps: u32,
    cost_usd: f64,
    converged: bool,
    output: Option<String>,
}

/// In-memory state of one executing run.
struct Execution {
    run: Run,
    cancel: CancellationToken,
    profile: CompiledProfile,
    safety: SafetyMonitor,
    state: SafetyState,
    converged: bool,
    last_output: Option<String>,
}

impl Execution {
    fn progress(&self) -> Progress {
        Progress {
            steps: self.state.steps_taken,
            cost_usd: self.state.cost_spent,
            converged: self.converged,
            output: self.last_output.clone(),
        }
    }
}

enum ToolOutcome {
    Feedback(ToolFeedback),
    Stopped(Run),
}

enum Approval {
    Allow,
    Deny(String),
    Cancelled,
}

impl RunStateMachine {
    pub fn new(services: RunServices, settings: RunSettings) -> Result<Self, RunError> {
        let context = StepContextBuilder::new(settings.context_budget_bytes)?;
        Ok(Self {
            inner: Arc::new(Inner {
                services,
                settings,
                context,
                active: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn settings(&self) -> &RunSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.services.store
    }

    /// Persist a new `pending` run.
    pub async fn submit(&self, spec: RunSpec) -> Result<Run, RunError> {
        let run = spec.into_run(RunId::generate());
        self.inner.services.store.insert_run(&run).await?;
        self.emit(&run, EventKind::RunCreated).await?;
        info!(run_id = %run.id, task_id = %run.task_id, agent_id = %run.agent_id, "run created");
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Run, RunError> {
        Ok(self.inner.services.store.get_run(run_id).await?)
    }

    pub async fn events(&self, run_id: &RunId) -> Result<Vec<RunEvent>, RunError> {
        Ok(self.inner.services.events.list_by_run(run_id).await?)
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(run_id)
    }

    /// Request cooperative cancellation of an executing run. Returns `false`
    /// when the run is not executing in this process.
    pub fn cancel_run(&self, run_id: &RunId) -> bool {
        let active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match active.get(run_id) {
            Some(token) => {
                token.cancel();
                info!(run_id = %run_id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Operator retry: `failed -> pending` with cleared error and counters.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn retry_run(&self, run_id: &RunId) -> Result<Run, RunError> {
        if self.is_active(run_id) {
            return Err(RunError::AlreadyActive(run_id.clone()));
        }
        let run = self.inner.services.store.get_run(run_id).await?;
        if !can_retry(run.status) {
            return Err(RunError::NotRetryable {
                id: run.id,
                status: run.status,
            });
        }
        self.emit(&run, EventKind::RunRetried).await?;
        self.emit(
            &run,
            EventKind::StatusChanged {
                from: RunStatus::Failed,
                to: RunStatus::Pending,
                reason: Some("operator retry".to_string()),
            },
        )
        .await?;
        let updated = update_run(
            self.inner.services.store.as_ref(),
            &self.inner.settings.retry,
            run_id,
            |r: &mut Run| -> Result<(), RunError> {
                if !can_retry(r.status) {
                    return Err(RunError::NotRetryable {
                        id: r.id.clone(),
                        status: r.status,
                    });
                }
                r.status = RunStatus::Pending;
                r.error = None;
                r.output = None;
                r.step_count = 0;
                r.cost_usd = 0.0;
                r.converged = false;
                Ok(())
            },
        )
        .await?;
        info!(version = updated.version, "run reset to pending");
        Ok(updated)
    }

    /// Execute the run on its own task.
    pub fn spawn(&self, run_id: RunId, cancel: CancellationToken) -> JoinHandle<Result<Run, RunError>> {
        let machine = self.clone();
        tokio::spawn(async move { machine.execute(&run_id, cancel).await })
    }

    /// Drive a `pending` run to a terminal status.
    ///
    /// Run-level failures (timeouts, safety stops, gate exhaustion) end as
    /// `Ok` with a `failed` run. `Err` means the run could not be driven at all;
    /// the run is then marked failed on a best-effort basis.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn execute(&self, run_id: &RunId, cancel: CancellationToken) -> Result<Run, RunError> {
        let _active = self.register(run_id, &cancel)?;
        match self.execute_inner(run_id, cancel).await {
            Ok(run) => Ok(run),
            Err(err) => {
                if matches!(
                    err,
                    RunError::EventLog(_) | RunError::Store(_) | RunError::Context(_)
                ) {
                    self.abandon(run_id, &err).await;
                }
                Err(err)
            }
        }
    }

    fn register(&self, run_id: &RunId, cancel: &CancellationToken) -> Result<ActiveGuard<'_>, RunError> {
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(run_id) {
            return Err(RunError::AlreadyActive(run_id.clone()));
        }
        active.insert(run_id.clone(), cancel.clone());
        Ok(ActiveGuard {
            active: &self.inner.active,
            run_id: run_id.clone(),
        })
    }

    async fn execute_inner(&self, run_id: &RunId, cancel: CancellationToken) -> Result<Run, RunError> {
        let services = &self.inner.services;
        let mut run = services.store.get_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(TransitionError {
                from: run.status,
                to: RunStatus::Running,
            }
            .into());
        }

        let profile = match services.profiles.get(&run.policy_profile) {
            Ok(profile) => profile,
            Err(err) => {
                warn!(profile = %run.policy_profile, err = %err, "policy profile unavailable");
                let reason = format!("policy profile '{}': {err}", run.policy_profile);
                self.set_status(&mut run, RunStatus::Failed, Some(reason), None)
                    .await?;
                return Ok(run);
            }
        };
        if cancel.is_cancelled() {
            self.set_status(
                &mut run,
                RunStatus::Cancelled,
                Some("cancelled before start".to_string()),
                None,
            )
            .await?;
            return Ok(run);
        }
        self.set_status(&mut run, RunStatus::Running, None, None)
            .await?;

        let safety = services.safety.with_termination(profile.termination());
        let mut exec = Execution {
            state: safety.new_state(),
            run,
            cancel,
            profile,
            safety,
            converged: false,
            last_output: None,
        };
        self.drive(&mut exec).await
    }

    async fn drive(&self, exec: &mut Execution) -> Result<Run, RunError> {
        let settings = &self.inner.settings;
        let mut feedback: Option<ToolFeedback> = None;
        let mut gate_failure: Option<String> = None;
        let mut gate_failures = 0u32;

        loop {
            let step_index = exec.state.steps_taken;

            if exec.cancel.is_cancelled() {
                return self
                    .finish(exec, RunStatus::Cancelled, Some("cancelled".to_string()))
                    .await;
            }
            if let Verdict::Stop(reason) = exec.safety.check_before_step(&exec.state, None) {
                warn!(step_index, reason = %reason, "safety stop");
                self.emit(
                    &exec.run,
                    EventKind::SafetyStop {
                        step_index,
                        reason: reason.clone(),
                    },
                )
                .await?;
                return self
                    .finish(exec, RunStatus::Failed, Some(reason.to_string()))
                    .await;
            }

            let snapshot = tokio::select! {
                biased;
                () = exec.cancel.cancelled() => None,
                res = self.inner.services.checkpoints.snapshot(&exec.run, step_index) => Some(res),
            };
            let checkpoint = match snapshot {
                None => {
                    return self
                        .finish(
                            exec,
                            RunStatus::Cancelled,
                            Some("cancelled while waiting for a checkpoint".to_string()),
                        )
                        .await;
                }
                Some(Err(err)) => {
                    warn!(step_index, err = %err, "checkpoint failed");
                    self.emit(
                        &exec.run,
                        EventKind::CheckpointFailed {
                            step_index,
                            error: err.to_string(),
                        },
                    )
                    .await?;
                    return self
                        .finish(
                            exec,
                            RunStatus::Failed,
                            Some(format!("checkpoint before step {step_index}: {err}")),
                        )
                        .await;
                }
                Some(Ok(checkpoint)) => checkpoint,
            };
            self.emit(
                &exec.run,
                EventKind::CheckpointTaken {
                    step_index,
                    checkpoint_id: checkpoint.id.clone(),
                    commit: checkpoint.commit.clone(),
                },
            )
            .await?;

            let context = self.inner.context.render(&StepContextInputs {
                task_id: &exec.run.task_id,
                agent_id: &exec.run.agent_id,
                step_index,
                input: &exec.run.input,
                previous_output: exec.last_output.as_deref(),
                feedback: feedback.as_ref(),
                gate_failure: gate_failure.as_deref(),
            })?;
            gate_failure = None;
            let request = StepRequest {
                run_id: exec.run.id.clone(),
                step_index,
                task_id: exec.run.task_id.clone(),
                agent_id: exec.run.agent_id.clone(),
                workspace: exec.run.workspace.clone(),
                context,
                execution_mode: exec.run.execution_mode,
                deliver_mode: exec.run.deliver_mode,
                feedback: feedback.take(),
            };
            self.emit(&exec.run, EventKind::StepDispatched { step_index })
                .await?;

            // The in-flight call is never abandoned on cancel; its result is discarded below.
            let attempts = AtomicU32::new(0);
            let dispatched =
                tokio::time::timeout(settings.step_timeout, self.dispatch(&request, &attempts))
                    .await;
            let attempts = attempts.load(Ordering::Relaxed);
            if attempts > 1 {
                self.emit(
                    &exec.run,
                    EventKind::DispatchRetried {
                        step_index,
                        attempts,
                    },
                )
                .await?;
            }
            if exec.cancel.is_cancelled() {
                self.emit(&exec.run, EventKind::StepResultDiscarded { step_index })
                    .await?;
                return self
                    .finish(exec, RunStatus::Cancelled, Some("cancelled".to_string()))
                    .await;
            }

            let result = match dispatched {
                Err(_elapsed) => {
                    let timeout_ms =
                        u64::try_from(settings.step_timeout.as_millis()).unwrap_or(u64::MAX);
                    warn!(step_index, timeout_ms, "worker timed out");
                    self.emit(
                        &exec.run,
                        EventKind::WorkerTimeout {
                            step_index,
                            timeout_ms,
                        },
                    )
                    .await?;
                    self.rollback(exec, &checkpoint).await?;
                    return self
                        .finish(
                            exec,
                            RunStatus::Failed,
                            Some(format!(
                                "worker did not answer step {step_index} within {timeout_ms}ms"
                            )),
                        )
                        .await;
                }
                Ok(Err(err)) => {
                    warn!(step_index, err = %err, "dispatch failed");
                    self.emit(
                        &exec.run,
                        EventKind::DispatchFailed {
                            step_index,
                            error: err.to_string(),
                        },
                    )
                    .await?;
                    self.rollback(exec, &checkpoint).await?;
                    return self
                        .finish(
                            exec,
                            RunStatus::Failed,
                            Some(format!("dispatch of step {step_index}: {err}")),
                        )
                        .await;
                }
                Ok(Ok(result)) => result,
            };

            // The state that passed the check above; a pending tool call is held to it.
            let checked = exec.state.clone();
            exec.safety
                .record_step(&mut exec.state, &result.output, result.cost);
            self.emit(
                &exec.run,
                EventKind::StepCompleted {
                    step_index,
                    cost_usd: result.cost,
                    done: result.done,
                    output_hash: output_hash(&result.output),
                },
            )
            .await?;
            debug!(step_index, done = result.done, cost = result.cost, "step completed");
            exec.converged |= result.converged;
            exec.last_output = Some(result.output.clone());

            if let Some(call) = result.tool_call.clone() {
                match self.gate_tool_call(exec, step_index, call, &checked).await? {
                    ToolOutcome::Feedback(next @ ToolFeedback::Denied { .. }) => {
                        // A completion claim that rests on a denied call is not done.
                        if result.done {
                            info!(step_index, "tool call denied; completion claim ignored");
                        }
                        feedback = Some(next);
                        continue;
                    }
                    ToolOutcome::Feedback(next) => feedback = Some(next),
                    ToolOutcome::Stopped(run) => return Ok(run),
                }
            }

            if result.done {
                match self.run_gates(exec, step_index).await? {
                    None => return self.finish(exec, RunStatus::Completed, None).await,
                    Some((gate, detail)) => {
                        gate_failures += 1;
                        self.emit(
                            &exec.run,
                            EventKind::QualityGateFailed {
                                step_index,
                                gate: gate.clone(),
                                attempt: gate_failures,
                                detail: detail.clone(),
                            },
                        )
                        .await?;
                        self.rollback(exec, &checkpoint).await?;
                        if gate_failures > settings.max_gate_retries {
                            return self
                                .finish(
                                    exec,
                                    RunStatus::Failed,
                                    Some(format!(
                                        "quality gate '{gate}' failed {gate_failures} times"
                                    )),
                                )
                                .await;
                        }
                        info!(step_index, gate = %gate, attempt = gate_failures, "quality gate failed; retrying");
                        gate_failure = Some(format!("{gate}: {detail}"));
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        request: &StepRequest,
        attempts: &AtomicU32,
    ) -> Result<StepResult, DispatchError> {
        let dispatcher: &dyn StepDispatcher = self.inner.services.dispatcher.as_ref();
        with_backoff(&self.inner.settings.retry, "dispatch", move |attempt| {
            attempts.store(attempt, Ordering::Relaxed);
            dispatcher.dispatch(request.clone())
        })
        .await
    }

    async fn gate_tool_call(
        &self,
        exec: &mut Execution,
        step_index: u32,
        call: ToolCall,
        checked: &SafetyState,
    ) -> Result<ToolOutcome, RunError> {
        self.emit(
            &exec.run,
            EventKind::ToolCalled {
                step_index,
                tool_call: call.clone(),
            },
        )
        .await?;
        let decision = evaluate(&exec.profile, &call);
        self.emit(
            &exec.run,
            EventKind::PolicyDecision {
                step_index,
                decision,
            },
        )
        .await?;
        debug!(step_index, tool = %call.tool, decision = decision.kind.as_str(), "policy decision");

        let verdict = match decision.kind {
            DecisionKind::Deny => Err(denial_reason(&exec.profile, decision)),
            DecisionKind::Allow | DecisionKind::Ask => {
                if let Verdict::Stop(reason) =
                    exec.safety.check_before_step(checked, Some(&call))
                {
                    warn!(step_index, reason = %reason, "blocklist overrides policy");
                    self.emit(
                        &exec.run,
                        EventKind::SafetyStop {
                            step_index,
                            reason: reason.clone(),
                        },
                    )
                    .await?;
                    let run = self
                        .finish(exec, RunStatus::Failed, Some(reason.to_string()))
                        .await?;
                    return Ok(ToolOutcome::Stopped(run));
                }
                if decision.kind == DecisionKind::Ask {
                    match self
                        .await_approval(exec, step_index, &call, decision.rule_index)
                        .await?
                    {
                        Approval::Allow => Ok(()),
                        Approval::Deny(reason) => Err(reason),
                        Approval::Cancelled => return Ok(ToolOutcome::Stopped(exec.run.clone())),
                    }
                } else {
                    Ok(())
                }
            }
        };

        match verdict {
            Ok(()) => {
                self.emit(
                    &exec.run,
                    EventKind::ToolApplied {
                        step_index,
                        tool: call.tool.clone(),
                    },
                )
                .await?;
                Ok(ToolOutcome::Feedback(ToolFeedback::Applied { tool_call: call }))
            }
            Err(reason) => {
                self.emit(
                    &exec.run,
                    EventKind::ToolDenied {
                        step_index,
                        tool: call.tool.clone(),
                        reason: reason.clone(),
                    },
                )
                .await?;
                Ok(ToolOutcome::Feedback(ToolFeedback::Denied {
                    tool_call: call,
                    reason,
                }))
            }
        }
    }

    async fn await_approval(
        &self,
        exec: &mut Execution,
        step_index: u32,
        call: &ToolCall,
        rule_index: Option<usize>,
    ) -> Result<Approval, RunError> {
        self.transition(
            exec,
            RunStatus::AwaitingApproval,
            Some(format!("tool '{}' requires approval", call.tool)),
        )
        .await?;
        self.emit(&exec.run, EventKind::ApprovalRequested { step_index })
            .await?;

        let request = ApprovalRequest {
            run_id: exec.run.id.clone(),
            step_index,
            tool_call: call.clone(),
            rule_index,
        };
        let approvals: &dyn ApprovalChannel = self.inner.services.approvals.as_ref();
        let limit = self.inner.settings.approval_timeout;
        let wait = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, approvals.request(request))
                    .await
                    .ok(),
                None => Some(approvals.request(request).await),
            }
        };
        let outcome = tokio::select! {
            biased;
            () = exec.cancel.cancelled() => None,
            res = wait => Some(res),
        };

        let approval = match outcome {
            None => {
                self.finish(
                    exec,
                    RunStatus::Cancelled,
                    Some("cancelled while awaiting approval".to_string()),
                )
                .await?;
                return Ok(Approval::Cancelled);
            }
            Some(None) => {
                info!(step_index, "approval timed out; denying");
                self.emit(&exec.run, EventKind::ApprovalTimedOut { step_index })
                    .await?;
                Approval::Deny("approval timed out".to_string())
            }
            Some(Some(Ok(decision))) => {
                self.emit(
                    &exec.run,
                    EventKind::ApprovalResolved {
                        step_index,
                        decision,
                    },
                )
                .await?;
                match decision {
                    ApprovalDecision::Allow => Approval::Allow,
                    ApprovalDecision::Deny => Approval::Deny("denied by operator".to_string()),
                }
            }
            Some(Some(Err(err))) => {
                warn!(step_index, err = %err, "approval channel failed; denying");
                self.emit(
                    &exec.run,
                    EventKind::ApprovalFailed {
                        step_index,
                        error: err.to_string(),
                    },
                )
                .await?;
                Approval::Deny(format!("approval unavailable: {err}"))
            }
        };
        self.transition(exec, RunStatus::Running, None).await?;
        Ok(approval)
    }

    /// First failing gate as `(name, detail)`, or `None` when all pass.
    async fn run_gates(
        &self,
        exec: &Execution,
        step_index: u32,
    ) -> Result<Option<(String, String)>, RunError> {
        for gate in exec.profile.quality_gates() {
            let outcome = self
                .inner
                .services
                .gates
                .run(gate, &exec.run.workspace)
                .await;
            match outcome {
                Ok(GateOutcome::Pass) => {
                    self.emit(
                        &exec.run,
                        EventKind::QualityGatePassed {
                            step_index,
                            gate: gate.name.clone(),
                        },
                    )
                    .await?;
                }
                Ok(GateOutcome::Fail { detail }) => return Ok(Some((gate.name.clone(), detail))),
                Err(err) => return Ok(Some((gate.name.clone(), err.to_string()))),
            }
        }
        Ok(None)
    }

    async fn rollback(&self, exec: &Execution, checkpoint: &Checkpoint) -> Result<(), RunError> {
        let step_index = checkpoint.step_index;
        match self
            .inner
            .services
            .checkpoints
            .rollback_to(&exec.run, &checkpoint.id)
            .await
        {
            Ok(_) => {
                self.emit(
                    &exec.run,
                    EventKind::RolledBack {
                        step_index,
                        checkpoint_id: checkpoint.id.clone(),
                    },
                )
                .await?;
            }
            Err(err) => {
                warn!(step_index, err = %err, "rollback failed");
                self.emit(
                    &exec.run,
                    EventKind::RollbackFailed {
                        step_index,
                        checkpoint_id: checkpoint.id.clone(),
                        error: err.to_string(),
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        exec: &mut Execution,
        to: RunStatus,
        reason: Option<String>,
    ) -> Result<Run, RunError> {
        self.transition(exec, to, reason).await?;
        Ok(exec.run.clone())
    }

    async fn transition(
        &self,
        exec: &mut Execution,
        to: RunStatus,
        reason: Option<String>,
    ) -> Result<(), RunError> {
        let progress = exec.progress();
        self.set_status(&mut exec.run, to, reason, Some(&progress))
            .await
    }

    /// Append `status_changed`, then CAS the run record.
    async fn set_status(
        &self,
        run: &mut Run,
        to: RunStatus,
        reason: Option<String>,
        progress: Option<&Progress>,
    ) -> Result<(), RunError> {
        let from = run.status;
        validate_transition(from, to)?;
        self.emit(
            run,
            EventKind::StatusChanged {
                from,
                to,
                reason: reason.clone(),
            },
        )
        .await?;
        let error = (to == RunStatus::Failed).then_some(reason).flatten();
        let updated = update_run(
            self.inner.services.store.as_ref(),
            &self.inner.settings.retry,
            &run.id,
            |r: &mut Run| -> Result<(), RunError> {
                validate_transition(r.status, to)?;
                r.status = to;
                if let Some(progress) = progress {
                    r.step_count = progress.steps;
                    r.cost_usd = progress.cost_usd;
                    r.converged = progress.converged;
                    if progress.output.is_some() {
                        r.output.clone_from(&progress.output);
                    }
                }
                if error.is_some() {
                    r.error.clone_from(&error);
                }
                Ok(())
            },
        )
        .await?;
        info!(run_id = %run.id, %from, %to, "run status changed");
        *run = updated;
        Ok(())
    }

    async fn emit(&self, run: &Run, kind: EventKind) -> Result<RunEvent, RunError> {
        let event = NewEvent {
            run_id: run.id.clone(),
            project_id: run.project_id.clone(),
            task_id: run.task_id.clone(),
            kind,
        };
        Ok(self.inner.services.events.append(event).await?)
    }

    /// Best-effort `failed` mark after the loop could not continue.
    async fn abandon(&self, run_id: &RunId, cause: &RunError) {
        let message = cause.to_string();
        let result = update_run(
            self.inner.services.store.as_ref(),
            &self.inner.settings.retry,
            run_id,
            |r: &mut Run| -> Result<(), RunError> {
                if !r.status.is_terminal() {
                    r.status = RunStatus::Failed;
                    r.error = Some(message.clone());
                }
                Ok(())
            },
        )
        .await;
        match result {
            Ok(_) => warn!(run_id = %run_id, err = %message, "run abandoned"),
            Err(err) => error!(run_id = %run_id, err = %err, cause = %message, "could not mark abandoned run failed"),
        }
    }
}

fn denial_reason(profile: &CompiledProfile, decision: Decision) -> String {
    match decision.rule_index {
        Some(index) => format!("denied by rule {index} of profile '{}'", profile.name()),
        None => format!("denied by default of profile '{}'", profile.name()),
    }
}
