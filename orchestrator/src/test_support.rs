//! Test-only fakes and a harness that wires a run state machine to them.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use crate::checkpoint::CheckpointManager;
use crate::core::events::{NewEvent, RunEvent};
use crate::core::model::{Run, RunSpec};
use crate::core::policy::{PolicyProfile, QualityGate};
use crate::core::safety::{SafetyLimits, SafetyMonitor};
use crate::core::types::RunId;
use crate::io::approval::{ApprovalBroker, ApprovalChannel};
use crate::io::config::{PlanConfig, SafetyConfig};
use crate::io::dispatch::{DispatchError, StepDispatcher, StepRequest, StepResult};
use crate::io::event_log::{EventLog, EventLogError, InMemoryEventLog};
use crate::io::gates::{GateError, GateOutcome, QualityGateRunner};
use crate::io::profiles::{InMemoryProfiles, ProfileSource};
use crate::io::store::InMemoryStore;
use crate::io::workspace::{PoolError, WorkspacePool};
use crate::retry::RetryPolicy;
use crate::run::{RunError, RunServices, RunSettings, RunStateMachine};
use crate::scheduler::PlanScheduler;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Plain step output that does not claim completion.
pub fn output(text: &str) -> StepResult {
    StepResult::new(text)
}

/// Step output that claims the task is complete.
pub fn done(text: &str) -> StepResult {
    StepResult::new(text).finished()
}

/// One scripted reply of a [`ScriptedDispatcher`].
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(StepResult),
    /// Reply after a delay (use with paused time).
    Delay(Duration, StepResult),
    /// Never reply.
    Hang,
    Transient(String),
    Fatal(String),
}

/// Replies to dispatches from a fixed script, in order, and records requests.
#[derive(Debug, Default)]
pub struct ScriptedDispatcher {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<StepRequest>>,
}

impl ScriptedDispatcher {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<StepRequest> {
        lock(&self.requests).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }
}

#[async_trait]
impl StepDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, request: StepRequest) -> Result<StepResult, DispatchError> {
        lock(&self.requests).push(request);
        let next = lock(&self.script).pop_front();
        match next {
            Some(Scripted::Respond(result)) => Ok(result),
            Some(Scripted::Delay(delay, result)) => {
                tokio::time::sleep(delay).await;
                Ok(result)
            }
            Some(Scripted::Hang) => std::future::pending().await,
            Some(Scripted::Transient(message)) => Err(DispatchError::Transient(message)),
            Some(Scripted::Fatal(message)) => Err(DispatchError::Fatal(message)),
            None => Err(DispatchError::Fatal("script exhausted".to_string())),
        }
    }
}

type Responder = dyn Fn(&StepRequest) -> Result<StepResult, DispatchError> + Send + Sync;

/// Computes each reply from the request; tracks peak concurrency.
pub struct FnDispatcher {
    respond: Box<Responder>,
    delay: Duration,
    requests: Mutex<Vec<StepRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FnDispatcher {
    pub fn new(
        respond: impl Fn(&StepRequest) -> Result<StepResult, DispatchError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::with_delay(Duration::ZERO, respond)
    }

    pub fn with_delay(
        delay: Duration,
        respond: impl Fn(&StepRequest) -> Result<StepResult, DispatchError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            delay,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Completes every step in one dispatch with `"<task_id> done"`.
    pub fn echo() -> Arc<Self> {
        Self::new(|request| Ok(done(&format!("{} done", request.task_id))))
    }

    pub fn requests(&self) -> Vec<StepRequest> {
        lock(&self.requests).clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepDispatcher for FnDispatcher {
    async fn dispatch(&self, request: StepRequest) -> Result<StepResult, DispatchError> {
        lock(&self.requests).push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = (self.respond)(&request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Debug, Default)]
struct PoolLog {
    snapshots: Vec<(PathBuf, String, String)>,
    restores: Vec<(PathBuf, String)>,
}

/// Workspace pool that records calls and hands out fake commit ids.
#[derive(Debug, Clone, Default)]
pub struct RecordingPool {
    log: Arc<Mutex<PoolLog>>,
    hang: bool,
    fail_restores: bool,
}

impl RecordingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots never finish, holding their permit forever.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn failing_restores() -> Self {
        Self {
            fail_restores: true,
            ..Self::default()
        }
    }

    /// `(workspace, shadow_ref, label)` per snapshot.
    pub fn snapshots(&self) -> Vec<(PathBuf, String, String)> {
        lock(&self.log).snapshots.clone()
    }

    /// `(workspace, commit)` per restore.
    pub fn restores(&self) -> Vec<(PathBuf, String)> {
        lock(&self.log).restores.clone()
    }
}

#[async_trait]
impl WorkspacePool for RecordingPool {
    async fn snapshot(
        &self,
        workspace: &Path,
        shadow_ref: &str,
        label: &str,
    ) -> Result<String, PoolError> {
        if self.hang {
            return std::future::pending().await;
        }
        let mut log = lock(&self.log);
        log.snapshots.push((
            workspace.to_path_buf(),
            shadow_ref.to_string(),
            label.to_string(),
        ));
        Ok(format!("commit-{}", log.snapshots.len()))
    }

    async fn restore(&self, workspace: &Path, commit: &str) -> Result<(), PoolError> {
        lock(&self.log)
            .restores
            .push((workspace.to_path_buf(), commit.to_string()));
        if self.fail_restores {
            return Err(PoolError::Git("restore refused".to_string()));
        }
        Ok(())
    }
}

/// Gate runner replaying scripted outcomes; passes once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedGates {
    outcomes: Mutex<VecDeque<GateOutcome>>,
    runs: Mutex<Vec<String>>,
}

impl ScriptedGates {
    pub fn new(outcomes: impl IntoIterator<Item = GateOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            runs: Mutex::new(Vec::new()),
        })
    }

    /// Gate names in the order they ran.
    pub fn runs(&self) -> Vec<String> {
        lock(&self.runs).clone()
    }
}

#[async_trait]
impl QualityGateRunner for ScriptedGates {
    async fn run(&self, gate: &QualityGate, _workspace: &Path) -> Result<GateOutcome, GateError> {
        lock(&self.runs).push(gate.name.clone());
        Ok(lock(&self.outcomes)
            .pop_front()
            .unwrap_or(GateOutcome::Pass))
    }
}

/// Event log that accepts `successes` appends and then fails every append.
#[derive(Debug, Default)]
pub struct FailingEventLog {
    inner: InMemoryEventLog,
    remaining: AtomicUsize,
}

impl FailingEventLog {
    pub fn after(successes: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryEventLog::new(),
            remaining: AtomicUsize::new(successes),
        })
    }

    pub fn events(&self, run_id: &RunId) -> Vec<RunEvent> {
        self.inner.snapshot(run_id)
    }
}

#[async_trait]
impl EventLog for FailingEventLog {
    async fn append(&self, event: NewEvent) -> Result<RunEvent, EventLogError> {
        let admitted = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !admitted {
            return Err(EventLogError::Unavailable("disk full".to_string()));
        }
        self.inner.append(event).await
    }

    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<RunEvent>, EventLogError> {
        self.inner.list_by_run(run_id).await
    }
}

/// Settings with short retry delays for tests.
pub fn fast_settings() -> RunSettings {
    RunSettings {
        step_timeout: Duration::from_secs(5),
        approval_timeout: None,
        max_gate_retries: 2,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
        context_budget_bytes: 64_000,
    }
}

/// In-memory run state machine wired to recording fakes.
pub struct Harness {
    pub store: InMemoryStore,
    pub events: InMemoryEventLog,
    pub pool: RecordingPool,
    pub approvals: ApprovalBroker,
    pub gates: Arc<ScriptedGates>,
    pub profiles: Arc<InMemoryProfiles>,
    pub machine: RunStateMachine,
}

pub struct HarnessBuilder {
    dispatcher: Arc<dyn StepDispatcher>,
    approvals: Option<Arc<dyn ApprovalChannel>>,
    event_log: Option<Arc<dyn EventLog>>,
    gates: Vec<GateOutcome>,
    pool: RecordingPool,
    settings: RunSettings,
    limits: SafetyLimits,
    checkpoint_concurrency: usize,
    checkpoint_timeout: Duration,
    profiles: Vec<PolicyProfile>,
}

impl HarnessBuilder {
    pub fn settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn safety(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn gates(mut self, outcomes: impl IntoIterator<Item = GateOutcome>) -> Self {
        self.gates = outcomes.into_iter().collect();
        self
    }

    /// Replace the operator broker (e.g. with `StaticApprovals`).
    pub fn approvals(mut self, approvals: Arc<dyn ApprovalChannel>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    /// Replace the in-memory event log; `Harness::events` then stays empty.
    pub fn event_log(mut self, events: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(events);
        self
    }

    pub fn pool(mut self, pool: RecordingPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn checkpoints(mut self, concurrency: usize, acquire_timeout: Duration) -> Self {
        self.checkpoint_concurrency = concurrency;
        self.checkpoint_timeout = acquire_timeout;
        self
    }

    /// Register an extra custom profile.
    pub fn profile(mut self, profile: PolicyProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn build(self) -> Harness {
        let store = InMemoryStore::new();
        let events = InMemoryEventLog::new();
        let broker = ApprovalBroker::new();
        let gates = ScriptedGates::new(self.gates);
        let profiles = Arc::new(InMemoryProfiles::new());
        for profile in self.profiles {
            let name = profile.name.clone();
            if let Err(err) = profiles.save(profile) {
                panic!("test profile '{name}' is invalid: {err}");
            }
        }
        let safety_config = SafetyConfig::default();
        let safety = match SafetyMonitor::new(
            self.limits,
            &safety_config.blocked_paths,
            &safety_config.blocked_commands,
        ) {
            Ok(monitor) => monitor,
            Err(err) => panic!("test safety limits are invalid: {err}"),
        };
        let checkpoints = CheckpointManager::new(
            Arc::new(self.pool.clone()),
            Arc::new(store.clone()),
            self.checkpoint_concurrency,
            self.checkpoint_timeout,
        );
        let services = RunServices {
            store: Arc::new(store.clone()),
            events: self
                .event_log
                .unwrap_or_else(|| Arc::new(events.clone())),
            dispatcher: self.dispatcher,
            approvals: self
                .approvals
                .unwrap_or_else(|| Arc::new(broker.clone())),
            gates: gates.clone(),
            profiles: profiles.clone(),
            checkpoints,
            safety,
        };
        let machine = match RunStateMachine::new(services, self.settings) {
            Ok(machine) => machine,
            Err(err) => panic!("run state machine: {err}"),
        };
        Harness {
            store,
            events,
            pool: self.pool,
            approvals: broker,
            gates,
            profiles,
            machine,
        }
    }
}

impl Harness {
    pub fn builder(dispatcher: Arc<dyn StepDispatcher>) -> HarnessBuilder {
        HarnessBuilder {
            dispatcher,
            approvals: None,
            event_log: None,
            gates: Vec::new(),
            pool: RecordingPool::new(),
            settings: fast_settings(),
            limits: SafetyConfig::default().limits(),
            checkpoint_concurrency: 4,
            checkpoint_timeout: Duration::from_secs(5),
            profiles: Vec::new(),
        }
    }

    pub fn spec(&self, profile: &str, input: &str) -> RunSpec {
        RunSpec {
            project_id: "proj".to_string(),
            task_id: "task".to_string(),
            agent_id: "agent".to_string(),
            policy_profile: profile.to_string(),
            execution_mode: Default::default(),
            deliver_mode: Default::default(),
            workspace: PathBuf::from("/workspace"),
            input: input.to_string(),
        }
    }

    pub async fn submit_and_execute(&self, spec: RunSpec) -> Result<Run, RunError> {
        let run = self.machine.submit(spec).await?;
        self.machine.execute(&run.id, CancellationToken::new()).await
    }

    pub fn events(&self, run_id: &RunId) -> Vec<RunEvent> {
        self.events.snapshot(run_id)
    }

    pub fn event_names(&self, run_id: &RunId) -> Vec<&'static str> {
        self.events(run_id)
            .iter()
            .map(|event| event.event.name())
            .collect()
    }

    pub fn scheduler(&self, max_concurrent_runs: usize) -> PlanScheduler {
        self.scheduler_with(PlanConfig::default(), max_concurrent_runs)
    }

    pub fn scheduler_with(&self, defaults: PlanConfig, max_concurrent_runs: usize) -> PlanScheduler {
        PlanScheduler::new(self.machine.clone(), defaults, max_concurrent_runs)
    }
}

/// Throwaway git repository with one initial commit.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "Test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "hello\n")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "init"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.root().join(rel)).ok()
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
