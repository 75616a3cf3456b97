//! Step dispatch to agent workers.
//!
//! The run state machine only sees [`StepDispatcher`]. Backends are chosen at
//! start-up through an explicit [`WorkerRegistry`] populated from a fixed list.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::core::types::{DeliverMode, ExecutionMode, RunId, ToolCall};
use crate::io::config::WorkerConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::retry::Retryable;

/// What happened to the tool call proposed by the previous step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolFeedback {
    Applied { tool_call: ToolCall },
    Denied { tool_call: ToolCall, reason: String },
}

/// One unit of work for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub run_id: RunId,
    pub step_index: u32,
    pub task_id: String,
    pub agent_id: String,
    pub workspace: PathBuf,
    /// Rendered step context (task, previous output, feedback).
    pub context: String,
    pub execution_mode: ExecutionMode,
    pub deliver_mode: DeliverMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<ToolFeedback>,
}

/// What an agent reports back for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepResult {
    pub output: String,
    pub tool_call: Option<ToolCall>,
    pub cost: f64,
    /// The agent claims the task is complete.
    pub done: bool,
    /// Convergence signal for turn-based protocols.
    pub converged: bool,
}

impl StepResult {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    #[must_use]
    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_call = Some(call);
        self
    }

    #[must_use]
    pub fn finished(mut self) -> Self {
        self.done = true;
        self
    }

    #[must_use]
    pub fn converging(mut self) -> Self {
        self.converged = true;
        self
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The channel hiccupped; the same request may be sent again.
    #[error("transient worker error: {0}")]
    Transient(String),
    #[error("worker error: {0}")]
    Fatal(String),
    #[error("worker channel closed")]
    Closed,
    #[error("unknown worker backend '{0}'")]
    UnknownBackend(String),
}

impl Retryable for DispatchError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[async_trait]
pub trait StepDispatcher: Send + Sync {
    async fn dispatch(&self, request: StepRequest) -> Result<StepResult, DispatchError>;
}

type PendingMap = Arc<Mutex<HashMap<(RunId, u32), oneshot::Sender<StepResult>>>>;

/// In-process broker: requests go out on an mpsc channel and results come back
/// through [`ChannelDispatcher::complete`], correlated by `(run_id, step_index)`.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    outbound: mpsc::Sender<StepRequest>,
    pending: PendingMap,
}

/// Removes the pending entry when a dispatch finishes or is dropped (timeout).
struct PendingGuard {
    pending: PendingMap,
    key: (RunId, u32),
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.key);
        }
    }
}

impl ChannelDispatcher {
    /// Create a broker and the receiver a worker loop consumes.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StepRequest>) {
        let (outbound, inbound) = mpsc::channel(capacity.max(1));
        (
            Self {
                outbound,
                pending: Arc::new(Mutex::new(HashMap::new())),
            },
            inbound,
        )
    }

    /// Deliver a result. Returns `false` (and drops the result) when nobody is
    /// waiting for it any more, e.g. after a step timeout.
    pub fn complete(&self, run_id: &RunId, step_index: u32, result: StepResult) -> bool {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&(run_id.clone(), step_index)));
        match sender {
            Some(sender) => sender.send(result).is_ok(),
            None => {
                warn!(%run_id, step_index, "dropping late or unknown step result");
                false
            }
        }
    }
}

#[async_trait]
impl StepDispatcher for ChannelDispatcher {
    #[instrument(skip_all, fields(run_id = %request.run_id, step_index = request.step_index))]
    async fn dispatch(&self, request: StepRequest) -> Result<StepResult, DispatchError> {
        let key = (request.run_id.clone(), request.step_index);
        let (reply, receiver) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| DispatchError::Fatal("pending map poisoned".to_string()))?;
            pending.insert(key.clone(), reply);
        }
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            key,
        };
        self.outbound
            .send(request)
            .await
            .map_err(|_| DispatchError::Closed)?;
        debug!("step request sent");
        receiver.await.map_err(|_| DispatchError::Closed)
    }
}

/// Spawns a worker process per step: the request is written to stdin as JSON
/// and the last non-empty stdout line must be a JSON `StepResult`.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandWorker {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

#[async_trait]
impl StepDispatcher for CommandWorker {
    #[instrument(skip_all, fields(run_id = %request.run_id, step_index = request.step_index))]
    async fn dispatch(&self, request: StepRequest) -> Result<StepResult, DispatchError> {
        let payload =
            serde_json::to_vec(&request).map_err(|err| DispatchError::Fatal(err.to_string()))?;
        let mut cmd =
            command_from_argv(&self.command).map_err(|err| DispatchError::Fatal(err.to_string()))?;
        cmd.current_dir(&request.workspace);
        let timeout = self.timeout;
        let limit = self.output_limit_bytes;

        let output = tokio::task::spawn_blocking(move || {
            run_command_with_timeout(cmd, Some(&payload), timeout, limit)
        })
        .await
        .map_err(|err| DispatchError::Transient(format!("worker task: {err}")))?
        .map_err(|err| DispatchError::Fatal(format!("{err:#}")))?;

        if output.timed_out {
            return Err(DispatchError::Fatal(format!(
                "worker process exceeded {}s",
                timeout.as_secs()
            )));
        }
        if !output.status.success() {
            return Err(DispatchError::Fatal(format!(
                "worker exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_worker_output(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_worker_output(stdout: &str) -> Result<StepResult, DispatchError> {
    let line = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| DispatchError::Fatal("worker produced no output".to_string()))?;
    serde_json::from_str(line)
        .map_err(|err| DispatchError::Fatal(format!("worker result is not valid JSON: {err}")))
}

/// Builds a dispatcher from worker configuration.
pub type WorkerFactory = fn(&WorkerConfig) -> Result<Arc<dyn StepDispatcher>, DispatchError>;

/// Name to factory map of worker backends.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    factories: BTreeMap<String, WorkerFactory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend shipped in this crate.
    pub fn with_builtin_backends() -> Self {
        let mut registry = Self::new();
        registry.register("command", command_backend);
        registry
    }

    pub fn register(&mut self, name: &str, factory: WorkerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn build(&self, config: &WorkerConfig) -> Result<Arc<dyn StepDispatcher>, DispatchError> {
        let factory = self
            .factories
            .get(&config.backend)
            .ok_or_else(|| DispatchError::UnknownBackend(config.backend.clone()))?;
        factory(config)
    }
}

fn command_backend(config: &WorkerConfig) -> Result<Arc<dyn StepDispatcher>, DispatchError> {
    if config.command.is_empty() {
        return Err(DispatchError::Fatal(
            "worker.command must be set for the command backend".to_string(),
        ));
    }
    Ok(Arc::new(CommandWorker::new(
        config.command.clone(),
        Duration::from_secs(config.timeout_secs),
        config.output_limit_bytes,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(run: &str, step_index: u32, workspace: PathBuf) -> StepRequest {
        StepRequest {
            run_id: RunId::from(run),
            step_index,
            task_id: "task".to_string(),
            agent_id: "agent".to_string(),
            workspace,
            context: "do the thing".to_string(),
            execution_mode: ExecutionMode::Sandbox,
            deliver_mode: DeliverMode::None,
            feedback: None,
        }
    }

    #[tokio::test]
    async fn channel_correlates_results_by_run_and_step() {
        let (dispatcher, mut inbound) = ChannelDispatcher::new(4);
        let worker = dispatcher.clone();
        tokio::spawn(async move {
            while let Some(req) = inbound.recv().await {
                let result = StepResult {
                    output: format!("{}#{}", req.run_id, req.step_index),
                    ..StepResult::default()
                };
                worker.complete(&req.run_id, req.step_index, result);
            }
        });

        let (a, b) = tokio::join!(
            dispatcher.dispatch(request("r1", 0, PathBuf::from("."))),
            dispatcher.dispatch(request("r2", 5, PathBuf::from("."))),
        );
        assert_eq!(a.expect("r1").output, "r1#0");
        assert_eq!(b.expect("r2").output, "r2#5");
    }

    #[tokio::test(start_paused = true)]
    async fn late_results_are_dropped_after_timeout() {
        let (dispatcher, mut inbound) = ChannelDispatcher::new(4);
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.dispatch(request("r1", 0, PathBuf::from("."))),
        )
        .await;
        assert!(outcome.is_err(), "dispatch should time out");

        let req = inbound.recv().await.expect("request was sent");
        assert!(!dispatcher.complete(&req.run_id, req.step_index, StepResult::default()));
    }

    #[tokio::test]
    async fn closed_channel_is_reported() {
        let (dispatcher, inbound) = ChannelDispatcher::new(1);
        drop(inbound);
        let err = dispatcher
            .dispatch(request("r1", 0, PathBuf::from(".")))
            .await
            .expect_err("closed");
        assert!(matches!(err, DispatchError::Closed));
    }

    #[tokio::test]
    async fn command_worker_round_trips_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = r#"cat > request.json; echo 'log line'; echo '{"output":"ok","cost":0.25,"done":true}'"#;
        let worker = CommandWorker::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(10),
            10_000,
        );
        let result = worker
            .dispatch(request("r1", 2, temp.path().to_path_buf()))
            .await
            .expect("dispatch");
        assert_eq!(result.output, "ok");
        assert!(result.done);
        assert_eq!(result.cost, 0.25);

        let sent: StepRequest = serde_json::from_str(
            &std::fs::read_to_string(temp.path().join("request.json")).expect("read"),
        )
        .expect("parse");
        assert_eq!(sent.step_index, 2);
    }

    #[tokio::test]
    async fn command_worker_failure_is_fatal() {
        let worker = CommandWorker::new(
            vec!["sh".to_string(), "-c".to_string(), "echo nope >&2; exit 3".to_string()],
            Duration::from_secs(10),
            10_000,
        );
        let err = worker
            .dispatch(request("r1", 0, std::env::temp_dir()))
            .await
            .expect_err("fails");
        assert!(matches!(err, DispatchError::Fatal(ref msg) if msg.contains("nope")));
        assert!(!err.is_retryable());
    }

    #[test]
    fn registry_builds_known_backends_only() {
        let registry = WorkerRegistry::with_builtin_backends();
        assert_eq!(registry.names(), vec!["command"]);

        let mut config = WorkerConfig::default();
        assert!(registry.build(&config).is_err(), "command must be configured");
        config.command = vec!["agent".to_string()];
        assert!(registry.build(&config).is_ok());

        config.backend = "carrier-pigeon".to_string();
        assert!(matches!(
            registry.build(&config),
            Err(DispatchError::UnknownBackend(_))
        ));
    }
}
