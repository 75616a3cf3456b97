//! Quality gates: commands that must pass before a run may complete.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::policy::QualityGate;
use crate::io::process::{command_from_argv, run_command_with_timeout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    /// Gate failed or timed out; `detail` is the captured output fed back to the agent.
    Fail { detail: String },
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("gate '{gate}' could not run: {message}")]
    Spawn { gate: String, message: String },
}

#[async_trait]
pub trait QualityGateRunner: Send + Sync {
    async fn run(&self, gate: &QualityGate, workspace: &Path) -> Result<GateOutcome, GateError>;
}

/// Runs gate commands in the workspace on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct CommandGateRunner {
    output_limit_bytes: usize,
}

impl CommandGateRunner {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self { output_limit_bytes }
    }
}

#[async_trait]
impl QualityGateRunner for CommandGateRunner {
    #[instrument(skip_all, fields(gate = %gate.name, workspace = %workspace.display()))]
    async fn run(&self, gate: &QualityGate, workspace: &Path) -> Result<GateOutcome, GateError> {
        let spawn_error = |message: String| GateError::Spawn {
            gate: gate.name.clone(),
            message,
        };
        let mut cmd = command_from_argv(&gate.command).map_err(|err| spawn_error(err.to_string()))?;
        cmd.current_dir(workspace);
        let timeout = Duration::from_secs(gate.timeout_secs);
        let limit = self.output_limit_bytes;

        let output =
            tokio::task::spawn_blocking(move || run_command_with_timeout(cmd, None, timeout, limit))
                .await
                .map_err(|err| spawn_error(err.to_string()))?
                .map_err(|err| spawn_error(format!("{err:#}")))?;

        if output.success() {
            debug!("gate passed");
            return Ok(GateOutcome::Pass);
        }
        let mut detail = output.combined_text();
        if output.timed_out {
            detail.push_str(&format!("\n[gate timed out after {}s]", gate.timeout_secs));
        }
        warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "gate failed");
        Ok(GateOutcome::Fail { detail })
    }
}
