//! Persisted records: runs, plans, plan steps and checkpoints.
//!
//! Every mutable record carries a `version` that the store bumps on each
//! successful compare-and-swap update.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{
    CheckpointId, DeliverMode, ExecutionMode, PlanId, PlanStatus, Protocol, RunId, RunStatus,
    StepId, StepStatus,
};

/// Everything needed to create a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub project_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub policy_profile: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub deliver_mode: DeliverMode,
    pub workspace: PathBuf,
    pub input: String,
}

impl RunSpec {
    pub fn into_run(self, id: RunId) -> Run {
        Run {
            id,
            project_id: self.project_id,
            task_id: self.task_id,
            agent_id: self.agent_id,
            policy_profile: self.policy_profile,
            execution_mode: self.execution_mode,
            deliver_mode: self.deliver_mode,
            workspace: self.workspace,
            input: self.input,
            status: RunStatus::Pending,
            step_count: 0,
            cost_usd: 0.0,
            output: None,
            error: None,
            converged: false,
            version: 0,
        }
    }
}

/// One agent execution against a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub project_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub policy_profile: String,
    pub execution_mode: ExecutionMode,
    pub deliver_mode: DeliverMode,
    pub workspace: PathBuf,
    pub input: String,
    pub status: RunStatus,
    pub step_count: u32,
    pub cost_usd: f64,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Set when the final step reported a convergence signal (ping-pong).
    pub converged: bool,
    pub version: u64,
}

/// Workspace snapshot taken before a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub run_id: RunId,
    pub step_index: u32,
    pub commit: String,
    pub created_at: DateTime<Utc>,
}

/// How a consensus round picks its winner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    #[default]
    Majority,
    Arbiter {
        agent_id: String,
        policy_profile: String,
    },
}

/// Round limits for the turn-based protocols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundConfig {
    pub ping_pong_max_rounds: u32,
    pub consensus_max_rounds: u32,
    pub round_timeout_secs: u64,
    pub selection: Selection,
}

/// A multi-agent execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: PlanId,
    pub project_id: String,
    pub name: String,
    pub protocol: Protocol,
    pub max_parallel: usize,
    pub workspace: PathBuf,
    pub rounds: RoundConfig,
    pub status: PlanStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub version: u64,
}

/// One node of a plan's dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub plan_id: PlanId,
    /// Creation order within the plan; the scheduler's tie-breaker.
    pub position: u32,
    pub task_id: String,
    pub agent_id: String,
    pub policy_profile: String,
    pub execution_mode: ExecutionMode,
    pub deliver_mode: DeliverMode,
    pub input: String,
    pub depends_on: Vec<StepId>,
    /// Last round (turn) this step took part in; 0 before the first launch.
    pub round: u32,
    pub status: StepStatus,
    pub run_id: Option<RunId>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub version: u64,
}

/// Step description as submitted in a plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStepRequest {
    pub id: StepId,
    pub task_id: String,
    pub agent_id: String,
    pub policy_profile: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub deliver_mode: DeliverMode,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
}

/// Plan description as submitted in a plan file.
///
/// Round limits left unset fall back to the scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub project_id: String,
    pub name: String,
    pub protocol: Protocol,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    pub workspace: PathBuf,
    #[serde(default)]
    pub ping_pong_max_rounds: Option<u32>,
    #[serde(default)]
    pub consensus_max_rounds: Option<u32>,
    #[serde(default)]
    pub round_timeout_secs: Option<u64>,
    #[serde(default)]
    pub selection: Selection,
    pub steps: Vec<PlanStepRequest>,
}

fn default_max_parallel() -> usize {
    1
}
