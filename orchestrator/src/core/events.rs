//! Run events: the append-only audit trail of every run.
//!
//! Events are written ahead of the store update they describe, so replaying a
//! run's `status_changed` events always reproduces its last persisted status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::policy::Decision;
use crate::core::safety::StopReason;
use crate::core::types::{ApprovalDecision, CheckpointId, RunId, RunStatus, ToolCall};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunCreated,
    StatusChanged {
        from: RunStatus,
        to: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RunRetried,
    CheckpointTaken {
        step_index: u32,
        checkpoint_id: CheckpointId,
        commit: String,
    },
    CheckpointFailed {
        step_index: u32,
        error: String,
    },
    StepDispatched {
        step_index: u32,
    },
    DispatchRetried {
        step_index: u32,
        attempts: u32,
    },
    DispatchFailed {
        step_index: u32,
        error: String,
    },
    WorkerTimeout {
        step_index: u32,
        timeout_ms: u64,
    },
    StepCompleted {
        step_index: u32,
        cost_usd: f64,
        done: bool,
        output_hash: String,
    },
    StepResultDiscarded {
        step_index: u32,
    },
    ToolCalled {
        step_index: u32,
        tool_call: ToolCall,
    },
    PolicyDecision {
        step_index: u32,
        decision: Decision,
    },
    ToolDenied {
        step_index: u32,
        tool: String,
        reason: String,
    },
    ApprovalRequested {
        step_index: u32,
    },
    ApprovalResolved {
        step_index: u32,
        decision: ApprovalDecision,
    },
    ApprovalTimedOut {
        step_index: u32,
    },
    ApprovalFailed {
        step_index: u32,
        error: String,
    },
    ToolApplied {
        step_index: u32,
        tool: String,
    },
    SafetyStop {
        step_index: u32,
        reason: StopReason,
    },
    QualityGatePassed {
        step_index: u32,
        gate: String,
    },
    QualityGateFailed {
        step_index: u32,
        gate: String,
        attempt: u32,
        detail: String,
    },
    RolledBack {
        step_index: u32,
        checkpoint_id: CheckpointId,
    },
    RollbackFailed {
        step_index: u32,
        checkpoint_id: CheckpointId,
        error: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunCreated => "run_created",
            Self::StatusChanged { .. } => "status_changed",
            Self::RunRetried => "run_retried",
            Self::CheckpointTaken { .. } => "checkpoint_taken",
            Self::CheckpointFailed { .. } => "checkpoint_failed",
            Self::StepDispatched { .. } => "step_dispatched",
            Self::DispatchRetried { .. } => "dispatch_retried",
            Self::DispatchFailed { .. } => "dispatch_failed",
            Self::WorkerTimeout { .. } => "worker_timeout",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepResultDiscarded { .. } => "step_result_discarded",
            Self::ToolCalled { .. } => "tool_called",
            Self::PolicyDecision { .. } => "policy_decision",
            Self::ToolDenied { .. } => "tool_denied",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ApprovalResolved { .. } => "approval_resolved",
            Self::ApprovalTimedOut { .. } => "approval_timed_out",
            Self::ApprovalFailed { .. } => "approval_failed",
            Self::ToolApplied { .. } => "tool_applied",
            Self::SafetyStop { .. } => "safety_stop",
            Self::QualityGatePassed { .. } => "quality_gate_passed",
            Self::QualityGateFailed { .. } => "quality_gate_failed",
            Self::RolledBack { .. } => "rolled_back",
            Self::RollbackFailed { .. } => "rollback_failed",
        }
    }
}

/// Event as submitted by a writer; the log assigns `seq` and `at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub run_id: RunId,
    pub project_id: String,
    pub task_id: String,
    pub kind: EventKind,
}

/// Persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub project_id: String,
    pub task_id: String,
    /// Strictly increasing per run, starting at 1.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: EventKind,
}

impl RunEvent {
    pub fn from_new(event: NewEvent, seq: u64) -> Self {
        Self {
            run_id: event.run_id,
            project_id: event.project_id,
            task_id: event.task_id,
            seq,
            at: Utc::now(),
            event: event.kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let kind = EventKind::StatusChanged {
            from: RunStatus::Running,
            to: RunStatus::Failed,
            reason: Some("boom".to_string()),
        };
        let value = serde_json::to_value(&kind).expect("serialize");
        assert_eq!(value["type"], "status_changed");
        assert_eq!(value["to"], "failed");
        assert_eq!(kind.name(), "status_changed");

        let back: EventKind = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, kind);
    }
}
