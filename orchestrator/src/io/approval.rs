//! Human approval of tool calls that a policy marks `ask`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info};

use crate::core::types::{ApprovalDecision, RunId, ToolCall};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: RunId,
    pub step_index: u32,
    pub tool_call: ToolCall,
    /// Rule that produced the `ask`, or `None` for the profile default.
    pub rule_index: Option<usize>,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval request for run {0} was withdrawn")]
    Withdrawn(RunId),
    #[error("run {0} already has a pending approval")]
    Duplicate(RunId),
    #[error("approval channel unavailable: {0}")]
    Unavailable(String),
}

/// Where `ask` decisions are sent. The wait may be unbounded; callers add
/// their own timeout and cancellation.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalDecision, ApprovalError>;
}

/// Answers every request with the same decision. Used for headless runs.
#[derive(Debug, Clone, Copy)]
pub struct StaticApprovals(pub ApprovalDecision);

#[async_trait]
impl ApprovalChannel for StaticApprovals {
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalDecision, ApprovalError> {
        info!(run_id = %request.run_id, tool = %request.tool_call.tool, decision = ?self.0, "static approval");
        Ok(self.0)
    }
}

struct PendingApproval {
    request: ApprovalRequest,
    reply: oneshot::Sender<ApprovalDecision>,
}

type PendingTable = Arc<Mutex<BTreeMap<RunId, PendingApproval>>>;

/// In-memory table of pending approvals answered by an operator through
/// [`ApprovalBroker::decide`]. At most one request per run is pending.
#[derive(Clone, Default)]
pub struct ApprovalBroker {
    pending: PendingTable,
    notify: Arc<Notify>,
}

/// Withdraws the request if the waiting run goes away (cancel or timeout).
struct Withdraw {
    pending: PendingTable,
    run_id: RunId,
}

impl Drop for Withdraw {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.run_id);
        }
    }
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests awaiting a decision, ordered by run id.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.pending
            .lock()
            .map(|pending| pending.values().map(|p| p.request.clone()).collect())
            .unwrap_or_default()
    }

    /// Answer the pending request of a run. Returns `false` when nothing is pending.
    pub fn decide(&self, run_id: &RunId, decision: ApprovalDecision) -> bool {
        let entry = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(run_id));
        match entry {
            Some(entry) => {
                info!(%run_id, ?decision, "approval decided");
                entry.reply.send(decision).is_ok()
            }
            None => false,
        }
    }

    /// Wait until at least one request is pending and return the oldest run's.
    pub async fn next_pending(&self) -> ApprovalRequest {
        loop {
            if let Some(first) = self.pending().into_iter().next() {
                return first;
            }
            self.notify.notified().await;
        }
    }
}

#[async_trait]
impl ApprovalChannel for ApprovalBroker {
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalDecision, ApprovalError> {
        let run_id = request.run_id.clone();
        let (reply, receiver) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| ApprovalError::Unavailable("approval table poisoned".to_string()))?;
            if pending.contains_key(&run_id) {
                return Err(ApprovalError::Duplicate(run_id));
            }
            pending.insert(run_id.clone(), PendingApproval { request, reply });
        }
        let _withdraw = Withdraw {
            pending: self.pending.clone(),
            run_id: run_id.clone(),
        };
        self.notify.notify_one();
        debug!(%run_id, "approval pending");
        receiver.await.map_err(|_| ApprovalError::Withdrawn(run_id))
    }
}
