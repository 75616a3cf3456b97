//! Per-step checkpoints: workspace snapshots on a shadow ref plus rollback.
//!
//! Workspace operations share one semaphore per process. A caller that cannot
//! get a permit within its timeout receives [`CheckpointError::ResourceExhausted`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};

use crate::core::model::{Checkpoint, Run};
use crate::core::types::{CheckpointId, RunId};
use crate::io::store::{Store, StoreError};
use crate::io::workspace::{PoolError, WorkspacePool};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint pool saturated: no capacity after {waited:?}")]
    ResourceExhausted { waited: Duration },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("checkpoint {checkpoint} belongs to run {owner}, not {run}")]
    WrongRun {
        checkpoint: CheckpointId,
        owner: RunId,
        run: RunId,
    },
    #[error("checkpoint pool closed")]
    Closed,
}

/// Ref that holds a run's snapshot history. Never pushed.
pub fn shadow_ref(run_id: &RunId) -> String {
    format!("refs/orchestrator/shadow/{run_id}")
}

#[derive(Clone)]
pub struct CheckpointManager {
    pool: Arc<dyn WorkspacePool>,
    store: Arc<dyn Store>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("available_permits", &self.permits.available_permits())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    pub fn new(
        pool: Arc<dyn WorkspacePool>,
        store: Arc<dyn Store>,
        concurrency: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            store,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            acquire_timeout,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    async fn acquire(
        &self,
        timeout: Duration,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, CheckpointError> {
        match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(CheckpointError::Closed),
            Err(_) => Err(CheckpointError::ResourceExhausted { waited: timeout }),
        }
    }

    /// Snapshot the run's workspace before step `step_index`, waiting at most
    /// the configured acquire timeout for pool capacity.
    pub async fn snapshot(&self, run: &Run, step_index: u32) -> Result<Checkpoint, CheckpointError> {
        self.snapshot_within(run, step_index, self.acquire_timeout)
            .await
    }

    #[instrument(skip_all, fields(run_id = %run.id, step_index))]
    pub async fn snapshot_within(
        &self,
        run: &Run,
        step_index: u32,
        timeout: Duration,
    ) -> Result<Checkpoint, CheckpointError> {
        let _permit = self.acquire(timeout).await?;
        let label = format!("checkpoint {} step {step_index}", run.id);
        let commit = self
            .pool
            .snapshot(&run.workspace, &shadow_ref(&run.id), &label)
            .await?;
        let checkpoint = Checkpoint {
            id: CheckpointId::generate(),
            run_id: run.id.clone(),
            step_index,
            commit,
            created_at: Utc::now(),
        };
        self.store.insert_checkpoint(&checkpoint).await?;
        debug!(checkpoint_id = %checkpoint.id, commit = %checkpoint.commit, "checkpoint taken");
        Ok(checkpoint)
    }

    /// Reset the run's workspace to `checkpoint_id`. Restoring the same
    /// checkpoint twice leaves the same tree as restoring it once.
    #[instrument(skip_all, fields(run_id = %run.id, checkpoint_id = %checkpoint_id))]
    pub async fn rollback_to(
        &self,
        run: &Run,
        checkpoint_id: &CheckpointId,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = self.store.get_checkpoint(checkpoint_id).await?;
        if checkpoint.run_id != run.id {
            return Err(CheckpointError::WrongRun {
                checkpoint: checkpoint.id,
                owner: checkpoint.run_id,
                run: run.id.clone(),
            });
        }
        let _permit = self.acquire(self.acquire_timeout).await?;
        self.pool.restore(&run.workspace, &checkpoint.commit).await?;
        info!(step_index = checkpoint.step_index, commit = %checkpoint.commit, "rolled back");
        Ok(checkpoint)
    }

    pub async fn list(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self.store.list_checkpoints(run_id).await?)
    }
}
