//! Workspace snapshot/restore backends used by checkpoints.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::instrument;

use crate::io::git::Git;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("git: {0}")]
    Git(String),
    #[error("workspace worker panicked or was cancelled: {0}")]
    Join(String),
}

/// Snapshots and restores a workspace. Bounding concurrency is the caller's job.
#[async_trait]
pub trait WorkspacePool: Send + Sync {
    /// Record the workspace state on `shadow_ref` and return the commit id.
    async fn snapshot(
        &self,
        workspace: &Path,
        shadow_ref: &str,
        label: &str,
    ) -> Result<String, PoolError>;

    /// Reset the workspace to a commit previously returned by `snapshot`.
    async fn restore(&self, workspace: &Path, commit: &str) -> Result<(), PoolError>;
}

/// `WorkspacePool` backed by the `git` CLI, run on the blocking thread pool.
#[derive(Debug, Clone, Default)]
pub struct GitWorkspacePool;

impl GitWorkspacePool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkspacePool for GitWorkspacePool {
    #[instrument(skip_all, fields(workspace = %workspace.display(), shadow_ref))]
    async fn snapshot(
        &self,
        workspace: &Path,
        shadow_ref: &str,
        label: &str,
    ) -> Result<String, PoolError> {
        let git = Git::new(workspace);
        let shadow_ref = shadow_ref.to_string();
        let label = label.to_string();
        tokio::task::spawn_blocking(move || git.snapshot_to_ref(&shadow_ref, &label))
            .await
            .map_err(|err| PoolError::Join(err.to_string()))?
            .map_err(|err| PoolError::Git(format!("{err:#}")))
    }

    #[instrument(skip_all, fields(workspace = %workspace.display(), commit))]
    async fn restore(&self, workspace: &Path, commit: &str) -> Result<(), PoolError> {
        let git = Git::new(PathBuf::from(workspace));
        let commit = commit.to_string();
        tokio::task::spawn_blocking(move || git.restore_worktree(&commit))
            .await
            .map_err(|err| PoolError::Join(err.to_string()))?
            .map_err(|err| PoolError::Git(format!("{err:#}")))
    }
}
