//! Git adapter for workspace checkpoints.
//!
//! Snapshots are commits on a private shadow ref built from a throwaway
//! index, so the user's index, branches and HEAD are never touched. Shadow
//! refs are local bookkeeping and are never pushed.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};
use uuid::Uuid;

const SNAPSHOT_IDENTITY: [(&str, &str); 4] = [
    ("GIT_AUTHOR_NAME", "orchestrator"),
    ("GIT_AUTHOR_EMAIL", "orchestrator@localhost"),
    ("GIT_COMMITTER_NAME", "orchestrator"),
    ("GIT_COMMITTER_EMAIL", "orchestrator@localhost"),
];

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Resolve a revision to a full commit id, or `None` if it does not exist.
    pub fn resolve(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec], &[])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Commit the full working tree (tracked, modified and untracked files,
    /// respecting `.gitignore`) onto `shadow_ref` and return the commit id.
    ///
    /// The commit's parent is the current shadow tip, or HEAD for the first
    /// snapshot of a run.
    #[instrument(skip_all, fields(shadow_ref))]
    pub fn snapshot_to_ref(&self, shadow_ref: &str, message: &str) -> Result<String> {
        let index_path = std::env::temp_dir().join(format!(
            "orchestrator-index-{}",
            Uuid::new_v4().simple()
        ));
        let result = self.snapshot_with_index(&index_path, shadow_ref, message);
        if let Err(err) = fs::remove_file(&index_path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            debug!(err = %err, path = %index_path.display(), "failed to remove temp index");
        }
        result
    }

    fn snapshot_with_index(&self, index: &Path, shadow_ref: &str, message: &str) -> Result<String> {
        let index_value = index.to_string_lossy();
        let index_env = [("GIT_INDEX_FILE", &*index_value)];

        let head = self.resolve("HEAD")?;
        if head.is_some() {
            self.run_checked(&["read-tree", "HEAD"], &index_env)?;
        }
        self.run_checked(&["add", "-A", "--", "."], &index_env)?;
        let tree = self.run_capture(&["write-tree"], &index_env)?;
        let tree = tree.trim();

        let parent = match self.resolve(shadow_ref)? {
            Some(tip) => Some(tip),
            None => head,
        };
        let mut args = vec!["commit-tree", tree, "-m", message];
        if let Some(parent) = parent.as_deref() {
            args.extend(["-p", parent]);
        }
        let commit = self.run_capture(&args, &SNAPSHOT_IDENTITY)?;
        let commit = commit.trim().to_string();
        self.run_checked(&["update-ref", shadow_ref, &commit], &[])?;
        debug!(%commit, tree, "workspace snapshot committed");
        Ok(commit)
    }

    /// Hard-reset the working tree to the contents of `commit`: tracked files
    /// are restored, files absent from the snapshot are removed and the index
    /// is returned to HEAD. Idempotent.
    #[instrument(skip_all, fields(commit))]
    pub fn restore_worktree(&self, commit: &str) -> Result<()> {
        self.run_checked(&["read-tree", "--reset", "-u", commit], &[])?;
        self.run_checked(&["clean", "-fdq"], &[])?;
        if self.resolve("HEAD")?.is_some() {
            self.run_checked(&["reset", "-q"], &[])?;
        } else {
            self.run_checked(&["read-tree", "--empty"], &[])?;
        }
        debug!("worktree restored");
        Ok(())
    }

    fn run_capture(&self, args: &[&str], env: &[(&str, &str)]) -> Result<String> {
        let output = self.run_checked(args, env)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str], env: &[(&str, &str)]) -> Result<Output> {
        let output = self.run(args, env)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str], env: &[(&str, &str)]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .envs(env.iter().copied())
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
