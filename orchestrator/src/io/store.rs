//! Record storage with optimistic concurrency.
//!
//! Updates are compare-and-swap on `version`: the caller passes the record as
//! it last read it, and the write succeeds only if the stored version still
//! matches. The stored copy then carries `version + 1`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::model::{Checkpoint, ExecutionPlan, PlanStep, Run};
use crate::core::types::{CheckpointId, PlanId, RunId, StepId};
use crate::retry::Retryable;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("{kind} '{id}' version conflict: expected {expected}, stored {actual}")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("store backend: {0}")]
    Backend(String),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError>;
    async fn get_run(&self, id: &RunId) -> Result<Run, StoreError>;
    /// Compare-and-swap on `run.version`; returns the stored record.
    async fn update_run(&self, run: &Run) -> Result<Run, StoreError>;

    /// Insert a plan together with all of its steps.
    async fn insert_plan(&self, plan: &ExecutionPlan, steps: &[PlanStep])
    -> Result<(), StoreError>;
    async fn get_plan(&self, id: &PlanId) -> Result<ExecutionPlan, StoreError>;
    async fn update_plan(&self, plan: &ExecutionPlan) -> Result<ExecutionPlan, StoreError>;

    async fn get_step(&self, plan_id: &PlanId, step_id: &StepId) -> Result<PlanStep, StoreError>;
    /// Steps of a plan in creation order.
    async fn list_steps(&self, plan_id: &PlanId) -> Result<Vec<PlanStep>, StoreError>;
    async fn update_step(&self, step: &PlanStep) -> Result<PlanStep, StoreError>;

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
    async fn get_checkpoint(&self, id: &CheckpointId) -> Result<Checkpoint, StoreError>;
    /// Checkpoints of a run in step order.
    async fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<RunId, Run>,
    plans: HashMap<PlanId, ExecutionPlan>,
    steps: BTreeMap<(PlanId, StepId), PlanStep>,
    checkpoints: HashMap<CheckpointId, Checkpoint>,
}

/// In-memory `Store`, used by the CLI and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))
    }

    /// Snapshot of every stored plan step, for assertions that run outside
    /// the async context.
    pub fn all_steps(&self) -> Vec<PlanStep> {
        self.lock()
            .map(|tables| tables.steps.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn run_snapshot(&self, id: &RunId) -> Option<Run> {
        self.lock()
            .ok()
            .and_then(|tables| tables.runs.get(id).cloned())
    }
}

fn cas<T: Clone>(
    kind: &'static str,
    id: String,
    stored: Option<&mut T>,
    incoming: &T,
    version: impl Fn(&T) -> u64,
    bump: impl FnOnce(&mut T),
) -> Result<T, StoreError> {
    let stored = stored.ok_or_else(|| StoreError::NotFound {
        kind,
        id: id.clone(),
    })?;
    let expected = version(incoming);
    let actual = version(stored);
    if expected != actual {
        return Err(StoreError::VersionConflict {
            kind,
            id,
            expected,
            actual,
        });
    }
    let mut next = incoming.clone();
    bump(&mut next);
    *stored = next.clone();
    Ok(next)
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if tables.runs.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists {
                kind: "run",
                id: run.id.to_string(),
            });
        }
        tables.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Run, StoreError> {
        self.lock()?
            .runs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "run",
                id: id.to_string(),
            })
    }

    async fn update_run(&self, run: &Run) -> Result<Run, StoreError> {
        let mut tables = self.lock()?;
        cas(
            "run",
            run.id.to_string(),
            tables.runs.get_mut(&run.id),
            run,
            |r| r.version,
            |r| r.version += 1,
        )
    }

    async fn insert_plan(
        &self,
        plan: &ExecutionPlan,
        steps: &[PlanStep],
    ) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if tables.plans.contains_key(&plan.id) {
            return Err(StoreError::AlreadyExists {
                kind: "plan",
                id: plan.id.to_string(),
            });
        }
        tables.plans.insert(plan.id.clone(), plan.clone());
        for step in steps {
            tables
                .steps
                .insert((plan.id.clone(), step.id.clone()), step.clone());
        }
        Ok(())
    }

    async fn get_plan(&self, id: &PlanId) -> Result<ExecutionPlan, StoreError> {
        self.lock()?
            .plans
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "plan",
                id: id.to_string(),
            })
    }

    async fn update_plan(&self, plan: &ExecutionPlan) -> Result<ExecutionPlan, StoreError> {
        let mut tables = self.lock()?;
        cas(
            "plan",
            plan.id.to_string(),
            tables.plans.get_mut(&plan.id),
            plan,
            |p| p.version,
            |p| p.version += 1,
        )
    }

    async fn get_step(&self, plan_id: &PlanId, step_id: &StepId) -> Result<PlanStep, StoreError> {
        self.lock()?
            .steps
            .get(&(plan_id.clone(), step_id.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "plan step",
                id: format!("{plan_id}/{step_id}"),
            })
    }

    async fn list_steps(&self, plan_id: &PlanId) -> Result<Vec<PlanStep>, StoreError> {
        let tables = self.lock()?;
        let mut steps: Vec<PlanStep> = tables
            .steps
            .values()
            .filter(|step| &step.plan_id == plan_id)
            .cloned()
            .collect();
        steps.sort_by_key(|step| step.position);
        Ok(steps)
    }

    async fn update_step(&self, step: &PlanStep) -> Result<PlanStep, StoreError> {
        let mut tables = self.lock()?;
        cas(
            "plan step",
            format!("{}/{}", step.plan_id, step.id),
            tables
                .steps
                .get_mut(&(step.plan_id.clone(), step.id.clone())),
            step,
            |s| s.version,
            |s| s.version += 1,
        )
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if tables.checkpoints.contains_key(&checkpoint.id) {
            return Err(StoreError::AlreadyExists {
                kind: "checkpoint",
                id: checkpoint.id.to_string(),
            });
        }
        tables
            .checkpoints
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, id: &CheckpointId) -> Result<Checkpoint, StoreError> {
        self.lock()?
            .checkpoints
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "checkpoint",
                id: id.to_string(),
            })
    }

    async fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, StoreError> {
        let tables = self.lock()?;
        let mut checkpoints: Vec<Checkpoint> = tables
            .checkpoints
            .values()
            .filter(|c| &c.run_id == run_id)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|c| (c.step_index, c.created_at));
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::RunSpec;
    use crate::core::types::{DeliverMode, ExecutionMode};

    fn run(id: &str) -> Run {
        RunSpec {
            project_id: "p".to_string(),
            task_id: "t".to_string(),
            agent_id: "a".to_string(),
            policy_profile: "plan-readonly".to_string(),
            execution_mode: ExecutionMode::Sandbox,
            deliver_mode: DeliverMode::None,
            workspace: "/tmp/ws".into(),
            input: "do it".to_string(),
        }
        .into_run(RunId::from(id))
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let store = InMemoryStore::new();
        store.insert_run(&run("r1")).await.expect("insert");
        let mut current = store.get_run(&RunId::from("r1")).await.expect("get");
        current.step_count = 3;
        let stored = store.update_run(&current).await.expect("update");
        assert_eq!(stored.version, 1);
        assert_eq!(store.get_run(&current.id).await.expect("get").step_count, 3);
    }

    #[tokio::test]
    async fn stale_write_is_a_conflict() {
        let store = InMemoryStore::new();
        store.insert_run(&run("r1")).await.expect("insert");
        let first = store.get_run(&RunId::from("r1")).await.expect("get");
        let second = first.clone();
        store.update_run(&first).await.expect("first writer wins");
        let err = store.update_run(&second).await.expect_err("stale");
        assert_eq!(
            err,
            StoreError::VersionConflict {
                kind: "run",
                id: "r1".to_string(),
                expected: 0,
                actual: 1
            }
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn missing_and_duplicate_records() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.get_run(&RunId::from("nope")).await,
            Err(StoreError::NotFound { .. })
        ));
        store.insert_run(&run("r1")).await.expect("insert");
        assert!(matches!(
            store.insert_run(&run("r1")).await,
            Err(StoreError::AlreadyExists { .. })
        ));
        assert!(!StoreError::Backend("x".to_string()).is_retryable());
    }
}
