//! Bounded retries with jittered exponential backoff.
//!
//! Used for optimistic-concurrency conflicts on the store and for transient
//! worker-channel errors. Only errors that report themselves as retryable
//! are retried; everything else returns immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::core::model::{ExecutionPlan, PlanStep, Run};
use crate::core::types::{PlanId, RunId, StepId};
use crate::io::config::RetryConfig;
use crate::io::store::{Store, StoreError};

pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: exponential in `attempt`, capped at
    /// `max_delay`, with the upper half randomized.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let ceiling = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        let floor_ms = ceiling_ms / 2;
        Duration::from_millis(rand::thread_rng().gen_range(floor_ms..=ceiling_ms))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt ceiling is reached. `op` receives the 1-based attempt number.
pub async fn with_backoff<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                debug!(label, attempt, delay_ms = delay.as_millis() as u64, err = %err, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(label, attempt, err = %err, "retry ceiling reached");
                }
                return Err(err);
            }
        }
    }
}

/// Read-modify-write of a run, refetching and reapplying `mutate` on version
/// conflicts.
pub async fn update_run<E, F>(
    store: &dyn Store,
    policy: &RetryPolicy,
    id: &RunId,
    mutate: F,
) -> Result<Run, E>
where
    F: Fn(&mut Run) -> Result<(), E> + Sync,
    E: From<StoreError> + Retryable + Display + Send,
{
    let mutate = &mutate;
    with_backoff(policy, "update_run", move |_| async move {
        let mut run = store.get_run(id).await?;
        mutate(&mut run)?;
        Ok::<Run, E>(store.update_run(&run).await?)
    })
    .await
}

/// Read-modify-write of a plan, retried on version conflicts.
pub async fn update_plan<E, F>(
    store: &dyn Store,
    policy: &RetryPolicy,
    id: &PlanId,
    mutate: F,
) -> Result<ExecutionPlan, E>
where
    F: Fn(&mut ExecutionPlan) -> Result<(), E> + Sync,
    E: From<StoreError> + Retryable + Display + Send,
{
    let mutate = &mutate;
    with_backoff(policy, "update_plan", move |_| async move {
        let mut plan = store.get_plan(id).await?;
        mutate(&mut plan)?;
        Ok::<ExecutionPlan, E>(store.update_plan(&plan).await?)
    })
    .await
}

/// Read-modify-write of a plan step, retried on version conflicts.
pub async fn update_step<E, F>(
    store: &dyn Store,
    policy: &RetryPolicy,
    plan_id: &PlanId,
    step_id: &StepId,
    mutate: F,
) -> Result<PlanStep, E>
where
    F: Fn(&mut PlanStep) -> Result<(), E> + Sync,
    E: From<StoreError> + Retryable + Display + Send,
{
    let mutate = &mutate;
    with_backoff(policy, "update_step", move |_| async move {
        let mut step = store.get_step(plan_id, step_id).await?;
        mutate(&mut step)?;
        Ok::<PlanStep, E>(store.update_step(&step).await?)
    })
    .await
}
