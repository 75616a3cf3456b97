//! Safety guards evaluated around every step of a run.
//!
//! The monitor enforces ceilings (cost, step count), detects stalled agents
//! from a ring buffer of output hashes, and applies absolute path and command
//! blocklists that override any policy `allow`.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::policy::TerminationCondition;
use crate::core::types::ToolCall;

/// Ceilings enforced for a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyLimits {
    pub max_steps: u32,
    pub max_cost_usd: f64,
    /// Ring size N: N identical hashes, or a cycle of period <= N/2, is a stall.
    pub stall_window: usize,
}

/// Why a run must stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    BudgetExceeded { spent_usd: f64, budget_usd: f64 },
    StepLimit { steps: u32, limit: u32 },
    Stalled { window: usize, period: usize },
    BlockedPath { path: String },
    BlockedCommand { command: String },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExceeded {
                spent_usd,
                budget_usd,
            } => write!(f, "budget exceeded: spent ${spent_usd:.4} of ${budget_usd:.4}"),
            Self::StepLimit { steps, limit } => {
                write!(f, "step limit reached: {steps} of {limit}")
            }
            Self::Stalled { window, period } => write!(
                f,
                "stalled: last {window} outputs repeat with period {period}"
            ),
            Self::BlockedPath { path } => write!(f, "blocked path: {path}"),
            Self::BlockedCommand { command } => write!(f, "blocked command: {command}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Continue,
    Stop(StopReason),
}

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("stall_window must be >= 2, got {0}")]
    StallWindow(usize),
    #[error("blocked command pattern '{pattern}': {source}")]
    CommandPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Fixed-capacity ring of recent output hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRing {
    capacity: usize,
    hashes: VecDeque<String>,
}

impl HashRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            hashes: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, hash: String) {
        if self.hashes.len() == self.capacity {
            self.hashes.pop_front();
        }
        self.hashes.push_back(hash);
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Smallest repeating period, checked only once the ring is full.
    pub fn stall_period(&self) -> Option<usize> {
        if self.capacity < 2 || self.hashes.len() < self.capacity {
            return None;
        }
        let max_period = (self.capacity / 2).max(1);
        (1..=max_period).find(|&period| {
            (period..self.hashes.len()).all(|i| self.hashes[i] == self.hashes[i - period])
        })
    }
}

/// Per-run counters. Held in memory by the run loop and flushed to the Run
/// record on every status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyState {
    pub steps_taken: u32,
    pub cost_spent: f64,
    pub recent: HashRing,
}

/// Stable hash of a step output used for stall detection.
pub fn output_hash(output: &str) -> String {
    hex::encode(Sha256::digest(output.trim().as_bytes()))
}

#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    limits: SafetyLimits,
    blocked_paths: Vec<PathBuf>,
    blocked_commands: Vec<Regex>,
}

impl SafetyMonitor {
    pub fn new(
        limits: SafetyLimits,
        blocked_paths: &[String],
        blocked_commands: &[String],
    ) -> Result<Self, SafetyError> {
        if limits.stall_window < 2 {
            return Err(SafetyError::StallWindow(limits.stall_window));
        }
        let blocked_commands = blocked_commands
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| SafetyError::CommandPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let blocked_paths = blocked_paths
            .iter()
            .map(|raw| normalize(&expand_home(raw)))
            .collect();
        Ok(Self {
            limits,
            blocked_paths,
            blocked_commands,
        })
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Monitor whose ceilings are the minimum of these limits and the profile's
    /// termination conditions.
    pub fn with_termination(&self, conditions: &[TerminationCondition]) -> Self {
        let mut limits = self.limits.clone();
        for condition in conditions {
            match condition {
                TerminationCondition::MaxSteps { limit } => {
                    limits.max_steps = limits.max_steps.min(*limit);
                }
                TerminationCondition::MaxCost { usd } => {
                    limits.max_cost_usd = limits.max_cost_usd.min(*usd);
                }
            }
        }
        Self {
            limits,
            ..self.clone()
        }
    }

    pub fn new_state(&self) -> SafetyState {
        SafetyState {
            steps_taken: 0,
            cost_spent: 0.0,
            recent: HashRing::new(self.limits.stall_window),
        }
    }

    /// Decide whether the run may proceed. A pending tool call is checked
    /// against the blocklists first since those apply regardless of policy.
    pub fn check_before_step(&self, state: &SafetyState, pending: Option<&ToolCall>) -> Verdict {
        if let Some(call) = pending
            && let Some(reason) = self.blocked(call)
        {
            return Verdict::Stop(reason);
        }
        if state.cost_spent >= self.limits.max_cost_usd {
            return Verdict::Stop(StopReason::BudgetExceeded {
                spent_usd: state.cost_spent,
                budget_usd: self.limits.max_cost_usd,
            });
        }
        if state.steps_taken >= self.limits.max_steps {
            return Verdict::Stop(StopReason::StepLimit {
                steps: state.steps_taken,
                limit: self.limits.max_steps,
            });
        }
        if let Some(period) = state.recent.stall_period() {
            return Verdict::Stop(StopReason::Stalled {
                window: self.limits.stall_window,
                period,
            });
        }
        Verdict::Continue
    }

    pub fn record_step(&self, state: &mut SafetyState, output: &str, cost: f64) {
        state.steps_taken = state.steps_taken.saturating_add(1);
        if cost.is_finite() && cost > 0.0 {
            state.cost_spent += cost;
        }
        state.recent.push(output_hash(output));
    }

    fn blocked(&self, call: &ToolCall) -> Option<StopReason> {
        if let Some(raw) = call.path.as_deref() {
            let path = normalize(&expand_home(raw));
            if self
                .blocked_paths
                .iter()
                .any(|blocked| path.starts_with(blocked))
            {
                return Some(StopReason::BlockedPath {
                    path: raw.to_string(),
                });
            }
        }
        if let Some(command) = call.command()
            && self.blocked_commands.iter().any(|re| re.is_match(&command))
        {
            return Some(StopReason::BlockedCommand { command });
        }
        None
    }
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match std::env::var_os("HOME")
        {
            Some(home) => PathBuf::from(home).join(rest.trim_start_matches('/')),
            None => PathBuf::from(raw),
        },
        _ => PathBuf::from(raw),
    }
}

/// Lexical normalization: drops `.` and resolves `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(stall_window: usize) -> SafetyMonitor {
        SafetyMonitor::new(
            SafetyLimits {
                max_steps: 100,
                max_cost_usd: 10.0,
                stall_window,
            },
            &["/etc".to_string(), "/root/.ssh".to_string()],
            &[r"^\s*sudo\b".to_string(), r"rm\s+-rf\s+/(\s|$)".to_string()],
        )
        .expect("monitor")
    }

    fn record_all(monitor: &SafetyMonitor, state: &mut SafetyState, outputs: &[&str]) {
        for output in outputs {
            monitor.record_step(state, output, 0.0);
        }
    }

    #[test]
    fn identical_outputs_stall_only_once_window_is_full() {
        let m = monitor(4);
        let mut state = m.new_state();
        record_all(&m, &mut state, &["same", "same", "same"]);
        assert_eq!(m.check_before_step(&state, None), Verdict::Continue);

        record_all(&m, &mut state, &["same"]);
        assert_eq!(
            m.check_before_step(&state, None),
            Verdict::Stop(StopReason::Stalled {
                window: 4,
                period: 1
            })
        );
    }

    #[test]
    fn alternating_outputs_stall_with_period_two() {
        let m = monitor(4);
        let mut state = m.new_state();
        record_all(&m, &mut state, &["a", "b", "a", "b"]);
        assert!(matches!(
            m.check_before_step(&state, None),
            Verdict::Stop(StopReason::Stalled { period: 2, .. })
        ));
    }

    #[test]
    fn cycles_longer_than_half_window_do_not_stall() {
        let m = monitor(4);
        let mut state = m.new_state();
        record_all(&m, &mut state, &["a", "b", "c", "a"]);
        assert_eq!(m.check_before_step(&state, None), Verdict::Continue);
    }

    #[test]
    fn ring_keeps_only_latest_window() {
        let m = monitor(3);
        let mut state = m.new_state();
        record_all(&m, &mut state, &["x", "y", "y", "y"]);
        assert_eq!(state.recent.len(), 3);
        assert!(matches!(
            m.check_before_step(&state, None),
            Verdict::Stop(StopReason::Stalled { period: 1, .. })
        ));
    }

    #[test]
    fn trailing_whitespace_does_not_defeat_stall_detection() {
        assert_eq!(output_hash("done\n"), output_hash("done"));
    }

    #[test]
    fn budget_and_step_ceilings_stop() {
        let m = monitor(5);
        let mut state = m.new_state();
        m.record_step(&mut state, "a", 9.5);
        assert_eq!(m.check_before_step(&state, None), Verdict::Continue);
        m.record_step(&mut state, "b", 0.5);
        assert!(matches!(
            m.check_before_step(&state, None),
            Verdict::Stop(StopReason::BudgetExceeded { .. })
        ));

        let tight = m.with_termination(&[TerminationCondition::MaxSteps { limit: 2 }]);
        let mut state = tight.new_state();
        record_all(&tight, &mut state, &["a", "b"]);
        assert_eq!(
            tight.check_before_step(&state, None),
            Verdict::Stop(StopReason::StepLimit { steps: 2, limit: 2 })
        );
    }

    #[test]
    fn termination_conditions_never_loosen_limits() {
        let m = monitor(5);
        let looser = m.with_termination(&[
            TerminationCondition::MaxSteps { limit: 1000 },
            TerminationCondition::MaxCost { usd: 2.0 },
        ]);
        assert_eq!(looser.limits().max_steps, 100);
        assert_eq!(looser.limits().max_cost_usd, 2.0);
    }

    #[test]
    fn blocked_paths_survive_traversal_tricks() {
        let m = monitor(5);
        let state = m.new_state();
        let direct = ToolCall::new("fs", "read").with_path("/etc/passwd");
        let sneaky = ToolCall::new("fs", "read").with_path("/tmp/../etc/./shadow");
        let sibling = ToolCall::new("fs", "read").with_path("/etcetera/file");
        assert!(matches!(
            m.check_before_step(&state, Some(&direct)),
            Verdict::Stop(StopReason::BlockedPath { .. })
        ));
        assert!(matches!(
            m.check_before_step(&state, Some(&sneaky)),
            Verdict::Stop(StopReason::BlockedPath { .. })
        ));
        assert_eq!(m.check_before_step(&state, Some(&sibling)), Verdict::Continue);
    }

    #[test]
    fn blocked_commands_match_command_parameter() {
        let m = monitor(5);
        let state = m.new_state();
        let sudo = ToolCall::new("shell", "exec").with_parameter("command", "sudo ls");
        let wipe = ToolCall::new("shell", "exec")
            .with_parameter("command", serde_json::json!(["rm", "-rf", "/"]));
        let fine = ToolCall::new("shell", "exec").with_parameter("command", "rm -rf ./target");
        assert!(matches!(
            m.check_before_step(&state, Some(&sudo)),
            Verdict::Stop(StopReason::BlockedCommand { .. })
        ));
        assert!(matches!(
            m.check_before_step(&state, Some(&wipe)),
            Verdict::Stop(StopReason::BlockedCommand { .. })
        ));
        assert_eq!(m.check_before_step(&state, Some(&fine)), Verdict::Continue);
    }

    #[test]
    fn pending_call_hits_the_blocklist_before_any_ceiling() {
        let m = monitor(5);
        let mut state = m.new_state();
        m.record_step(&mut state, "expensive", 25.0);
        let blocked = ToolCall::new("fs", "read").with_path("/etc/shadow");
        let fine = ToolCall::new("fs", "write").with_path("notes.md");
        assert!(matches!(
            m.check_before_step(&state, Some(&blocked)),
            Verdict::Stop(StopReason::BlockedPath { .. })
        ));
        assert!(matches!(
            m.check_before_step(&state, Some(&fine)),
            Verdict::Stop(StopReason::BudgetExceeded { .. })
        ));
        assert_eq!(m.check_before_step(&m.new_state(), Some(&fine)), Verdict::Continue);
    }

    #[test]
    fn rejects_degenerate_window_and_bad_regex() {
        let limits = SafetyLimits {
            max_steps: 1,
            max_cost_usd: 1.0,
            stall_window: 1,
        };
        assert!(matches!(
            SafetyMonitor::new(limits.clone(), &[], &[]),
            Err(SafetyError::StallWindow(1))
        ));
        let limits = SafetyLimits {
            stall_window: 3,
            ..limits
        };
        assert!(matches!(
            SafetyMonitor::new(limits, &[], &["(".to_string()]),
            Err(SafetyError::CommandPattern { .. })
        ));
    }
}
