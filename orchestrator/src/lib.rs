//! Run execution state machine and multi-agent plan scheduler.
//!
//! A *run* drives one coding agent against a workspace step by step: every
//! step is checkpointed, dispatched to a pluggable worker, gated by a
//! permission policy and safety limits, and (on a completion claim) verified
//! by quality gates. A *plan* schedules many runs as a dependency graph under
//! one of the `sequential`, `parallel`, `ping_pong` or `consensus` protocols.
//!
//! - **[`core`]**: Pure, deterministic logic (policy evaluation, safety
//!   verdicts, status transitions, DAG validation, consensus voting).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (store, event log, git, worker
//!   processes, approvals, quality gates). Each sits behind a trait so tests
//!   can swap in fakes.
//!
//! Orchestration modules ([`checkpoint`], [`run`], [`scheduler`]) coordinate
//! core logic with I/O.

pub mod checkpoint;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod retry;
pub mod run;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
