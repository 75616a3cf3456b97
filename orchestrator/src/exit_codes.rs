//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded, the plan completed, or the evaluated decision is `allow`.
pub const OK: i32 = 0;
/// Command failed due to invalid config, profile, plan file or other errors.
pub const INVALID: i32 = 1;
/// `orchestrator plan run` finished with the plan `failed`.
pub const PLAN_FAILED: i32 = 2;
/// `orchestrator policy eval` resolved to `deny`.
pub const DENIED: i32 = 3;
/// `orchestrator policy eval` resolved to `ask`.
pub const ASK: i32 = 4;
/// `orchestrator plan run` finished with the plan `cancelled`.
pub const CANCELLED: i32 = 5;
