//! I/O adapters for the orchestrator.
//!
//! Each external collaborator sits behind a trait defined here so the run
//! state machine and scheduler can be driven by fakes in tests.

pub mod approval;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod event_log;
pub mod gates;
pub mod git;
pub mod process;
pub mod profiles;
pub mod store;
pub mod workspace;
