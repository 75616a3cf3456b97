//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod consensus;
pub mod dag;
pub mod events;
pub mod model;
pub mod pattern;
pub mod policy;
pub mod safety;
pub mod transitions;
pub mod types;
