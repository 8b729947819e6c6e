//! Deterministic, pure logic shared by the agent runtime.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod command_policy;
pub mod eligibility;
pub mod retry;
pub mod ring_buffer;
pub mod state;
pub mod types;
