//! Autonomous setup agent runtime.
//!
//! An LLM drives a fixed pipeline of phases (discover, verify, instrument,
//! configure, test, report) through a tool-calling conversation. The crate is
//! split the same way throughout:
//!
//! - **[`core`]**: Pure logic (state merging, retry math, command policy,
//!   report validation, token budgets). No I/O, fully testable in isolation.
//! - **[`io`]**: Side effects (processes, background services, config,
//!   progress checkpoints, prompts, transcripts).
//! - **[`llm`]**: The model client seam and its streaming HTTP implementation.
//! - **[`tools`]**: Tool contracts, the built-in tool set and gated dispatch.
//! - **[`phase`]**: Phase descriptors, the manager that owns `State`, and the
//!   loop that runs a phase to its `transition` call.

pub mod core;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod llm;
pub mod logging;
pub mod phase;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
