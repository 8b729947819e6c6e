//! Stable exit codes for the `setup-agent` CLI.

/// Every scheduled phase completed (optional failures included).
pub const OK: i32 = 0;
/// A required phase failed, or the run could not start.
pub const FAILED: i32 = 1;
/// The agent called `abort_setup`.
pub const ABORTED: i32 = 2;
/// Interrupted by Ctrl-C.
pub const INTERRUPTED: i32 = 130;
