//! Observable agent progress, consumed by the CLI renderer.
//!
//! Events are product output, separate from `tracing` diagnostics.

use std::sync::Arc;
use std::time::Duration;

use crate::core::types::Usage;

/// Tool output is truncated to this many characters in events.
pub const EVENT_OUTPUT_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    PhaseStarted {
        id: String,
        name: String,
        index: usize,
        total: usize,
    },
    PhaseCompleted {
        id: String,
        iterations: u32,
        duration: Duration,
    },
    PhaseFailed {
        id: String,
        required: bool,
        error: String,
    },
    PhaseSkipped {
        id: String,
    },
    ModelText(String),
    ToolStarted {
        name: String,
        preview: String,
    },
    ToolCompleted {
        name: String,
        success: bool,
        output: String,
    },
    Retrying {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    Nudged {
        phase: String,
        iteration: u32,
    },
    TokensUsed {
        turn: Usage,
        total: Usage,
    },
}

pub type EventSink = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Sink that drops every event.
pub fn null_sink() -> EventSink {
    Arc::new(|_| {})
}

/// Truncate to `limit` characters, marking the cut.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
