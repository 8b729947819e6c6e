//! Phases: immutable descriptors, the manager that owns `State`, the default
//! pipelines and the conversational loop that drives one phase to completion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::state::State;
use crate::llm::LlmError;
use crate::tools::CallPolicy;

pub mod hooks;
pub mod manager;
pub mod pipeline;
pub mod runner;

pub use manager::PhaseManager;
pub use pipeline::Mode;
pub use runner::{PhaseReport, PhaseRunner, PipelineOutcome, RunSettings, run_pipeline};

/// The tool the model calls to finish a phase.
pub const TRANSITION_TOOL: &str = "transition";

/// One tool made available to a phase, with per-phase overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTool {
    pub name: &'static str,
    /// `Some` overrides the registry default.
    pub requires_confirmation: Option<bool>,
    pub timeout: Option<Duration>,
}

impl PhaseTool {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            requires_confirmation: None,
            timeout: None,
        }
    }

    pub const fn confirm(mut self, required: bool) -> Self {
        self.requires_confirmation = Some(required);
        self
    }

    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn policy(&self) -> CallPolicy {
        CallPolicy {
            requires_confirmation: self.requires_confirmation,
            timeout: self.timeout,
        }
    }
}

/// Extra prompt context computed when a phase starts.
///
/// Implementations must not fail the phase: an error is turned into a warning
/// line in the prompt.
#[async_trait]
pub trait PhaseHook: Send + Sync {
    async fn on_enter(&self, state: &State) -> anyhow::Result<String>;
}

/// Immutable description of one unit of agent work.
#[derive(Clone)]
pub struct Phase {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// minijinja source rendered with `state` and `mode`.
    pub prompt: &'static str,
    pub tools: Vec<PhaseTool>,
    /// Failure of a required phase ends the run.
    pub required: bool,
    /// Falls back to the configured default when unset.
    pub max_iterations: Option<u32>,
    pub hook: Option<Arc<dyn PhaseHook>>,
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("id", &self.id)
            .field("required", &self.required)
            .field("max_iterations", &self.max_iterations)
            .field("tools", &self.tools.iter().map(|t| t.name).collect::<Vec<_>>())
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

impl Phase {
    pub fn new(
        id: &'static str,
        name: &'static str,
        description: &'static str,
        prompt: &'static str,
    ) -> Self {
        Self {
            id,
            name,
            description,
            prompt,
            tools: Vec::new(),
            required: true,
            max_iterations: None,
            hook: None,
        }
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = PhaseTool>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn hook(mut self, hook: Option<Arc<dyn PhaseHook>>) -> Self {
        self.hook = hook;
        self
    }

    pub fn tool(&self, name: &str) -> Option<&PhaseTool> {
        self.tools.iter().find(|tool| tool.name == name)
    }
}

/// Failures that end a phase.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("phase {phase} did not transition within {max_iterations} iterations")]
    IterationBudgetExceeded { phase: String, max_iterations: u32 },
    #[error("token budget exceeded: {used} of {ceiling} tokens used")]
    TokenBudgetExceeded { used: u64, ceiling: u64 },
    #[error("phase {phase} timed out after {}s", .timeout.as_secs())]
    Timeout { phase: String, timeout: Duration },
    #[error("phase {phase} cancelled")]
    Cancelled { phase: String },
    #[error(
        "model call failed in phase {phase} (iteration {iteration}, after {:.1}s)",
        .elapsed.as_secs_f64()
    )]
    Api {
        phase: String,
        iteration: u32,
        elapsed: Duration,
        #[source]
        source: LlmError,
    },
}

impl PhaseError {
    /// Failures that end the run even when the phase is optional.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TokenBudgetExceeded { .. } | Self::Cancelled { .. }
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::IterationBudgetExceeded { phase, .. } => format!(
                "The agent kept working on the {phase} phase without finishing it. Check the transcript under .setup-agent/transcripts/ to see where it got stuck."
            ),
            Self::TokenBudgetExceeded { .. } => {
                "The run used up its token budget. Raise max_total_tokens in .setup-agent/config.toml to continue.".to_string()
            }
            Self::Timeout { phase, .. } => format!(
                "The {phase} phase took too long. Raise phase_timeout_secs in .setup-agent/config.toml or rerun to resume."
            ),
            Self::Cancelled { .. } => "The run was interrupted. Rerun to resume where it stopped.".to_string(),
            Self::Api { source, .. } => source.user_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_tool_policy_carries_overrides() {
        let tool = PhaseTool::new("run_command")
            .confirm(false)
            .timeout(Duration::from_secs(9));
        assert_eq!(
            tool.policy(),
            CallPolicy {
                requires_confirmation: Some(false),
                timeout: Some(Duration::from_secs(9)),
            }
        );
        assert_eq!(PhaseTool::new("read_file").policy(), CallPolicy::default());
    }

    #[test]
    fn phase_builder_defaults_to_required() {
        let phase = Phase::new("discover", "Discover", "d", "p")
            .tools([PhaseTool::new("read_file")])
            .max_iterations(5);
        assert!(phase.required);
        assert_eq!(phase.max_iterations, Some(5));
        assert!(phase.tool("read_file").is_some());
        assert!(phase.tool("write_file").is_none());
        assert!(!Phase::new("report", "Report", "d", "p").optional().required);
    }

    #[test]
    fn api_error_message_names_phase_and_iteration() {
        let err = PhaseError::Api {
            phase: "verify".to_string(),
            iteration: 3,
            elapsed: Duration::from_millis(1500),
            source: LlmError::Api {
                status: 400,
                message: "bad".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "model call failed in phase verify (iteration 3, after 1.5s)"
        );
        assert!(!err.is_fatal());
        assert!(
            PhaseError::TokenBudgetExceeded {
                used: 2,
                ceiling: 1
            }
            .is_fatal()
        );
    }
}
