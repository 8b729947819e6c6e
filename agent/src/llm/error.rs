use std::time::Duration;

use thiserror::Error;

use crate::core::retry::{STATUS_OVERLOADED, is_retryable_status};

/// Markers of a malformed-request error that a fresh attempt may clear.
const RECOVERABLE_MARKERS: &[&str] = &[
    "invalid_request",
    "malformed",
    "tool_use ids",
    "tool_result",
    "unexpected",
];

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("giving up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<LlmError> },
    #[error("stream error: {0}")]
    Stream(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("model call cancelled")]
    Cancelled,
}

impl LlmError {
    /// Whether the connection phase should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Narrow heuristic for request-shape errors worth a local retry.
    pub fn is_recoverable(&self) -> bool {
        let message = match self {
            Self::Api { message, .. } | Self::Stream(message) => message.to_lowercase(),
            _ => return false,
        };
        RECOVERABLE_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }

    /// Plain-English explanation for the operator.
    pub fn user_message(&self) -> String {
        match self {
            Self::RetryExhausted { attempts, last } => match last.as_ref() {
                Self::Api { status: 429, .. } => format!(
                    "The model provider is rate limiting requests ({attempts} attempts). Wait a minute and run again."
                ),
                Self::Api { status, .. } if *status >= 500 || *status == STATUS_OVERLOADED => {
                    format!(
                        "The model provider is temporarily unavailable ({attempts} attempts). Try again shortly."
                    )
                }
                Self::Transport(_) => format!(
                    "Could not reach the model provider after {attempts} attempts. Check your network connection."
                ),
                _ => format!("The model request failed after {attempts} attempts."),
            },
            Self::Api {
                status: 401 | 403, ..
            } => "The model provider rejected the credentials. Check SETUP_AGENT_API_KEY or SETUP_AGENT_PROXY_TOKEN.".to_string(),
            Self::Api { status: 429, .. } => {
                "The model provider is rate limiting requests. Wait a minute and run again.".to_string()
            }
            Self::Api { .. } => "The model provider rejected the request.".to_string(),
            Self::Transport(_) => {
                "Could not reach the model provider. Check your network connection.".to_string()
            }
            Self::Stream(_) | Self::Decode(_) => {
                "The model response was cut off or unreadable. Re-running usually resumes from the last completed phase.".to_string()
            }
            Self::Timeout(_) => "The model took too long to respond.".to_string(),
            Self::Cancelled => "The run was cancelled.".to_string(),
        }
    }
}
