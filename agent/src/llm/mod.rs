//! Model provider access: the [`ModelClient`] seam, the HTTP/SSE client and its
//! error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::types::{Message, ModelResponse, StopReason, ToolSchema, Usage};

pub mod client;
pub mod error;
pub mod sse;

pub use client::{Auth, ClientSettings, LlmClient};
pub use error::LlmError;

/// One model turn's input.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

/// Incremental progress reported while a turn is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolUseStart {
        id: String,
        name: String,
    },
    ToolUseComplete {
        id: String,
        name: String,
        input: Value,
    },
    MessageComplete {
        stop_reason: Option<StopReason>,
        usage: Usage,
    },
    Retrying {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
}

/// Sends one conversation turn to a model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn send(
        &self,
        request: &ModelRequest,
        on_event: &mut (dyn for<'e> FnMut(&'e StreamEvent) + Send),
    ) -> Result<ModelResponse, LlmError>;
}
