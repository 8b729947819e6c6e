//! Tool contracts, registry and dispatch.
//!
//! A tool is a named JSON-schema contract plus an async handler. The registry
//! is an explicit object built at startup and handed to the phase loop; there
//! is no process-wide tool table.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use jsonschema::{Draft, Validator};
use serde_json::Value;
use thiserror::Error;

use crate::core::types::ToolSchema;
use crate::events::truncate_chars;

pub mod builtin;
pub mod executor;
pub mod operator;

pub use executor::{CallPolicy, DispatchError, ToolExecutor, ToolOutcome};
pub use operator::{ConfirmDecision, ConfirmRequest, Operator};

const PREVIEW_LIMIT: usize = 200;

/// Deliberate, agent-initiated abort. Propagates through dispatch untouched
/// and terminates the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("setup aborted by agent: {reason}")]
pub struct AbortError {
    pub reason: String,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: Value) -> Result<String>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    async fn call(&self, input: Value) -> Result<String> {
        (self.0)(input).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A registered tool.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub requires_confirmation: bool,
    pub timeout: Option<Duration>,
    /// Waits on a human; runs without a timeout.
    pub interactive: bool,
    /// Input field holding a shell command, if any.
    pub command_field: Option<&'static str>,
    handler: Arc<dyn ToolHandler>,
    validator: Option<Arc<Validator>>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("requires_confirmation", &self.requires_confirmation)
            .field("timeout", &self.timeout)
            .field("interactive", &self.interactive)
            .finish_non_exhaustive()
    }
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            requires_confirmation: false,
            timeout: None,
            interactive: false,
            command_field: None,
            handler,
            validator: None,
        }
    }

    pub fn confirm(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn command_field(mut self, field: &'static str) -> Self {
        self.command_field = Some(field);
        self
    }

    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }

    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        Arc::clone(&self.handler)
    }

    /// Schema violations, empty when the input is acceptable.
    pub fn validate_input(&self, input: &Value) -> Vec<String> {
        match &self.validator {
            Some(validator) => validator
                .iter_errors(input)
                .map(|err| err.to_string())
                .collect(),
            None => Vec::new(),
        }
    }

    /// The shell command carried by this input, if the tool runs one.
    pub fn command<'a>(&self, input: &'a Value) -> Option<&'a str> {
        self.command_field
            .and_then(|field| input.get(field))
            .and_then(Value::as_str)
    }

    /// Short human-readable rendering of a call, for confirmation and events.
    pub fn preview(&self, input: &Value) -> String {
        if let Some(command) = self.command(input) {
            return truncate_chars(command, PREVIEW_LIMIT);
        }
        if let Some(path) = input.get("path").and_then(Value::as_str) {
            let size = input
                .get("content")
                .and_then(Value::as_str)
                .map(|c| format!(" ({} bytes)", c.len()))
                .unwrap_or_default();
            return format!("{path}{size}");
        }
        truncate_chars(&input.to_string(), PREVIEW_LIMIT)
    }
}

/// Name-keyed set of tools.
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, compiling its input schema.
    pub fn register(&mut self, mut spec: ToolSpec) -> Result<()> {
        if self.tools.contains_key(&spec.name) {
            bail!("tool {} registered twice", spec.name);
        }
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&spec.input_schema)
            .with_context(|| format!("compile input schema for {}", spec.name))?;
        spec.validator = Some(Arc::new(validator));
        self.tools.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
