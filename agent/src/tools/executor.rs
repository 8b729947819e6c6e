//! Dispatch of one model-requested tool call.
//!
//! Order of checks: resolve by name, validate input against the schema, run
//! the confirmation gate, then race the handler against its timeout. Every
//! failure becomes a result the model can react to, except an [`AbortError`]
//! from the handler and external cancellation.
//!
//! The handler runs on its own task and reports through a single-slot
//! channel. A handler that loses the race against its timeout is not
//! preempted: it keeps running and its side effects (a spawned background
//! process, a written file) persist.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::command_policy::{extract_command_prefixes, is_command_allowed};
use crate::core::types::{ContentBlock, ToolCall};
use crate::events::{AgentEvent, EVENT_OUTPUT_LIMIT, EventSink, truncate_chars};
use crate::tools::operator::{ConfirmDecision, ConfirmRequest, Operator};
use crate::tools::{AbortError, ToolRegistry, ToolSpec};

/// Per-phase overrides for one tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallPolicy {
    /// `Some` overrides the registry's confirmation default.
    pub requires_confirmation: Option<bool>,
    pub timeout: Option<Duration>,
}

/// Result of a dispatched call, ready to become a `tool_result` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    pub fn into_block(self, tool_use_id: &str) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: self.content,
            is_error: self.is_error,
        }
    }
}

/// Failures that end the phase rather than the tool call.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Aborted(#[from] AbortError),
    #[error("tool call cancelled")]
    Cancelled,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    operator: Arc<dyn Operator>,
    waive_confirmation: bool,
    approved_prefixes: HashSet<String>,
    approved_tools: HashSet<String>,
    default_timeout: Duration,
    events: EventSink,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        operator: Arc<dyn Operator>,
        default_timeout: Duration,
        events: EventSink,
    ) -> Self {
        Self {
            registry,
            operator,
            waive_confirmation: false,
            approved_prefixes: HashSet::new(),
            approved_tools: HashSet::new(),
            default_timeout,
            events,
        }
    }

    /// Skip every confirmation gate (`--yes`).
    pub fn waive_confirmation(mut self, waive: bool) -> Self {
        self.waive_confirmation = waive;
        self
    }

    pub fn with_approved_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.approved_prefixes
            .extend(prefixes.into_iter().map(Into::into));
        self
    }

    pub fn approved_prefixes(&self) -> &HashSet<String> {
        &self.approved_prefixes
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    #[instrument(skip_all, fields(tool = %call.name, id = %call.id))]
    pub async fn dispatch(
        &mut self,
        call: &ToolCall,
        policy: CallPolicy,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome, DispatchError> {
        let Some(spec) = self.registry.get(&call.name).cloned() else {
            warn!("unknown tool requested");
            let known: Vec<&str> = self.registry.names().collect();
            return Ok(ToolOutcome::error(format!(
                "unknown tool '{}'. Available tools: {}",
                call.name,
                known.join(", ")
            )));
        };

        let violations = spec.validate_input(&call.input);
        if !violations.is_empty() {
            debug!(?violations, "tool input rejected");
            return Ok(ToolOutcome::error(format!(
                "invalid input for {}: {}",
                spec.name,
                violations.join("; ")
            )));
        }

        let preview = spec.preview(&call.input);
        let requires_confirmation = policy
            .requires_confirmation
            .unwrap_or(spec.requires_confirmation);
        if requires_confirmation && !self.confirmed(&spec, call, &preview, cancel).await? {
            info!("tool call denied by operator");
            let outcome = ToolOutcome::error(format!(
                "The operator declined this {} call. Do not retry it unchanged; choose a different approach or ask the user how to proceed.",
                spec.name
            ));
            self.emit_completed(&spec.name, &outcome);
            return Ok(outcome);
        }

        (self.events)(&AgentEvent::ToolStarted {
            name: spec.name.clone(),
            preview,
        });
        let timeout = policy
            .timeout
            .or(spec.timeout)
            .unwrap_or(self.default_timeout);
        let outcome = run_handler(&spec, call.input.clone(), timeout, cancel).await?;
        self.emit_completed(&spec.name, &outcome);
        Ok(outcome)
    }

    async fn confirmed(
        &mut self,
        spec: &ToolSpec,
        call: &ToolCall,
        preview: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, DispatchError> {
        if self.waive_confirmation || self.approved_tools.contains(&spec.name) {
            return Ok(true);
        }
        let command = spec.command(&call.input).map(str::trim).unwrap_or_default();
        let prefixes = extract_command_prefixes(command);
        // A command with no prefix to check still goes to the operator.
        if !prefixes.is_empty() && is_command_allowed(command, &self.approved_prefixes) {
            debug!(?prefixes, "command pre-approved");
            return Ok(true);
        }

        let request = ConfirmRequest {
            tool: spec.name.clone(),
            preview: preview.to_string(),
            prefixes: prefixes.clone(),
        };
        let decision = tokio::select! {
            decision = self.operator.confirm(&request) => decision,
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
        };
        Ok(match decision {
            Ok(ConfirmDecision::Allow) => true,
            Ok(ConfirmDecision::AllowAlways) => {
                if spec.command_field.is_none() {
                    self.approved_tools.insert(spec.name.clone());
                } else {
                    self.approved_prefixes.extend(prefixes);
                }
                true
            }
            Ok(ConfirmDecision::Deny) => false,
            Err(err) => {
                warn!(error = %err, "confirmation failed; treating as denied");
                false
            }
        })
    }

    fn emit_completed(&self, name: &str, outcome: &ToolOutcome) {
        (self.events)(&AgentEvent::ToolCompleted {
            name: name.to_string(),
            success: !outcome.is_error,
            output: truncate_chars(&outcome.content, EVENT_OUTPUT_LIMIT),
        });
    }
}

async fn run_handler(
    spec: &ToolSpec,
    input: serde_json::Value,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ToolOutcome, DispatchError> {
    let (tx, rx) = oneshot::channel();
    let handler = spec.handler();
    tokio::spawn(async move {
        let _ = tx.send(handler.call(input).await);
    });

    let received = if spec.interactive {
        tokio::select! {
            received = rx => received,
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
        }
    } else {
        tokio::select! {
            received = rx => received,
            _ = tokio::time::sleep(timeout) => {
                warn!(?timeout, "tool timed out; handler left running");
                return Ok(ToolOutcome::error(format!(
                    "{} timed out after {}s. Any process it started may still be running.",
                    spec.name,
                    timeout.as_secs_f64()
                )));
            }
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
        }
    };

    match received {
        Ok(Ok(output)) => Ok(ToolOutcome::ok(output)),
        Ok(Err(err)) => {
            if let Some(abort) = err.downcast_ref::<AbortError>() {
                return Err(DispatchError::Aborted(abort.clone()));
            }
            Ok(ToolOutcome::error(format!("{err:#}")))
        }
        Err(_) => Ok(ToolOutcome::error(format!(
            "{} failed unexpectedly before returning a result",
            spec.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::null_sink;
    use crate::test_support::RecordingOperator;
    use crate::tools::{ToolSpec, handler_fn};
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry(specs: Vec<ToolSpec>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        for spec in specs {
            registry.register(spec).expect("register");
        }
        Arc::new(registry)
    }

    fn any_object() -> Value {
        json!({"type": "object"})
    }

    fn call(name: &str, input: Value) -> ToolCall {
        ToolCall {
            id: "tu_1".to_string(),
            name: name.to_string(),
            input,
        }
    }

    fn executor(specs: Vec<ToolSpec>, operator: Arc<dyn Operator>) -> ToolExecutor {
        ToolExecutor::new(registry(specs), operator, Duration::from_secs(5), null_sink())
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let mut executor = executor(Vec::new(), Arc::new(RecordingOperator::new()));
        let outcome = executor
            .dispatch(&call("nope", json!({})), CallPolicy::default(), &CancellationToken::new())
            .await
            .expect("dispatch");
        assert!(outcome.is_error);
        assert!(outcome.content.contains("unknown tool 'nope'"));
    }

    #[tokio::test]
    async fn schema_violation_skips_handler() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let spec = ToolSpec::new(
            "read_file",
            "read",
            json!({"type": "object", "required": ["path"]}),
            handler_fn(move |_| {
                let flag = Arc::clone(&flag);
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok("content".to_string())
                }
            }),
        );
        let mut executor = executor(vec![spec], Arc::new(RecordingOperator::new()));
        let outcome = executor
            .dispatch(&call("read_file", json!({})), CallPolicy::default(), &CancellationToken::new())
            .await
            .expect("dispatch");
        assert!(outcome.is_error);
        assert!(outcome.content.starts_with("invalid input for read_file"));
        assert!(!ran.load(Ordering::SeqCst));
    }

    /// Verifies a slow handler loses the race and keeps running afterwards.
    #[tokio::test]
    async fn timeout_abandons_handler() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let spec = ToolSpec::new(
            "slow",
            "slow",
            any_object(),
            handler_fn(move |_| {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok("late".to_string())
                }
            }),
        )
        .with_timeout(Duration::from_millis(20));
        let mut executor = executor(vec![spec], Arc::new(RecordingOperator::new()));
        let outcome = executor
            .dispatch(&call("slow", json!({})), CallPolicy::default(), &CancellationToken::new())
            .await
            .expect("dispatch");
        assert!(outcome.is_error);
        assert!(outcome.content.contains("timed out"));
        assert!(!finished.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn phase_timeout_overrides_tool_timeout() {
        let spec = ToolSpec::new(
            "slow",
            "slow",
            any_object(),
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok("done".to_string())
            }),
        )
        .with_timeout(Duration::from_millis(5));
        let mut executor = executor(vec![spec], Arc::new(RecordingOperator::new()));
        let policy = CallPolicy {
            requires_confirmation: None,
            timeout: Some(Duration::from_secs(2)),
        };
        let outcome = executor
            .dispatch(&call("slow", json!({})), policy, &CancellationToken::new())
            .await
            .expect("dispatch");
        assert_eq!(outcome, ToolOutcome::ok("done"));
    }

    #[tokio::test]
    async fn abort_sentinel_propagates() {
        let spec = ToolSpec::new(
            "abort_setup",
            "abort",
            any_object(),
            handler_fn(|_| async {
                Err(anyhow::Error::new(AbortError {
                    reason: "unsupported runtime".to_string(),
                }))
            }),
        );
        let mut executor = executor(vec![spec], Arc::new(RecordingOperator::new()));
        let err = executor
            .dispatch(&call("abort_setup", json!({})), CallPolicy::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Aborted(AbortError { ref reason }) if reason == "unsupported runtime"));
    }

    #[tokio::test]
    async fn handler_errors_become_results() {
        let spec = ToolSpec::new(
            "fails",
            "fails",
            any_object(),
            handler_fn(|_| async { Err(anyhow::anyhow!("disk full")) }),
        );
        let mut executor = executor(vec![spec], Arc::new(RecordingOperator::new()));
        let outcome = executor
            .dispatch(&call("fails", json!({})), CallPolicy::default(), &CancellationToken::new())
            .await
            .expect("dispatch");
        assert_eq!(outcome, ToolOutcome::error("disk full"));
    }

    fn command_tool() -> ToolSpec {
        ToolSpec::new(
            "run_command",
            "run",
            json!({"type": "object", "required": ["command"]}),
            handler_fn(|input: Value| async move {
                Ok(format!("ran {}", input["command"].as_str().unwrap_or_default()))
            }),
        )
        .confirm()
        .command_field("command")
    }

    #[tokio::test]
    async fn denial_nudges_without_running() {
        let operator = Arc::new(RecordingOperator::new().with_decisions([ConfirmDecision::Deny]));
        let mut executor = executor(vec![command_tool()], operator.clone());
        let outcome = executor
            .dispatch(
                &call("run_command", json!({"command": "npm install"})),
                CallPolicy::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("dispatch");
        assert!(outcome.is_error);
        assert!(outcome.content.contains("declined"));
        let requests = operator.confirmations();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prefixes, vec!["npm install"]);
    }

    /// Verifies "always allow" approves the command prefixes for later calls.
    #[tokio::test]
    async fn allow_always_grows_prefix_allow_list() {
        let operator =
            Arc::new(RecordingOperator::new().with_decisions([ConfirmDecision::AllowAlways]));
        let mut executor = executor(vec![command_tool()], operator.clone());
        let cancel = CancellationToken::new();
        for command in ["npm install", "npm install && npm install left-pad"] {
            let outcome = executor
                .dispatch(
                    &call("run_command", json!({"command": command})),
                    CallPolicy::default(),
                    &cancel,
                )
                .await
                .expect("dispatch");
            assert!(!outcome.is_error);
        }
        assert_eq!(operator.confirmations().len(), 1);
        assert!(executor.approved_prefixes().contains("npm install"));
    }

    #[tokio::test]
    async fn pre_approved_prefixes_and_waiver_skip_the_gate() {
        let operator = Arc::new(RecordingOperator::new());
        let mut executor = executor(vec![command_tool()], operator.clone())
            .with_approved_prefixes(["npm test", "cd"]);
        let outcome = executor
            .dispatch(
                &call("run_command", json!({"command": "cd web && npm test"})),
                CallPolicy::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("dispatch");
        assert!(!outcome.is_error);

        let mut waived = self::executor(vec![command_tool()], operator.clone()).waive_confirmation(true);
        waived
            .dispatch(
                &call("run_command", json!({"command": "make"})),
                CallPolicy::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("dispatch");
        assert!(operator.confirmations().is_empty());
    }

    /// Verifies substitutions and redirects behind `echo` still reach the operator.
    #[tokio::test]
    async fn trivial_looking_commands_are_still_confirmed() {
        let operator = Arc::new(
            RecordingOperator::new().with_decisions([ConfirmDecision::Deny, ConfirmDecision::Deny]),
        );
        let mut executor = executor(vec![command_tool()], operator.clone())
            .with_approved_prefixes(["cd", "npm test"]);
        let cancel = CancellationToken::new();
        for command in [
            "echo $(node -e 'require(\"fs\").rmSync(\"src\",{recursive:true})')",
            "echo '{}' > package.json",
        ] {
            let outcome = executor
                .dispatch(
                    &call("run_command", json!({"command": command})),
                    CallPolicy::default(),
                    &cancel,
                )
                .await
                .expect("dispatch");
            assert!(outcome.is_error, "{command} ran unconfirmed");
            assert!(outcome.content.contains("declined"));
        }
        let requests = operator.confirmations();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].prefixes, vec!["echo", "node"]);
        assert_eq!(requests[1].prefixes, vec!["echo"]);
    }

    #[tokio::test]
    async fn prefixless_command_asks_and_allow_always_does_not_approve_the_tool() {
        let operator = Arc::new(
            RecordingOperator::new()
                .with_decisions([ConfirmDecision::AllowAlways, ConfirmDecision::Deny]),
        );
        let mut executor = executor(vec![command_tool()], operator.clone());
        let cancel = CancellationToken::new();
        let first = executor
            .dispatch(&call("run_command", json!({"command": "true"})), CallPolicy::default(), &cancel)
            .await
            .expect("dispatch");
        assert!(!first.is_error);
        let second = executor
            .dispatch(&call("run_command", json!({"command": "make"})), CallPolicy::default(), &cancel)
            .await
            .expect("dispatch");
        assert!(second.is_error);
        assert_eq!(operator.confirmations().len(), 2);
    }

    #[tokio::test]
    async fn phase_policy_can_require_confirmation() {
        let operator = Arc::new(RecordingOperator::new().with_decisions([ConfirmDecision::Deny]));
        let spec = ToolSpec::new("write_file", "w", any_object(), handler_fn(|_| async { Ok(String::new()) }));
        let mut executor = executor(vec![spec], operator.clone());
        let policy = CallPolicy {
            requires_confirmation: Some(true),
            timeout: None,
        };
        let outcome = executor
            .dispatch(&call("write_file", json!({"path": "a"})), policy, &CancellationToken::new())
            .await
            .expect("dispatch");
        assert!(outcome.is_error);
        assert_eq!(operator.confirmations()[0].preview, "a");
    }

    #[tokio::test]
    async fn emits_start_and_truncated_completion() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let events: EventSink = Arc::new(move |event: &AgentEvent| {
            sink_seen.lock().expect("events lock").push(event.clone());
        });
        let spec = ToolSpec::new(
            "big",
            "big",
            any_object(),
            handler_fn(|_| async { Ok("x".repeat(2000)) }),
        );
        let mut executor = ToolExecutor::new(
            registry(vec![spec]),
            Arc::new(RecordingOperator::new()),
            Duration::from_secs(5),
            events,
        );
        executor
            .dispatch(&call("big", json!({})), CallPolicy::default(), &CancellationToken::new())
            .await
            .expect("dispatch");
        let seen = seen.lock().expect("events lock");
        assert!(matches!(seen[0], AgentEvent::ToolStarted { .. }));
        match &seen[1] {
            AgentEvent::ToolCompleted { success, output, .. } => {
                assert!(*success);
                assert_eq!(output.chars().count(), EVENT_OUTPUT_LIMIT + 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_dispatch() {
        let spec = ToolSpec::new(
            "hang",
            "hang",
            any_object(),
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(String::new())
            }),
        );
        let mut executor = executor(vec![spec], Arc::new(RecordingOperator::new()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = executor
            .dispatch(&call("hang", json!({})), CallPolicy::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }
}
