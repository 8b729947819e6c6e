//! The conversational loop for one phase, and the pipeline driver on top.
//!
//! Exactly one model turn or one tool dispatch is in flight at a time. Tools
//! requested in a turn run in emission order and every `tool_use` block is
//! answered before the next turn.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::TokenBudget;
use crate::core::state::State;
use crate::core::types::{ContentBlock, Message, ModelResponse, StopReason, ToolCall, ToolSchema, Usage};
use crate::events::{AgentEvent, EVENT_OUTPUT_LIMIT, EventSink, truncate_chars};
use crate::io::background::ProcessManager;
use crate::io::config::AgentConfig;
use crate::io::paths::AgentPaths;
use crate::io::progress::{load_progress, write_progress};
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::transcript::{TranscriptMeta, TranscriptWriteRequest, write_transcript};
use crate::llm::{LlmError, ModelClient, ModelRequest, StreamEvent};
use crate::phase::pipeline::{ELIGIBILITY_PHASE, Mode, cloud_extension};
use crate::phase::{Phase, PhaseError, PhaseManager, TRANSITION_TOOL};
use crate::tools::{AbortError, DispatchError, ToolExecutor, ToolOutcome};

/// Local retries for request-shape errors before a model failure ends the phase.
const RECOVERABLE_RETRIES: u32 = 2;
const RECOVERABLE_BACKOFF: Duration = Duration::from_secs(1);

const NUDGE: &str = "Continue working on this phase by calling tools. When the phase goal is met, call `transition` with your results and notes.";
const NUDGE_TRUNCATED: &str = "Your last reply was cut off by the output limit. Continue with a smaller step: call a tool, or call `transition` if the phase goal is met.";

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub mode: Mode,
    /// Append the cloud extension once the base pipeline completes.
    pub cloud: bool,
    /// Ignore an existing progress checkpoint.
    pub fresh: bool,
    pub api_timeout: Duration,
    pub phase_timeout: Duration,
    pub default_max_iterations: u32,
    pub max_total_tokens: u64,
    pub prompt_budget_bytes: usize,
    pub recoverable_retries: u32,
    /// Multiplied by the retry number.
    pub recoverable_backoff: Duration,
    pub paths: AgentPaths,
}

impl RunSettings {
    pub fn from_config(config: &AgentConfig, paths: AgentPaths, mode: Mode) -> Self {
        Self {
            mode,
            cloud: false,
            fresh: false,
            api_timeout: config.api_timeout(),
            phase_timeout: config.phase_timeout(),
            default_max_iterations: config.default_max_iterations,
            max_total_tokens: config.max_total_tokens,
            prompt_budget_bytes: config.prompt_budget_bytes,
            recoverable_retries: RECOVERABLE_RETRIES,
            recoverable_backoff: RECOVERABLE_BACKOFF,
            paths,
        }
    }
}

/// Summary of one completed phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: String,
    pub iterations: u32,
    pub usage: Usage,
    pub duration: Duration,
}

/// Summary of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub completed: Vec<String>,
    /// Optional phases that failed and were passed over.
    pub skipped: Vec<String>,
    pub notes: Vec<(String, String)>,
    pub usage: Usage,
    pub state: State,
}

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<Message>,
    iterations: u32,
    usage: Usage,
}

pub struct PhaseRunner {
    model: Arc<dyn ModelClient>,
    executor: ToolExecutor,
    prompts: PromptBuilder,
    budget: TokenBudget,
    settings: RunSettings,
    events: EventSink,
}

impl PhaseRunner {
    pub fn new(
        model: Arc<dyn ModelClient>,
        executor: ToolExecutor,
        settings: RunSettings,
        events: EventSink,
    ) -> Self {
        Self {
            model,
            executor,
            prompts: PromptBuilder::new(settings.prompt_budget_bytes),
            budget: TokenBudget::new(settings.max_total_tokens),
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Tokens used by every turn so far.
    pub fn usage(&self) -> Usage {
        self.budget.used()
    }

    fn emit(&self, event: AgentEvent) {
        (self.events)(&event);
    }

    /// Drive the manager's current phase until it transitions or fails.
    ///
    /// The conversation is written to the transcript directory whatever the
    /// outcome.
    #[instrument(skip_all, fields(phase = tracing::field::Empty))]
    pub async fn run_phase(
        &mut self,
        manager: &mut PhaseManager,
        cancel: &CancellationToken,
    ) -> Result<PhaseReport> {
        let phase = manager
            .current_phase()
            .cloned()
            .ok_or_else(|| anyhow!("no phase left to run"))?;
        tracing::Span::current().record("phase", phase.id);
        manager.reset_transition();
        let started = Instant::now();
        let started_at = chrono::Local::now().to_rfc3339();
        let index = manager.current_index();

        let reference = self.reference(&phase, manager.state(), cancel).await?;
        let tools = self.phase_tools(&phase);
        let system = self.prompts.build(&PromptInputs {
            mode: self.settings.mode.as_str(),
            phase_id: phase.id,
            phase_name: phase.name,
            phase_description: phase.description,
            phase_template: phase.prompt,
            index: index + 1,
            total: manager.len(),
            state: manager.state(),
            tools: tools.iter().map(|tool| tool.name.clone()).collect(),
            resume: manager.resume(),
            reference: reference.as_deref(),
        })?;

        let mut convo = Conversation {
            messages: vec![Message::user_text(format!(
                "Begin the {} phase. Call `transition` when its goal is met.",
                phase.name
            ))],
            ..Conversation::default()
        };
        let timeout = self.settings.phase_timeout;
        let result = match tokio::time::timeout(
            timeout,
            self.converse(&phase, &system, &tools, manager, &mut convo, cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PhaseError::Timeout {
                phase: phase.id.to_string(),
                timeout,
            }
            .into()),
        };

        let duration = started.elapsed();
        self.write_transcript(index, &phase, &system, &convo, &started_at, duration, &result);
        result?;
        Ok(PhaseReport {
            phase: phase.id.to_string(),
            iterations: convo.iterations,
            usage: convo.usage,
            duration,
        })
    }

    async fn converse(
        &mut self,
        phase: &Phase,
        system: &str,
        tools: &[ToolSchema],
        manager: &mut PhaseManager,
        convo: &mut Conversation,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let max_iterations = phase
            .max_iterations
            .unwrap_or(self.settings.default_max_iterations);
        while convo.iterations < max_iterations {
            if cancel.is_cancelled() {
                return Err(PhaseError::Cancelled {
                    phase: phase.id.to_string(),
                }
                .into());
            }
            convo.iterations += 1;
            let iteration = convo.iterations;
            let request = ModelRequest {
                system: system.to_string(),
                messages: convo.messages.clone(),
                tools: tools.to_vec(),
            };
            let response = self.turn(&request, phase.id, iteration, cancel).await?;

            self.budget.record(response.usage);
            convo.usage.add(response.usage);
            self.emit(AgentEvent::TokensUsed {
                turn: response.usage,
                total: self.budget.used(),
            });
            if self.budget.exceeded() {
                return Err(PhaseError::TokenBudgetExceeded {
                    used: self.budget.used().total(),
                    ceiling: self.budget.ceiling(),
                }
                .into());
            }

            let text = response.text();
            if !text.trim().is_empty() {
                self.emit(AgentEvent::ModelText(text));
            }
            let calls = response.tool_calls();
            let ModelResponse {
                content,
                stop_reason,
                ..
            } = response;
            convo.messages.push(Message::assistant(content));

            if calls.is_empty() {
                debug!(iteration, ?stop_reason, "turn without tool calls; nudging");
                self.emit(AgentEvent::Nudged {
                    phase: phase.id.to_string(),
                    iteration,
                });
                let nudge = match stop_reason {
                    Some(StopReason::MaxTokens) => NUDGE_TRUNCATED,
                    _ => NUDGE,
                };
                convo.messages.push(Message::user_text(nudge));
                continue;
            }

            let results = self.execute_calls(phase, &calls, manager, cancel).await?;
            convo.messages.push(Message::tool_results(results));
            if manager.transitioned() {
                info!(iterations = iteration, "phase transitioned");
                return Ok(());
            }
        }
        Err(PhaseError::IterationBudgetExceeded {
            phase: phase.id.to_string(),
            max_iterations,
        }
        .into())
    }

    /// One model turn under the API timeout, with local retries for
    /// recoverable request-shape errors.
    async fn turn(
        &self,
        request: &ModelRequest,
        phase: &str,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, PhaseError> {
        let started = Instant::now();
        let mut retries = 0u32;
        loop {
            let events = Arc::clone(&self.events);
            let mut on_event = move |event: &StreamEvent| {
                if let StreamEvent::Retrying {
                    attempt,
                    delay,
                    reason,
                } = event
                {
                    events(&AgentEvent::Retrying {
                        attempt: *attempt,
                        delay: *delay,
                        reason: reason.clone(),
                    });
                }
            };
            let api_timeout = self.settings.api_timeout;
            let result = tokio::select! {
                result = tokio::time::timeout(api_timeout, self.model.send(request, &mut on_event)) => {
                    result.unwrap_or_else(|_| Err(LlmError::Timeout(api_timeout)))
                }
                _ = cancel.cancelled() => {
                    return Err(PhaseError::Cancelled { phase: phase.to_string() });
                }
            };

            let err = match result {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            if !err.is_recoverable() || retries >= self.settings.recoverable_retries {
                warn!(iteration, error = %err, "model call failed");
                return Err(PhaseError::Api {
                    phase: phase.to_string(),
                    iteration,
                    elapsed: started.elapsed(),
                    source: err,
                });
            }
            retries += 1;
            let delay = self.settings.recoverable_backoff * retries;
            warn!(iteration, retry = retries, ?delay, error = %err, "recoverable model error; retrying");
            self.emit(AgentEvent::Retrying {
                attempt: retries,
                delay,
                reason: err.to_string(),
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(PhaseError::Cancelled { phase: phase.to_string() });
                }
            }
        }
    }

    async fn execute_calls(
        &mut self,
        phase: &Phase,
        calls: &[ToolCall],
        manager: &mut PhaseManager,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentBlock>> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let outcome = if manager.transitioned() {
                ToolOutcome::error("not executed: the phase already transitioned")
            } else if call.name == TRANSITION_TOOL {
                self.emit(AgentEvent::ToolStarted {
                    name: call.name.clone(),
                    preview: truncate_chars(&call.input.to_string(), 200),
                });
                let outcome = manager.handle_transition(&call.input);
                self.emit(AgentEvent::ToolCompleted {
                    name: call.name.clone(),
                    success: !outcome.is_error,
                    output: truncate_chars(&outcome.content, EVENT_OUTPUT_LIMIT),
                });
                outcome
            } else if let Some(tool) = phase.tool(&call.name) {
                match self.executor.dispatch(call, tool.policy(), cancel).await {
                    Ok(outcome) => outcome,
                    Err(DispatchError::Aborted(abort)) => return Err(abort.into()),
                    Err(DispatchError::Cancelled) => {
                        return Err(PhaseError::Cancelled {
                            phase: phase.id.to_string(),
                        }
                        .into());
                    }
                }
            } else {
                let available: Vec<&str> = phase.tools.iter().map(|tool| tool.name).collect();
                ToolOutcome::error(format!(
                    "tool '{}' is not available in the {} phase. Available: {}, {TRANSITION_TOOL}",
                    call.name,
                    phase.id,
                    available.join(", ")
                ))
            };
            results.push(outcome.into_block(&call.id));
        }
        Ok(results)
    }

    async fn reference(
        &self,
        phase: &Phase,
        state: &State,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let Some(hook) = &phase.hook else {
            return Ok(None);
        };
        let result = tokio::select! {
            result = hook.on_enter(state) => result,
            _ = cancel.cancelled() => {
                return Err(PhaseError::Cancelled { phase: phase.id.to_string() }.into());
            }
        };
        Ok(Some(match result {
            Ok(context) => context,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "phase hook failed");
                format!(
                    "Warning: reference data for this phase could not be loaded ({err:#}). Continue without it."
                )
            }
        }))
    }

    fn phase_tools(&self, phase: &Phase) -> Vec<ToolSchema> {
        let registry = self.executor.registry();
        let mut schemas: Vec<ToolSchema> = phase
            .tools
            .iter()
            .filter_map(|tool| match registry.get(tool.name) {
                Some(spec) => Some(spec.schema()),
                None => {
                    warn!(tool = tool.name, "phase lists an unregistered tool");
                    None
                }
            })
            .collect();
        schemas.push(transition_schema(phase.id));
        schemas
    }

    #[allow(clippy::too_many_arguments)]
    fn write_transcript(
        &self,
        index: usize,
        phase: &Phase,
        system: &str,
        convo: &Conversation,
        started_at: &str,
        duration: Duration,
        result: &Result<()>,
    ) {
        let (outcome, error) = match result {
            Ok(()) => ("completed", None),
            Err(err) => {
                let cancelled = matches!(
                    err.downcast_ref::<PhaseError>(),
                    Some(PhaseError::Cancelled { .. })
                );
                (
                    if cancelled { "cancelled" } else { "failed" },
                    Some(format!("{err:#}")),
                )
            }
        };
        let meta = TranscriptMeta {
            phase: phase.id.to_string(),
            mode: self.settings.mode.as_str().to_string(),
            iterations: convo.iterations,
            usage: convo.usage,
            outcome: outcome.to_string(),
            error,
            started_at: started_at.to_string(),
            duration_ms: duration.as_millis() as u64,
        };
        if let Err(err) = write_transcript(&TranscriptWriteRequest {
            transcripts_dir: &self.settings.paths.transcripts_dir,
            index: index + 1,
            meta: &meta,
            system,
            messages: &convo.messages,
        }) {
            warn!(error = %format!("{err:#}"), "failed to write transcript");
        }
    }
}

/// Schema of the `transition` tool for one phase.
pub fn transition_schema(phase_id: &str) -> ToolSchema {
    let mut results = json!({
        "type": "object",
        "description": "Facts established in this phase; merged into the shared state."
    });
    if phase_id == ELIGIBILITY_PHASE {
        results["properties"] = json!({"eligibility_report": {"type": "object"}});
        results["required"] = json!(["eligibility_report"]);
    }
    ToolSchema {
        name: TRANSITION_TOOL.to_string(),
        description: "Finish the current phase and hand its results to the next one.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "results": results,
                "notes": {"type": "string", "description": "Short summary of what was done."}
            },
            "required": ["results", "notes"]
        }),
    }
}

/// Skip phases an earlier run already completed, up to the first open one.
fn skip_completed(manager: &mut PhaseManager, events: &EventSink) {
    let remaining: Vec<&'static str> = manager.phases()[manager.current_index()..]
        .iter()
        .map(|phase| phase.id)
        .collect();
    let first_open = remaining.iter().copied().find(|id| !manager.was_completed(id));
    for id in remaining.iter().copied().take_while(|id| Some(*id) != first_open) {
        info!(phase = id, "already completed; skipping");
        events(&AgentEvent::PhaseSkipped { id: id.to_string() });
    }
    match first_open {
        Some(id) => {
            manager.skip_to_phase(id);
        }
        None => {
            while manager.skip_current().is_some() {}
        }
    }
}

fn save_progress(paths: &AgentPaths, manager: &PhaseManager) {
    if let Err(err) = write_progress(&paths.progress_path, &manager.snapshot()) {
        warn!(error = %format!("{err:#}"), "failed to save progress");
    }
}

fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AbortError>().is_some()
        || err.downcast_ref::<PhaseError>().is_some_and(PhaseError::is_fatal)
}

/// Run every scheduled phase, resuming from the checkpoint unless `fresh`.
///
/// Required-phase failures end the run; optional-phase failures are recorded
/// and the pipeline moves on. Background processes are torn down on exit.
#[instrument(skip_all, fields(mode = runner.settings().mode.as_str()))]
pub async fn run_pipeline(
    runner: &mut PhaseRunner,
    mut manager: PhaseManager,
    processes: &ProcessManager,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome> {
    let mut skipped = Vec::new();
    let result = drive(runner, &mut manager, &mut skipped, cancel).await;
    processes.shutdown().await;
    save_progress(&runner.settings.paths, &manager);
    result?;
    Ok(PipelineOutcome {
        completed: manager.completed().to_vec(),
        skipped,
        notes: manager.notes().to_vec(),
        usage: runner.usage(),
        state: manager.state().clone(),
    })
}

async fn drive(
    runner: &mut PhaseRunner,
    manager: &mut PhaseManager,
    skipped: &mut Vec<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    if !runner.settings.fresh
        && let Some(progress) = load_progress(&runner.settings.paths.progress_path)?
    {
        info!(completed = progress.completed.len(), "resuming from progress file");
        manager.restore(&progress);
    }
    skip_completed(manager, &runner.events);

    loop {
        if manager.is_complete() {
            if runner.settings.cloud
                && runner.settings.mode.supports_cloud()
                && manager.append_extension(cloud_extension())
            {
                skip_completed(manager, &runner.events);
                continue;
            }
            return Ok(());
        }
        let Some(phase) = manager.current_phase() else {
            return Ok(());
        };
        let (id, name, required) = (phase.id, phase.name, phase.required);
        if cancel.is_cancelled() {
            return Err(PhaseError::Cancelled {
                phase: id.to_string(),
            }
            .into());
        }

        if manager.was_completed(id) {
            info!(phase = id, "already completed; skipping");
            runner.emit(AgentEvent::PhaseSkipped { id: id.to_string() });
            manager.skip_current();
            continue;
        }

        runner.emit(AgentEvent::PhaseStarted {
            id: id.to_string(),
            name: name.to_string(),
            index: manager.current_index() + 1,
            total: manager.len(),
        });
        let child = cancel.child_token();
        let result = runner.run_phase(manager, &child).await;
        child.cancel();

        match result {
            Ok(report) => {
                runner.emit(AgentEvent::PhaseCompleted {
                    id: id.to_string(),
                    iterations: report.iterations,
                    duration: report.duration,
                });
                save_progress(&runner.settings.paths, manager);
            }
            Err(err) => {
                runner.emit(AgentEvent::PhaseFailed {
                    id: id.to_string(),
                    required,
                    error: format!("{err:#}"),
                });
                if required || is_fatal(&err) {
                    return Err(err.context(format!("{id} phase failed")));
                }
                warn!(phase = id, error = %format!("{err:#}"), "optional phase failed; continuing");
                skipped.push(id.to_string());
                manager.skip_current();
            }
        }
    }
}
