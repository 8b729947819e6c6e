//! `setup-agent`: let a model instrument a project, phase by phase.
//!
//! State lives under `<project>/.setup-agent/` (config, progress checkpoint,
//! transcripts). Rerunning resumes from the last completed phase.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use setup_agent::events::{AgentEvent, EventSink};
use setup_agent::exit_codes;
use setup_agent::io::background::{ProcessManager, ProcessManagerOptions};
use setup_agent::io::config::{load_config, resolve_credentials};
use setup_agent::io::paths::AgentPaths;
use setup_agent::io::progress::{clear_progress, load_progress};
use setup_agent::llm::{ClientSettings, LlmClient, LlmError};
use setup_agent::logging;
use setup_agent::phase::hooks::CapabilityManifestHook;
use setup_agent::phase::{
    Mode, PhaseError, PhaseHook, PhaseManager, PhaseRunner, PipelineOutcome, RunSettings,
    run_pipeline,
};
use setup_agent::tools::builtin::{ToolContext, builtin_registry};
use setup_agent::tools::operator::{AutoApproveOperator, TerminalOperator};
use setup_agent::tools::{AbortError, Operator, ToolExecutor};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "setup-agent",
    version,
    about = "Autonomous agent that instruments a project for telemetry"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run (or resume) the agent against a project.
    Run(RunArgs),
    /// Print the progress checkpoint.
    Progress {
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
    },
    /// Delete the progress checkpoint so the next run starts over.
    Reset {
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = Mode::Setup)]
    mode: Mode,
    /// Continue with the hosted-backend phases after setup.
    #[arg(long)]
    cloud: bool,
    /// Approve every tool call without asking.
    #[arg(short, long)]
    yes: bool,
    /// Ignore the progress checkpoint.
    #[arg(long)]
    fresh: bool,
    /// Override the configured model.
    #[arg(long)]
    model: Option<String>,
    /// Show model text and debug logs.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbose = matches!(&cli.command, Command::Run(args) if args.verbose);
    logging::init(verbose);

    let code = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Progress { project_dir } => finish(cmd_progress(&project_dir)),
        Command::Reset { project_dir } => finish(cmd_reset(&project_dir)),
    };
    std::process::exit(code);
}

fn finish(result: Result<()>) -> i32 {
    match result {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILED
        }
    }
}

async fn run(args: RunArgs) -> i32 {
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted; stopping background processes");
            signal_token.cancel();
        }
    });

    match cmd_run(args, &cancel).await {
        Ok(outcome) => {
            print_summary(&outcome);
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("\n{}", explain(&err));
            eprintln!("error: {err:#}");
            if cancel.is_cancelled() {
                exit_codes::INTERRUPTED
            } else {
                exit_code(&err)
            }
        }
    }
}

async fn cmd_run(args: RunArgs, cancel: &CancellationToken) -> Result<PipelineOutcome> {
    let project_dir = args
        .project_dir
        .canonicalize()
        .with_context(|| format!("open project directory {}", args.project_dir.display()))?;
    let paths = AgentPaths::new(&project_dir);
    paths.ensure()?;
    let mut config = load_config(&paths.config_path)?;
    if let Some(model) = args.model {
        config.model = model;
    }

    let credentials = resolve_credentials(|name| std::env::var(name).ok())?;
    let client = LlmClient::new(ClientSettings {
        base_url: credentials
            .base_url
            .unwrap_or_else(|| config.api_base_url.clone()),
        model: config.model.clone(),
        max_tokens: config.max_tokens,
        stream: config.stream,
        auth: credentials.auth,
        retry: config.retry_config(),
    })?;

    let operator: Arc<dyn Operator> = if std::io::stdin().is_terminal() {
        Arc::new(TerminalOperator)
    } else if args.yes {
        Arc::new(AutoApproveOperator)
    } else {
        bail!("stdin is not a terminal; pass --yes to run without confirmations");
    };
    let events = stderr_sink(args.verbose);
    let processes = Arc::new(ProcessManager::new(
        &project_dir,
        ProcessManagerOptions::default(),
    )?);
    let ctx = ToolContext::from_config(
        &project_dir,
        Arc::clone(&processes),
        Arc::clone(&operator),
        &config,
    )?;
    let registry = builtin_registry(Arc::new(ctx))?;
    let executor = ToolExecutor::new(
        Arc::new(registry),
        operator,
        config.tool_timeout(),
        Arc::clone(&events),
    )
    .waive_confirmation(args.yes)
    .with_approved_prefixes(config.commands.pre_approved.iter().cloned());

    let hook = match &config.capability_manifest_url {
        Some(url) => Some(Arc::new(CapabilityManifestHook::new(url.as_str())?) as Arc<dyn PhaseHook>),
        None => None,
    };
    if args.cloud && !args.mode.supports_cloud() {
        warn!(mode = args.mode.as_str(), "--cloud only applies to setup runs; ignoring");
    }
    let manager = PhaseManager::new(args.mode.pipeline(hook));
    let mut settings = RunSettings::from_config(&config, paths, args.mode);
    settings.cloud = args.cloud;
    settings.fresh = args.fresh;

    let mut runner = PhaseRunner::new(Arc::new(client), executor, settings, events);
    run_pipeline(&mut runner, manager, &processes, cancel).await
}

fn cmd_progress(project_dir: &Path) -> Result<()> {
    let paths = AgentPaths::new(project_dir);
    match load_progress(&paths.progress_path)? {
        Some(progress) => print!("{}", progress.render()),
        None => println!("no progress recorded in {}", paths.agent_dir.display()),
    }
    Ok(())
}

fn cmd_reset(project_dir: &Path) -> Result<()> {
    let paths = AgentPaths::new(project_dir);
    if clear_progress(&paths.progress_path)? {
        println!("progress cleared; the next run starts from the first phase");
    } else {
        println!("no progress to clear");
    }
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<AbortError>().is_some() {
        return exit_codes::ABORTED;
    }
    if let Some(PhaseError::Cancelled { .. }) = err.downcast_ref::<PhaseError>() {
        return exit_codes::INTERRUPTED;
    }
    exit_codes::FAILED
}

/// Plain-English explanation of a terminal failure.
fn explain(err: &anyhow::Error) -> String {
    if let Some(abort) = err.downcast_ref::<AbortError>() {
        return format!("The agent stopped the setup: {}", abort.reason);
    }
    if let Some(phase) = err.downcast_ref::<PhaseError>() {
        return phase.user_message();
    }
    if let Some(llm) = err.downcast_ref::<LlmError>() {
        return llm.user_message();
    }
    "The setup could not continue. The details below name the step that failed; fix it and rerun to resume from the last completed phase.".to_string()
}

fn stderr_sink(verbose: bool) -> EventSink {
    Arc::new(move |event| {
        if let Some(line) = render_event(event, verbose) {
            eprintln!("{line}");
        }
    })
}

fn render_event(event: &AgentEvent, verbose: bool) -> Option<String> {
    match event {
        AgentEvent::PhaseStarted {
            name, index, total, ..
        } => Some(format!("\n==> [{index}/{total}] {name}")),
        AgentEvent::PhaseCompleted {
            id,
            iterations,
            duration,
        } => Some(format!(
            "    {id} complete ({iterations} turns, {:.1}s)",
            duration.as_secs_f64()
        )),
        AgentEvent::PhaseFailed {
            id,
            required,
            error,
        } => {
            let kind = if *required { "failed" } else { "failed (optional, continuing)" };
            Some(format!("    {id} {kind}: {error}"))
        }
        AgentEvent::PhaseSkipped { id } => Some(format!("    {id} already complete; skipping")),
        AgentEvent::ModelText(text) if verbose => Some(indent(text.trim(), "    | ")),
        AgentEvent::ToolStarted { name, preview } => Some(format!("  -> {name} {preview}")),
        AgentEvent::ToolCompleted {
            name,
            success: false,
            output,
        } => Some(format!("  !! {name}: {}", output.lines().next().unwrap_or_default())),
        AgentEvent::Retrying {
            attempt,
            delay,
            reason,
        } => Some(format!(
            "  model request failed ({reason}); retry {attempt} in {:.1}s",
            delay.as_secs_f64()
        )),
        AgentEvent::Nudged { iteration, .. } if verbose => {
            Some(format!("  (turn {iteration} had no tool calls; nudging)"))
        }
        AgentEvent::TokensUsed { total, .. } if verbose => {
            Some(format!("  tokens: {} total", total.total()))
        }
        _ => None,
    }
}

fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn print_summary(outcome: &PipelineOutcome) {
    println!("\nCompleted phases: {}", outcome.completed.join(", "));
    if !outcome.skipped.is_empty() {
        println!("Skipped after failure: {}", outcome.skipped.join(", "));
    }
    for (phase, note) in &outcome.notes {
        println!("  {phase}: {note}");
    }
    println!(
        "Tokens used: {} ({} in, {} out)",
        outcome.usage.total(),
        outcome.usage.input_tokens,
        outcome.usage.output_tokens
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["setup-agent", "run"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.mode, Mode::Setup);
        assert_eq!(args.project_dir, PathBuf::from("."));
        assert!(!args.cloud && !args.yes && !args.fresh);
        assert!(args.model.is_none());
    }

    #[test]
    fn parse_run_flags() {
        let cli = Cli::parse_from([
            "setup-agent",
            "run",
            "--project-dir",
            "/srv/app",
            "--mode",
            "assess",
            "--cloud",
            "--yes",
            "--fresh",
            "--model",
            "claude-opus-4-1",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.mode, Mode::Assess);
        assert_eq!(args.project_dir, PathBuf::from("/srv/app"));
        assert!(args.cloud && args.yes && args.fresh);
        assert_eq!(args.model.as_deref(), Some("claude-opus-4-1"));
    }

    #[test]
    fn parse_reset() {
        let cli = Cli::parse_from(["setup-agent", "reset", "--project-dir", "app"]);
        assert!(matches!(cli.command, Command::Reset { project_dir } if project_dir == Path::new("app")));
    }

    #[test]
    fn exit_codes_follow_error_kind() {
        let abort = anyhow::Error::new(AbortError {
            reason: "no supported runtime".to_string(),
        })
        .context("discover phase failed");
        assert_eq!(exit_code(&abort), exit_codes::ABORTED);
        assert!(explain(&abort).contains("no supported runtime"));

        let cancelled = anyhow::Error::new(PhaseError::Cancelled {
            phase: "verify".to_string(),
        });
        assert_eq!(exit_code(&cancelled), exit_codes::INTERRUPTED);

        let other = anyhow::anyhow!("config parse failed");
        assert_eq!(exit_code(&other), exit_codes::FAILED);
        assert!(explain(&other).starts_with("The setup could not continue."));
    }

    #[test]
    fn quiet_rendering_hides_model_chatter() {
        assert!(render_event(&AgentEvent::ModelText("thinking".into()), false).is_none());
        assert_eq!(
            render_event(&AgentEvent::ModelText("a\nb".into()), true).as_deref(),
            Some("    | a\n    | b")
        );
        let ok = AgentEvent::ToolCompleted {
            name: "read_file".into(),
            success: true,
            output: "contents".into(),
        };
        assert!(render_event(&ok, false).is_none());
        let completed = AgentEvent::PhaseCompleted {
            id: "discover".into(),
            iterations: 3,
            duration: Duration::from_millis(2500),
        };
        assert_eq!(
            render_event(&completed, false).as_deref(),
            Some("    discover complete (3 turns, 2.5s)")
        );
    }
}
