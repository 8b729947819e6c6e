//! End-to-end pipeline runs with a scripted model and the real tool set.
//!
//! Each test drives `run_pipeline` over a temporary project and checks what
//! a rerun depends on: the progress checkpoint, transcripts and the event
//! stream.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use setup_agent::core::types::{ContentBlock, ModelResponse};
use setup_agent::events::AgentEvent;
use setup_agent::io::background::{ProcessManager, ProcessManagerOptions};
use setup_agent::io::config::AgentConfig;
use setup_agent::io::paths::AgentPaths;
use setup_agent::io::progress::load_progress;
use setup_agent::phase::pipeline::ELIGIBILITY_PHASE;
use setup_agent::phase::{Mode, PhaseError, PhaseManager, PhaseRunner, RunSettings, run_pipeline};
use setup_agent::test_support::{
    EventLog, RecordingOperator, ScriptedModel, TestProject, tool_turn, transition_turn,
};
use setup_agent::tools::builtin::{ToolContext, builtin_registry};
use setup_agent::tools::{AbortError, ToolExecutor};
use tokio_util::sync::CancellationToken;

struct Harness {
    project: TestProject,
    model: Arc<ScriptedModel>,
    events: EventLog,
    processes: Arc<ProcessManager>,
    runner: PhaseRunner,
}

fn harness(project: TestProject, turns: Vec<ModelResponse>, mode: Mode, cloud: bool, fresh: bool) -> Harness {
    let config = AgentConfig::default();
    let model = Arc::new(ScriptedModel::new(turns));
    let events = EventLog::default();
    let operator = Arc::new(RecordingOperator::new());
    let processes = Arc::new(
        ProcessManager::new(project.path(), ProcessManagerOptions::default()).expect("processes"),
    );
    let ctx = ToolContext::from_config(project.path(), Arc::clone(&processes), operator.clone(), &config)
        .expect("tool context");
    let registry = builtin_registry(Arc::new(ctx)).expect("registry");
    let executor = ToolExecutor::new(
        Arc::new(registry),
        operator,
        Duration::from_secs(10),
        events.sink(),
    );
    let paths = AgentPaths::new(project.path());
    paths.ensure().expect("agent dir");
    let mut settings = RunSettings::from_config(&config, paths, mode);
    settings.cloud = cloud;
    settings.fresh = fresh;
    settings.recoverable_backoff = Duration::from_millis(1);
    let runner = PhaseRunner::new(model.clone(), executor, settings, events.sink());
    Harness {
        project,
        model,
        events,
        processes,
        runner,
    }
}

fn node_project() -> TestProject {
    let project = TestProject::new().expect("project");
    project
        .write(
            "package.json",
            r#"{"name": "shop", "scripts": {"start": "node server.js"}}"#,
        )
        .expect("package.json");
    project
}

fn started(events: &[AgentEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::PhaseStarted { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn full_setup_with_cloud_extension() {
    let turns = vec![
        tool_turn(&[("r1", "read_file", json!({"path": "package.json"}))]),
        transition_turn("t1", json!({"runtime": "node", "port": 3000, "start_command": "npm start"}), "node app"),
        transition_turn("t2", json!({"app_verified": true}), "answers on 3000"),
        transition_turn("t3", json!({"instrumentation_installed": true}), "sdk added"),
        transition_turn("t4", json!({"config_written": true}), "exporter configured"),
        transition_turn("t5", json!({"tests_passed": true}), "spans seen"),
        transition_turn("t6", json!({"report_written": true}), "report written"),
        transition_turn("t7", json!({"cloud_deployed": true}), "deployed"),
        transition_turn("t8", json!({"telemetry_verified": true}), "data arrived"),
    ];
    let mut h = harness(node_project(), turns, Mode::Setup, true, false);
    let manager = PhaseManager::new(Mode::Setup.pipeline(None));
    let outcome = run_pipeline(&mut h.runner, manager, &h.processes, &CancellationToken::new())
        .await
        .expect("pipeline");

    h.model.assert_drained();
    assert_eq!(
        outcome.completed,
        [
            "discover",
            "verify",
            "instrument",
            "configure",
            "test",
            "report",
            "cloud_setup",
            "cloud_verify"
        ]
    );
    assert!(outcome.skipped.is_empty());
    assert_eq!(outcome.state.runtime.as_deref(), Some("node"));
    assert!(outcome.state.telemetry_verified);
    assert_eq!(outcome.usage.total(), 9 * 15);

    // The file read reached the model as a tool result.
    let second = &h.model.requests()[1];
    let ContentBlock::ToolResult { content, is_error, .. } = &second.messages[2].content[0] else {
        panic!("expected tool result");
    };
    assert!(!is_error);
    assert!(content.contains("\"name\": \"shop\""));

    // Later phases see the state earlier ones discovered.
    let verify_system = &h.model.requests()[2].system;
    assert!(verify_system.contains("Phase 2 of 6: Verify"));
    assert!(verify_system.contains("\"runtime\": \"node\""));
    let cloud_system = &h.model.requests()[7].system;
    assert!(cloud_system.contains("Phase 7 of 8"));

    let progress = load_progress(&h.runner.settings().paths.progress_path)
        .expect("load")
        .expect("progress written");
    assert_eq!(progress.completed.len(), 8);
    assert!(progress.info.contains(&("port".to_string(), "3000".to_string())));
    assert!(
        h.project
            .read(".setup-agent/transcripts/08-cloud_verify/meta.json")
            .is_ok()
    );
}

#[tokio::test]
async fn rerun_resumes_after_completed_phases() {
    let project = node_project();
    project
        .write(
            ".setup-agent/progress.md",
            "# Setup Progress\n\nUpdated: 2026-10-01T09:00:00+00:00\n\n## Completed Phases\n- discover\n- verify\n\n## Discovered Info\n- runtime: node\n- port: 3000\n\n## Milestones\n- [x] app_verified\n",
        )
        .expect("progress");
    let turns = vec![
        transition_turn("t3", json!({"instrumentation_installed": true}), "sdk added"),
        transition_turn("t4", json!({"config_written": true}), "exporter configured"),
        transition_turn("t5", json!({}), "tests ok"),
        transition_turn("t6", json!({}), "report"),
    ];
    let mut h = harness(project, turns, Mode::Setup, false, false);
    let manager = PhaseManager::new(Mode::Setup.pipeline(None));
    let outcome = run_pipeline(&mut h.runner, manager, &h.processes, &CancellationToken::new())
        .await
        .expect("pipeline");

    h.model.assert_drained();
    let events = h.events.events();
    let skipped: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::PhaseSkipped { id } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, ["discover", "verify"]);
    assert_eq!(started(&events), ["instrument", "configure", "test", "report"]);
    assert_eq!(outcome.completed.len(), 6);
    assert_eq!(outcome.state.port, Some(3000));
    assert!(outcome.state.app_verified);

    let first = &h.model.requests()[0].system;
    assert!(first.contains("Recovered Progress"));
    assert!(first.contains("Already completed phases: discover, verify."));
}

#[tokio::test]
async fn fresh_run_ignores_checkpoint() {
    let project = node_project();
    project
        .write(
            ".setup-agent/progress.md",
            "## Completed Phases\n- verify\n",
        )
        .expect("progress");
    let turns = vec![
        transition_turn("t1", json!({}), "verified"),
        transition_turn("t2", json!({}), "tested"),
    ];
    let mut h = harness(project, turns, Mode::Verify, false, true);
    let manager = PhaseManager::new(Mode::Verify.pipeline(None));
    run_pipeline(&mut h.runner, manager, &h.processes, &CancellationToken::new())
        .await
        .expect("pipeline");

    assert_eq!(started(&h.events.events()), ["verify", "test"]);
    assert!(!h.model.requests()[0].system.contains("Recovered Progress"));
}

#[tokio::test]
async fn required_failure_keeps_earlier_progress() {
    // The script runs dry during verify, which is required.
    let turns = vec![transition_turn("t1", json!({"runtime": "python"}), "flask app")];
    let mut h = harness(node_project(), turns, Mode::Setup, false, false);
    let manager = PhaseManager::new(Mode::Setup.pipeline(None));
    let err = run_pipeline(&mut h.runner, manager, &h.processes, &CancellationToken::new())
        .await
        .expect_err("verify fails");

    assert!(format!("{err:#}").starts_with("verify phase failed"));
    assert!(matches!(
        err.downcast_ref::<PhaseError>(),
        Some(PhaseError::Api { phase, iteration: 1, .. }) if phase == "verify"
    ));
    let progress = load_progress(&h.runner.settings().paths.progress_path)
        .expect("load")
        .expect("progress written");
    assert_eq!(progress.completed, ["discover"]);
    assert!(progress.info.contains(&("runtime".to_string(), "python".to_string())));
    assert!(h.events.events().iter().any(|event| matches!(
        event,
        AgentEvent::PhaseFailed { id, required: true, .. } if id == "verify"
    )));
    let meta = h
        .project
        .read(".setup-agent/transcripts/02-verify/meta.json")
        .expect("failed attempt transcript");
    assert!(meta.contains("\"outcome\": \"failed\""));
}

#[tokio::test]
async fn agent_abort_ends_the_run() {
    let turns = vec![tool_turn(&[(
        "a1",
        "abort_setup",
        json!({"reason": "monorepo with no runnable service"}),
    )])];
    let mut h = harness(node_project(), turns, Mode::Assess, false, false);
    let manager = PhaseManager::new(Mode::Assess.pipeline(None));
    let err = run_pipeline(&mut h.runner, manager, &h.processes, &CancellationToken::new())
        .await
        .expect_err("aborted");

    let abort = err.downcast_ref::<AbortError>().expect("abort error");
    assert_eq!(abort.reason, "monorepo with no runnable service");
    assert!(started(&h.events.events()) == [ELIGIBILITY_PHASE]);
}

#[tokio::test]
async fn cancelled_run_stops_before_the_first_phase() {
    let mut h = harness(node_project(), Vec::new(), Mode::Setup, false, false);
    let manager = PhaseManager::new(Mode::Setup.pipeline(None));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = run_pipeline(&mut h.runner, manager, &h.processes, &cancel)
        .await
        .expect_err("cancelled");
    assert!(matches!(
        err.downcast_ref::<PhaseError>(),
        Some(PhaseError::Cancelled { .. })
    ));
    assert!(h.model.requests().is_empty());
}
