//! The phase schedules the agent can run.

use std::sync::Arc;
use std::time::Duration;

use crate::phase::{Phase, PhaseHook, PhaseTool};

pub const ELIGIBILITY_PHASE: &str = "eligibility";
/// First phase of the cloud extension; its presence marks the block as appended.
pub const CLOUD_SENTINEL: &str = "cloud_setup";

const READ_FILE: PhaseTool = PhaseTool::new("read_file");
const WRITE_FILE: PhaseTool = PhaseTool::new("write_file");
const LIST_FILES: PhaseTool = PhaseTool::new("list_files");
const RUN_COMMAND: PhaseTool = PhaseTool::new("run_command");
const HTTP_REQUEST: PhaseTool = PhaseTool::new("http_request");
const START_BACKGROUND: PhaseTool = PhaseTool::new("start_background");
const STOP_BACKGROUND: PhaseTool = PhaseTool::new("stop_background");
const GET_LOGS: PhaseTool = PhaseTool::new("get_logs");
const LIST_BACKGROUND: PhaseTool = PhaseTool::new("list_background");
const WAIT_FOR_READY: PhaseTool = PhaseTool::new("wait_for_ready");
const ASK_USER: PhaseTool = PhaseTool::new("ask_user");
const ABORT_SETUP: PhaseTool = PhaseTool::new("abort_setup");

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// What a run is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Discover, verify, instrument, configure, test and report.
    Setup,
    /// Produce an eligibility report without changing anything.
    Assess,
    /// Re-check an already instrumented project.
    Verify,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Assess => "assess",
            Self::Verify => "verify",
        }
    }

    pub fn pipeline(self, instrument_hook: Option<Arc<dyn PhaseHook>>) -> Vec<Phase> {
        match self {
            Self::Setup => default_pipeline(instrument_hook),
            Self::Assess => eligibility_pipeline(),
            Self::Verify => verify_pipeline(),
        }
    }

    /// Only setup runs may append the cloud extension.
    pub fn supports_cloud(self) -> bool {
        self == Self::Setup
    }
}

fn discover() -> Phase {
    Phase::new(
        "discover",
        "Discover",
        "Work out the runtime, framework, entry point and how the application starts.",
        include_str!("prompts/discover.md"),
    )
    .tools([READ_FILE, LIST_FILES, RUN_COMMAND, ASK_USER, ABORT_SETUP])
    .max_iterations(30)
}

fn verify() -> Phase {
    Phase::new(
        "verify",
        "Verify",
        "Start the application unchanged and confirm it answers.",
        include_str!("prompts/verify.md"),
    )
    .tools([
        READ_FILE,
        LIST_FILES,
        RUN_COMMAND,
        START_BACKGROUND,
        STOP_BACKGROUND,
        GET_LOGS,
        LIST_BACKGROUND,
        WAIT_FOR_READY,
        HTTP_REQUEST.timeout(PROBE_TIMEOUT),
        ASK_USER,
        ABORT_SETUP,
    ])
}

fn test() -> Phase {
    Phase::new(
        "test",
        "Test",
        "Run the instrumented application and check that telemetry is emitted.",
        include_str!("prompts/test.md"),
    )
    .tools([
        READ_FILE,
        RUN_COMMAND,
        START_BACKGROUND,
        STOP_BACKGROUND,
        GET_LOGS,
        LIST_BACKGROUND,
        WAIT_FOR_READY,
        HTTP_REQUEST.timeout(PROBE_TIMEOUT),
    ])
    .optional()
}

/// discover, verify, instrument, configure, test, report.
pub fn default_pipeline(instrument_hook: Option<Arc<dyn PhaseHook>>) -> Vec<Phase> {
    vec![
        discover(),
        verify(),
        Phase::new(
            "instrument",
            "Instrument",
            "Install and initialise the telemetry SDK.",
            include_str!("prompts/instrument.md"),
        )
        .tools([
            READ_FILE,
            LIST_FILES,
            WRITE_FILE,
            RUN_COMMAND,
            ASK_USER,
            ABORT_SETUP,
        ])
        .hook(instrument_hook),
        Phase::new(
            "configure",
            "Configure",
            "Write exporter and service configuration.",
            include_str!("prompts/configure.md"),
        )
        .tools([READ_FILE, LIST_FILES, WRITE_FILE, ASK_USER, ABORT_SETUP])
        .max_iterations(20),
        test(),
        Phase::new(
            "report",
            "Report",
            "Summarise the changes for the operator.",
            include_str!("prompts/report.md"),
        )
        .tools([READ_FILE, LIST_FILES, WRITE_FILE.confirm(false)])
        .optional()
        .max_iterations(10),
    ]
}

/// Hosted-backend phases appended after a successful setup.
pub fn cloud_extension() -> Vec<Phase> {
    vec![
        Phase::new(
            CLOUD_SENTINEL,
            "Cloud Setup",
            "Point the exporter at the hosted backend and deploy.",
            include_str!("prompts/cloud_setup.md"),
        )
        .tools([
            READ_FILE,
            WRITE_FILE,
            RUN_COMMAND,
            HTTP_REQUEST,
            ASK_USER,
            ABORT_SETUP,
        ]),
        Phase::new(
            "cloud_verify",
            "Cloud Verify",
            "Confirm telemetry reaches the hosted backend.",
            include_str!("prompts/cloud_verify.md"),
        )
        .tools([
            RUN_COMMAND,
            HTTP_REQUEST.timeout(PROBE_TIMEOUT),
            GET_LOGS,
            WAIT_FOR_READY,
        ])
        .optional(),
    ]
}

/// Assessment only; the transition requires a valid eligibility report.
pub fn eligibility_pipeline() -> Vec<Phase> {
    vec![
        Phase::new(
            ELIGIBILITY_PHASE,
            "Eligibility",
            "Assess every service for instrumentation and report the result.",
            include_str!("prompts/eligibility.md"),
        )
        .tools([READ_FILE, LIST_FILES, RUN_COMMAND, ABORT_SETUP]),
    ]
}

/// verify + test, for a project that was already set up.
pub fn verify_pipeline() -> Vec<Phase> {
    vec![verify(), test()]
}
