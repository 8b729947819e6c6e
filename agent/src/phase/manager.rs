//! Ordered phase schedule plus the accumulated `State`.
//!
//! The manager is the only writer of `State`. Its index only moves forward;
//! advancing past the last phase completes the run.

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::core::eligibility::validate_report;
use crate::core::state::{State, StateUpdate};
use crate::io::progress::Progress;
use crate::phase::Phase;
use crate::phase::pipeline::ELIGIBILITY_PHASE;
use crate::tools::ToolOutcome;

#[derive(Debug)]
pub struct PhaseManager {
    phases: Vec<Phase>,
    current: usize,
    state: State,
    transitioned: bool,
    completed: Vec<String>,
    notes: Vec<(String, String)>,
    resume: Option<String>,
}

impl PhaseManager {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self {
            phases,
            current: 0,
            state: State::default(),
            transitioned: false,
            completed: Vec::new(),
            notes: Vec::new(),
            resume: None,
        }
    }

    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases.get(self.current)
    }

    /// Zero-based index of the current phase.
    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Record the current phase as completed and move to the next one.
    pub fn advance_phase(&mut self) -> Option<&Phase> {
        if let Some(phase) = self.phases.get(self.current) {
            if !self.completed.iter().any(|id| id == phase.id) {
                self.completed.push(phase.id.to_string());
            }
            self.current += 1;
        }
        self.transitioned = true;
        self.current_phase()
    }

    /// Move past the current phase without recording it as completed.
    pub fn skip_current(&mut self) -> Option<&Phase> {
        if self.current < self.phases.len() {
            self.current += 1;
        }
        self.current_phase()
    }

    pub fn is_complete(&self) -> bool {
        self.current >= self.phases.len()
    }

    pub fn transitioned(&self) -> bool {
        self.transitioned
    }

    pub fn reset_transition(&mut self) {
        self.transitioned = false;
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn update_state(&mut self, results: &Map<String, Value>) -> StateUpdate {
        let update = self.state.apply(results);
        if update.has_ignored() {
            warn!(
                unknown = ?update.unknown,
                mistyped = ?update.mistyped,
                "state update ignored keys"
            );
        }
        update
    }

    /// Jump forward to the phase with `id`. Unknown ids leave the index alone.
    pub fn skip_to_phase(&mut self, id: &str) -> bool {
        match self.phases[self.current.min(self.phases.len())..]
            .iter()
            .position(|phase| phase.id == id)
        {
            Some(offset) => {
                self.current += offset;
                debug!(phase = id, index = self.current, "skipped to phase");
                true
            }
            None => false,
        }
    }

    /// Append an extension block once. The first phase id of the block is its
    /// sentinel: if it is already scheduled, nothing is appended.
    pub fn append_extension(&mut self, extension: Vec<Phase>) -> bool {
        let Some(sentinel) = extension.first().map(|phase| phase.id) else {
            return false;
        };
        if self.phases.iter().any(|phase| phase.id == sentinel) {
            return false;
        }
        info!(sentinel, phases = extension.len(), "appending extension phases");
        self.phases.extend(extension);
        true
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// Transition notes keyed by phase id.
    pub fn notes(&self) -> &[(String, String)] {
        &self.notes
    }

    pub fn resume(&self) -> Option<&str> {
        self.resume.as_deref()
    }

    /// Seed state and completed phases from an earlier run's checkpoint.
    pub fn restore(&mut self, progress: &Progress) {
        self.state = progress.restore_state();
        self.completed = progress.completed.clone();
        self.resume = Some(progress.resume_summary());
    }

    /// Whether a checkpoint recorded `id` as completed.
    pub fn was_completed(&self, id: &str) -> bool {
        self.completed.iter().any(|done| done == id)
    }

    pub fn snapshot(&self) -> Progress {
        Progress::capture(&self.completed, &self.state)
    }

    /// Handle a `transition` call for the current phase.
    ///
    /// Phase-specific payloads are validated first; a rejected payload leaves
    /// the phase where it is and tells the model what to fix.
    pub fn handle_transition(&mut self, input: &Value) -> ToolOutcome {
        let Some(phase) = self.current_phase() else {
            return ToolOutcome::error("there is no active phase to transition from");
        };
        let phase_id = phase.id;
        let results = match input.get("results") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return ToolOutcome::error("`results` must be an object of discovered facts"),
        };
        if let Err(problem) = validate_payload(phase_id, &results) {
            info!(phase = phase_id, "transition rejected");
            return ToolOutcome::error(problem);
        }

        let update = self.update_state(&results);
        let notes = input
            .get("notes")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if !notes.is_empty() {
            self.notes.push((phase_id.to_string(), notes.to_string()));
        }
        let next = self.advance_phase().map(|phase| phase.name);
        info!(phase = phase_id, applied = update.applied.len(), "phase transitioned");

        let mut reply = format!("Phase {phase_id} complete.");
        if update.has_ignored() {
            let ignored: Vec<String> = update
                .unknown
                .iter()
                .map(|key| format!("{key} (unknown key)"))
                .chain(
                    update
                        .mistyped
                        .iter()
                        .map(|key| format!("{key} (wrong type)")),
                )
                .collect();
            reply.push_str(&format!(" Ignored: {}.", ignored.join(", ")));
        }
        match next {
            Some(name) => reply.push_str(&format!(" Next phase: {name}.")),
            None => reply.push_str(" All phases complete."),
        }
        ToolOutcome::ok(reply)
    }
}

fn validate_payload(phase_id: &str, results: &Map<String, Value>) -> Result<(), String> {
    if phase_id != ELIGIBILITY_PHASE {
        return Ok(());
    }
    let Some(report) = results.get("eligibility_report") else {
        return Err(
            "the eligibility phase requires results.eligibility_report; call transition again with the report"
                .to_string(),
        );
    };
    validate_report(report)
        .map(|_| ())
        .map_err(|err| format!("{err}\nFix the report and call transition again."))
}
