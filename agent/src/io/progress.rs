//! Human-readable checkpoint (`.setup-agent/progress.md`) for crash recovery.
//!
//! The file is rewritten atomically after every completed phase and read back
//! on startup to decide where to resume. Parsing is tolerant: unknown sections
//! and malformed lines are ignored rather than failing the run.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::state::{MILESTONES, State};
use crate::io::paths::write_atomic;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub updated: Option<String>,
    pub completed: Vec<String>,
    pub info: Vec<(String, String)>,
    pub milestones: Vec<(String, bool)>,
}

#[derive(Clone, Copy)]
enum Section {
    Other,
    Completed,
    Info,
    Milestones,
}

impl Progress {
    /// Snapshot the completed phases and current state.
    pub fn capture(completed: &[String], state: &State) -> Self {
        Self {
            updated: Some(chrono::Local::now().to_rfc3339()),
            completed: completed.to_vec(),
            info: state
                .info_pairs()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            milestones: MILESTONES
                .iter()
                .map(|name| (name.to_string(), state.milestone(name).unwrap_or(false)))
                .collect(),
        }
    }

    pub fn is_completed(&self, phase_id: &str) -> bool {
        self.completed.iter().any(|id| id == phase_id)
    }

    /// Rebuild `State` from the recorded info and milestones.
    pub fn restore_state(&self) -> State {
        let mut state = State::default();
        for (key, value) in &self.info {
            if !state.restore_info(key, value) {
                warn!(key = %key, "ignoring unrecognized progress entry");
            }
        }
        for (name, done) in &self.milestones {
            if !state.set_milestone(name, *done) {
                warn!(milestone = %name, "ignoring unrecognized milestone");
            }
        }
        state
    }

    /// Short recap injected into prompts after a resume.
    pub fn resume_summary(&self) -> String {
        let mut out = String::from("This run resumes an earlier session.\n");
        if !self.completed.is_empty() {
            out.push_str(&format!(
                "Already completed phases: {}.\n",
                self.completed.join(", ")
            ));
        }
        if !self.info.is_empty() {
            out.push_str("Previously discovered:\n");
            for (key, value) in &self.info {
                out.push_str(&format!("- {key}: {value}\n"));
            }
        }
        let done: Vec<&str> = self
            .milestones
            .iter()
            .filter(|(_, done)| *done)
            .map(|(name, _)| name.as_str())
            .collect();
        if !done.is_empty() {
            out.push_str(&format!("Milestones reached: {}.\n", done.join(", ")));
        }
        out
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# Setup Progress\n\n");
        if let Some(updated) = &self.updated {
            out.push_str(&format!("Updated: {updated}\n\n"));
        }
        out.push_str("## Completed Phases\n");
        for id in &self.completed {
            out.push_str(&format!("- {id}\n"));
        }
        out.push_str("\n## Discovered Info\n");
        for (key, value) in &self.info {
            out.push_str(&format!("- {key}: {}\n", escape_value(value)));
        }
        out.push_str("\n## Milestones\n");
        for (name, done) in &self.milestones {
            let mark = if *done { 'x' } else { ' ' };
            out.push_str(&format!("- [{mark}] {name}\n"));
        }
        out
    }
}

pub fn parse_progress(text: &str) -> Progress {
    let mut progress = Progress::default();
    let mut section = Section::Other;
    for raw in text.lines() {
        let line = raw.trim();
        if let Some(heading) = line.strip_prefix("## ") {
            section = match heading.trim().to_ascii_lowercase().as_str() {
                "completed phases" => Section::Completed,
                "discovered info" => Section::Info,
                "milestones" => Section::Milestones,
                _ => Section::Other,
            };
            continue;
        }
        if let Some(updated) = line.strip_prefix("Updated:") {
            progress.updated = Some(updated.trim().to_string());
            continue;
        }
        let Some(item) = line.strip_prefix("- ") else {
            continue;
        };
        match section {
            Section::Completed => {
                let id = item.trim();
                if !id.is_empty() {
                    progress.completed.push(id.to_string());
                }
            }
            Section::Info => {
                if let Some((key, value)) = item.split_once(':') {
                    progress
                        .info
                        .push((key.trim().to_string(), unescape_value(value.trim())));
                }
            }
            Section::Milestones => {
                let parsed = if let Some(name) = item.strip_prefix("[x]").or(item.strip_prefix("[X]")) {
                    Some((name, true))
                } else {
                    item.strip_prefix("[ ]").map(|name| (name, false))
                };
                if let Some((name, done)) = parsed {
                    progress.milestones.push((name.trim().to_string(), done));
                }
            }
            Section::Other => {}
        }
    }
    progress
}

/// Keep a model-supplied value on one line of the checkpoint.
fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Load progress; a missing file means a fresh run.
pub fn load_progress(path: &Path) -> Result<Option<Progress>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("read progress file {}", path.display()))?;
    let progress = parse_progress(&text);
    debug!(completed = progress.completed.len(), "progress loaded");
    Ok(Some(progress))
}

pub fn write_progress(path: &Path, progress: &Progress) -> Result<()> {
    debug!(path = %path.display(), completed = progress.completed.len(), "writing progress");
    write_atomic(path, &progress.render())
}

/// Delete the checkpoint; returns whether one existed.
pub fn clear_progress(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(path).with_context(|| format!("remove progress file {}", path.display()))?;
    Ok(true)
}
