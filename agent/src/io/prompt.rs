//! System prompt builder for one phase.
//!
//! The base template and the phase's own template are rendered with minijinja,
//! then split into marked sections and fitted to a byte budget.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::state::State;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// Droppable sections, least important first.
const DROP_ORDER: &[&str] = &["reference", "resume"];
const TRUNCATION_MARK: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section marker regex")
});

/// Everything that goes into a phase prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub mode: &'a str,
    pub phase_id: &'a str,
    pub phase_name: &'a str,
    pub phase_description: &'a str,
    /// minijinja source rendered with `state` and `mode`.
    pub phase_template: &'a str,
    /// One-based position in the pipeline.
    pub index: usize,
    pub total: usize,
    pub state: &'a State,
    pub tools: Vec<String>,
    /// Recovered progress from an earlier run.
    pub resume: Option<&'a str>,
    /// Extra context produced by the phase's entry hook.
    pub reference: Option<&'a str>,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        Self { env }
    }

    fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let instructions = self
            .env
            .render_str(
                input.phase_template,
                context! { state => input.state, mode => input.mode },
            )
            .with_context(|| format!("render prompt for phase {}", input.phase_id))?;
        let state_json =
            serde_json::to_string_pretty(input.state).context("serialize state for prompt")?;
        let template = self.env.get_template("system")?;
        let rendered = template
            .render(context! {
                mode => input.mode,
                phase_id => input.phase_id,
                phase_name => input.phase_name,
                phase_description => input.phase_description.trim(),
                instructions => instructions.trim(),
                index => input.index,
                total => input.total,
                tools => &input.tools,
                state_json => state_json,
                resume => input.resume.map(str::trim).filter(|s| !s.is_empty()),
                reference => input.reference.map(str::trim).filter(|s| !s.is_empty()),
            })
            .context("render system prompt")?;
        Ok(rendered)
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Drop droppable sections in [`DROP_ORDER`], then truncate the last one.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total_len(rest));
    let before_len = last.content.len();
    if allowed > TRUNCATION_MARK.len() {
        let cut = floor_char_boundary(&last.content, allowed - TRUNCATION_MARK.len());
        last.content.truncate(cut);
        last.content.push_str(TRUNCATION_MARK);
    } else {
        let cut = floor_char_boundary(&last.content, allowed);
        last.content.truncate(cut);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

/// Builds phase prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, input: &PromptInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new().render(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs<'a>(state: &'a State, template: &'a str) -> PromptInputs<'a> {
        PromptInputs {
            mode: "setup",
            phase_id: "discover",
            phase_name: "Discover",
            phase_description: "Find out how the project runs.",
            phase_template: template,
            index: 1,
            total: 6,
            state,
            tools: vec!["read_file".to_string(), "transition".to_string()],
            resume: Some("Already completed phases: none."),
            reference: Some("capability manifest"),
        }
    }

    /// Verifies sections appear in a fixed order:
    /// role -> rules -> phase -> state -> resume -> reference.
    #[test]
    fn prompt_ordering_is_stable() {
        let state = State::default();
        let prompt = PromptBuilder::new(100_000)
            .build(&inputs(&state, "Look around."))
            .expect("build");
        let positions: Vec<usize> = ["<role>", "<rules>", "<phase>", "<state>", "<resume>", "<reference>"]
            .iter()
            .map(|tag| prompt.find(tag).unwrap_or_else(|| panic!("missing {tag}")))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(prompt.contains("Phase 1 of 6: Discover (`discover`)"));
        assert!(prompt.contains("Tools available in this phase: read_file, transition"));
        assert!(!prompt.contains("section:"));
    }

    #[test]
    fn phase_template_sees_state_and_mode() {
        let mut state = State::default();
        state.apply(json!({"runtime": "python", "port": 8000}).as_object().expect("object"));
        let template = "{% if state.runtime %}Runtime is {{ state.runtime }} on {{ state.port }}.{% endif %} Mode {{ mode }}.";
        let prompt = PromptBuilder::new(100_000)
            .build(&inputs(&state, template))
            .expect("build");
        assert!(prompt.contains("Runtime is python on 8000. Mode setup."));
        assert!(prompt.contains("\"runtime\": \"python\""));
    }

    /// With a tight budget the hook reference goes first, then recovered progress,
    /// while required sections stay.
    #[test]
    fn budget_drops_reference_then_resume() {
        let state = State::default();
        let mut input = inputs(&state, "Look around.");
        let reference = "r".repeat(5_000);
        input.reference = Some(&reference);
        let full = PromptBuilder::new(100_000).build(&input).expect("full");
        let without_reference = full.len() - reference.len();

        let prompt = PromptBuilder::new(without_reference)
            .build(&input)
            .expect("tight");
        assert!(!prompt.contains("<reference>"));
        assert!(prompt.contains("<resume>"));

        let prompt = PromptBuilder::new(1_500).build(&input).expect("tighter");
        assert!(!prompt.contains("<reference>"));
        assert!(!prompt.contains("<resume>"));
        assert!(prompt.contains("<role>"));
        assert!(prompt.contains("<phase>"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut sections = vec![ParsedSection {
            key: "state".to_string(),
            required: true,
            content: "é".repeat(100),
        }];
        apply_budget(&mut sections, 51);
        assert!(sections[0].content.ends_with(TRUNCATION_MARK));
        assert!(sections[0].content.len() <= 51);
    }

    #[test]
    fn invalid_phase_template_is_an_error() {
        let state = State::default();
        let err = PromptBuilder::new(1_000)
            .build(&inputs(&state, "{% if %}"))
            .unwrap_err();
        assert!(err.to_string().contains("render prompt for phase discover"));
    }
}
