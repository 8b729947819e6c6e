//! Compatibility (eligibility) report validation.
//!
//! The assessment phase may only transition with a report that passes both the
//! JSON schema and the semantic checks below: every service carries non-empty
//! reasoning and the summary counts match the per-status tally exactly.

use std::fmt;
use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ELIGIBILITY_SCHEMA: &str = include_str!("../../schemas/eligibility_report.schema.json");

static VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(ELIGIBILITY_SCHEMA).expect("eligibility schema json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("compile eligibility schema")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Eligibility {
    Eligible,
    Partial,
    Ineligible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAssessment {
    pub name: String,
    pub status: Eligibility,
    pub runtime: String,
    pub reasoning: String,
    #[serde(default)]
    pub blockers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: u64,
    pub eligible: u64,
    pub partial: u64,
    pub ineligible: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityReport {
    pub services: Vec<ServiceAssessment>,
    pub summary: ReportSummary,
}

/// A rejected report, with one message per problem found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportError {
    pub problems: Vec<String>,
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "eligibility report rejected:\n- {}",
            self.problems.join("\n- ")
        )
    }
}

impl std::error::Error for ReportError {}

/// Validate a raw report value; returns the typed report on success.
pub fn validate_report(raw: &Value) -> Result<EligibilityReport, ReportError> {
    let schema_problems: Vec<String> = VALIDATOR
        .iter_errors(raw)
        .map(|err| err.to_string())
        .collect();
    if !schema_problems.is_empty() {
        return Err(ReportError {
            problems: schema_problems,
        });
    }
    let report: EligibilityReport =
        serde_json::from_value(raw.clone()).map_err(|err| ReportError {
            problems: vec![format!("report shape: {err}")],
        })?;

    let problems = semantic_problems(&report);
    if problems.is_empty() {
        Ok(report)
    } else {
        Err(ReportError { problems })
    }
}

fn semantic_problems(report: &EligibilityReport) -> Vec<String> {
    let mut problems = Vec::new();
    let mut tally = [0u64; 3];
    for service in &report.services {
        if service.reasoning.trim().is_empty() {
            problems.push(format!("service '{}' is missing reasoning", service.name));
        }
        let slot = match service.status {
            Eligibility::Eligible => 0,
            Eligibility::Partial => 1,
            Eligibility::Ineligible => 2,
        };
        tally[slot] += 1;
    }

    let summary = report.summary;
    let listed = report.services.len() as u64;
    if summary.total != listed {
        problems.push(format!(
            "summary.total is {} but {} services were listed",
            summary.total, listed
        ));
    }
    let counts = [
        ("eligible", summary.eligible, tally[0]),
        ("partial", summary.partial, tally[1]),
        ("ineligible", summary.ineligible, tally[2]),
    ];
    for (label, claimed, actual) in counts {
        if claimed != actual {
            problems.push(format!(
                "summary.{label} is {claimed} but {actual} services are {label}"
            ));
        }
    }
    problems
}
