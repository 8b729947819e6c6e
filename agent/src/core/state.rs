//! Accumulated discovery state and its whitelisted merge.
//!
//! `State` is only ever patched through [`State::apply`], which treats the
//! model-supplied map as an untyped patch against a known schema. Unknown keys
//! and values of the wrong JSON type are skipped, but reported back in a
//! [`StateUpdate`] so nothing disappears without a trace.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Milestone flags in the order they appear in the progress file.
pub const MILESTONES: &[&str] = &[
    "app_verified",
    "instrumentation_installed",
    "config_written",
    "tests_passed",
    "report_written",
    "cloud_deployed",
    "telemetry_verified",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub runtime: Option<String>,
    pub framework: Option<String>,
    pub package_manager: Option<String>,
    pub entry_point: Option<String>,
    pub start_command: Option<String>,
    pub port: Option<u16>,
    pub health_endpoint: Option<String>,
    pub service_name: Option<String>,
    pub service_id: Option<String>,
    #[serde(default)]
    pub compatibility_warnings: Vec<String>,

    pub app_verified: bool,
    pub instrumentation_installed: bool,
    pub config_written: bool,
    pub tests_passed: bool,
    pub report_written: bool,

    pub cloud_project_id: Option<String>,
    pub cloud_region: Option<String>,
    pub cloud_deployed: bool,
    pub telemetry_verified: bool,

    /// Validated eligibility report from the assessment mode.
    pub eligibility_report: Option<Value>,
}

/// Outcome of merging one patch into [`State`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateUpdate {
    pub applied: Vec<String>,
    pub unknown: Vec<String>,
    pub mistyped: Vec<String>,
}

impl StateUpdate {
    pub fn ignored(&self) -> impl Iterator<Item = &String> {
        self.unknown.iter().chain(self.mistyped.iter())
    }

    pub fn has_ignored(&self) -> bool {
        !self.unknown.is_empty() || !self.mistyped.is_empty()
    }
}

enum Outcome {
    Applied,
    Unknown,
    Mistyped,
}

impl State {
    /// Merge a model-supplied key/value map. Known keys overwrite, everything else
    /// is reported in the returned [`StateUpdate`].
    pub fn apply(&mut self, patch: &Map<String, Value>) -> StateUpdate {
        let mut update = StateUpdate::default();
        for (key, value) in patch {
            match self.apply_field(key, value) {
                Outcome::Applied => update.applied.push(key.clone()),
                Outcome::Unknown => update.unknown.push(key.clone()),
                Outcome::Mistyped => update.mistyped.push(key.clone()),
            }
        }
        update
    }

    fn apply_field(&mut self, key: &str, value: &Value) -> Outcome {
        if let Some(slot) = self.text_slot(key) {
            return match value.as_str() {
                Some(text) => {
                    *slot = Some(text.to_string());
                    Outcome::Applied
                }
                None => Outcome::Mistyped,
            };
        }
        if let Some(flag) = self.milestone_slot(key) {
            return match value.as_bool() {
                Some(b) => {
                    *flag = b;
                    Outcome::Applied
                }
                None => Outcome::Mistyped,
            };
        }
        match key {
            "port" => match parse_port(value) {
                Some(port) => {
                    self.port = Some(port);
                    Outcome::Applied
                }
                None => Outcome::Mistyped,
            },
            "compatibility_warnings" => match value {
                Value::String(single) => {
                    if !self.compatibility_warnings.contains(single) {
                        self.compatibility_warnings.push(single.clone());
                    }
                    Outcome::Applied
                }
                Value::Array(items) => {
                    let warnings: Option<Vec<String>> = items
                        .iter()
                        .map(|item| item.as_str().map(str::to_string))
                        .collect();
                    match warnings {
                        Some(warnings) => {
                            self.compatibility_warnings = warnings;
                            Outcome::Applied
                        }
                        None => Outcome::Mistyped,
                    }
                }
                _ => Outcome::Mistyped,
            },
            "eligibility_report" => {
                if value.is_object() {
                    self.eligibility_report = Some(value.clone());
                    Outcome::Applied
                } else {
                    Outcome::Mistyped
                }
            }
            _ => Outcome::Unknown,
        }
    }

    fn text_slot(&mut self, key: &str) -> Option<&mut Option<String>> {
        Some(match key {
            "runtime" => &mut self.runtime,
            "framework" => &mut self.framework,
            "package_manager" => &mut self.package_manager,
            "entry_point" => &mut self.entry_point,
            "start_command" => &mut self.start_command,
            "health_endpoint" => &mut self.health_endpoint,
            "service_name" => &mut self.service_name,
            "service_id" => &mut self.service_id,
            "cloud_project_id" => &mut self.cloud_project_id,
            "cloud_region" => &mut self.cloud_region,
            _ => return None,
        })
    }

    fn milestone_slot(&mut self, key: &str) -> Option<&mut bool> {
        Some(match key {
            "app_verified" => &mut self.app_verified,
            "instrumentation_installed" => &mut self.instrumentation_installed,
            "config_written" => &mut self.config_written,
            "tests_passed" => &mut self.tests_passed,
            "report_written" => &mut self.report_written,
            "cloud_deployed" => &mut self.cloud_deployed,
            "telemetry_verified" => &mut self.telemetry_verified,
            _ => return None,
        })
    }

    pub fn milestone(&self, name: &str) -> Option<bool> {
        match name {
            "app_verified" => Some(self.app_verified),
            "instrumentation_installed" => Some(self.instrumentation_installed),
            "config_written" => Some(self.config_written),
            "tests_passed" => Some(self.tests_passed),
            "report_written" => Some(self.report_written),
            "cloud_deployed" => Some(self.cloud_deployed),
            "telemetry_verified" => Some(self.telemetry_verified),
            _ => None,
        }
    }

    /// Set a milestone by name; returns false for unknown names.
    pub fn set_milestone(&mut self, name: &str, value: bool) -> bool {
        match self.milestone_slot(name) {
            Some(flag) => {
                *flag = value;
                true
            }
            None => false,
        }
    }

    /// Populated scalar facts as printable key/value pairs.
    pub fn info_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        let text = [
            ("runtime", &self.runtime),
            ("framework", &self.framework),
            ("package_manager", &self.package_manager),
            ("entry_point", &self.entry_point),
            ("start_command", &self.start_command),
            ("health_endpoint", &self.health_endpoint),
            ("service_name", &self.service_name),
            ("service_id", &self.service_id),
            ("cloud_project_id", &self.cloud_project_id),
            ("cloud_region", &self.cloud_region),
        ];
        for (key, value) in text {
            if let Some(value) = value {
                pairs.push((key, value.clone()));
            }
        }
        if let Some(port) = self.port {
            pairs.push(("port", port.to_string()));
        }
        for warning in &self.compatibility_warnings {
            pairs.push(("compatibility_warnings", warning.clone()));
        }
        pairs
    }

    /// Restore one discovered-info line read back from the progress file.
    ///
    /// List fields appear once per item, so each warning line appends.
    pub fn restore_info(&mut self, key: &str, raw: &str) -> bool {
        let value = match key {
            "port" => match raw.parse::<u64>() {
                Ok(port) => Value::from(port),
                Err(_) => return false,
            },
            _ => Value::String(raw.to_string()),
        };
        matches!(self.apply_field(key, &value), Outcome::Applied)
    }
}

fn parse_port(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    }
}
