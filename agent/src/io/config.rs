//! Agent configuration stored under `.setup-agent/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryConfig;
use crate::io::paths::write_atomic;
use crate::llm::Auth;

pub const ENV_API_KEY: &str = "SETUP_AGENT_API_KEY";
pub const ENV_PROXY_TOKEN: &str = "SETUP_AGENT_PROXY_TOKEN";
pub const ENV_PROXY_URL: &str = "SETUP_AGENT_PROXY_URL";

/// Agent configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    pub api_base_url: String,
    /// Request streamed (SSE) responses.
    pub stream: bool,

    /// Run-wide ceiling on input + output tokens.
    pub max_total_tokens: u64,
    /// Bound on a single model turn, including retries.
    pub api_timeout_secs: u64,
    pub phase_timeout_secs: u64,
    /// Default per-tool timeout when neither the phase nor the tool sets one.
    pub tool_timeout_secs: u64,
    pub default_max_iterations: u32,
    pub prompt_budget_bytes: usize,
    /// Truncate foreground command stdout/stderr beyond this many bytes.
    pub command_output_limit_bytes: usize,
    pub capability_manifest_url: Option<String>,

    pub retry: RetrySection,
    pub readiness: ReadinessSection,
    pub commands: CommandsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_min: f64,
    pub jitter_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReadinessSection {
    pub timeout_secs: u64,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandsSection {
    /// Command prefixes that never need confirmation (e.g. `"npm install"`).
    pub pre_approved: Vec<String>,
}

impl Default for RetrySection {
    fn default() -> Self {
        let production = RetryConfig::production();
        Self {
            max_retries: production.max_retries,
            base_backoff_ms: production.base_backoff.as_millis() as u64,
            max_backoff_ms: production.max_backoff.as_millis() as u64,
            jitter_min: production.jitter_min,
            jitter_max: production.jitter_max,
        }
    }
}

impl Default for ReadinessSection {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            interval_ms: 1000,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 8192,
            api_base_url: "https://api.anthropic.com".to_string(),
            stream: true,
            max_total_tokens: 2_000_000,
            api_timeout_secs: 5 * 60,
            phase_timeout_secs: 30 * 60,
            tool_timeout_secs: 2 * 60,
            default_max_iterations: 40,
            prompt_budget_bytes: 60_000,
            command_output_limit_bytes: 30_000,
            capability_manifest_url: None,
            retry: RetrySection::default(),
            readiness: ReadinessSection::default(),
            commands: CommandsSection::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must not be empty"));
        }
        let positive = [
            ("max_tokens", u64::from(self.max_tokens)),
            ("max_total_tokens", self.max_total_tokens),
            ("api_timeout_secs", self.api_timeout_secs),
            ("phase_timeout_secs", self.phase_timeout_secs),
            ("tool_timeout_secs", self.tool_timeout_secs),
            ("default_max_iterations", u64::from(self.default_max_iterations)),
            ("prompt_budget_bytes", self.prompt_budget_bytes as u64),
            ("command_output_limit_bytes", self.command_output_limit_bytes as u64),
            ("readiness.timeout_secs", self.readiness.timeout_secs),
            ("readiness.interval_ms", self.readiness.interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        let retry = &self.retry;
        if retry.jitter_min <= 0.0 || retry.jitter_max < retry.jitter_min {
            return Err(anyhow!(
                "retry jitter bounds must satisfy 0 < jitter_min <= jitter_max"
            ));
        }
        if retry.max_backoff_ms < retry.base_backoff_ms {
            return Err(anyhow!("retry.max_backoff_ms must be >= retry.base_backoff_ms"));
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            base_backoff: Duration::from_millis(self.retry.base_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            jitter_min: self.retry.jitter_min,
            jitter_max: self.retry.jitter_max,
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness.timeout_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness.interval_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Resolved credentials and the endpoint they apply to.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub auth: Auth,
    /// Set for proxied mode when a proxy URL is configured.
    pub base_url: Option<String>,
}

/// Pick the authentication mode from environment lookups.
///
/// A direct API key wins over a proxy token.
pub fn resolve_credentials(lookup: impl Fn(&str) -> Option<String>) -> Result<Credentials> {
    let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    if let Some(api_key) = non_empty(ENV_API_KEY) {
        return Ok(Credentials {
            auth: Auth::Direct { api_key },
            base_url: None,
        });
    }
    if let Some(token) = non_empty(ENV_PROXY_TOKEN) {
        return Ok(Credentials {
            auth: Auth::Proxied {
                token,
                client_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            base_url: non_empty(ENV_PROXY_URL),
        });
    }
    Err(anyhow!(
        "no credentials: set {ENV_API_KEY} (direct) or {ENV_PROXY_TOKEN} (proxied)"
    ))
}
