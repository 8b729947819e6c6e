//! Phase entry hooks.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::core::state::State;
use crate::phase::PhaseHook;

const MANIFEST_LIMIT: usize = 20_000;

/// Fetches the capability manifest (supported runtimes, SDK versions) and
/// splices it into the instrument prompt.
#[derive(Debug, Clone)]
pub struct CapabilityManifestHook {
    url: String,
    http: reqwest::Client,
}

impl CapabilityManifestHook {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("build manifest client")?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl PhaseHook for CapabilityManifestHook {
    async fn on_enter(&self, state: &State) -> Result<String> {
        debug!(url = %self.url, "fetching capability manifest");
        let body = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("fetch capability manifest {}", self.url))?
            .error_for_status()
            .context("capability manifest request failed")?
            .text()
            .await
            .context("read capability manifest")?;

        let mut cut = body.len().min(MANIFEST_LIMIT);
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut out = String::from("Capability manifest");
        if let Some(runtime) = &state.runtime {
            out.push_str(&format!(" (use the entries for the {runtime} runtime)"));
        }
        out.push_str(":\n");
        out.push_str(&body[..cut]);
        Ok(out)
    }
}
