//! Development-time tracing for debugging the agent.
//!
//! Tracing is diagnostics only: `RUST_LOG` controls it and it goes to stderr.
//! Product output is the [`crate::events::AgentEvent`] stream plus the files
//! under `.setup-agent/`, neither of which depends on `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn`, or `setup_agent=debug` with `verbose`.
///
/// ```bash
/// RUST_LOG=setup_agent=debug setup-agent run
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,setup_agent=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
