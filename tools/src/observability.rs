//! Tracing setup shared by every binary that embeds this workspace.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a `tracing-subscriber` pipeline: a compact `fmt` layer plus an
/// `EnvFilter` seeded from `RUST_LOG`, falling back to `info` for `name` and
/// `warn` for everything else if the variable is unset or invalid.
///
/// Calling this more than once per process is a no-op after the first call
/// (the global subscriber can only be installed once); later calls are
/// logged at `debug` and otherwise ignored.
pub fn init_tracing(name: &'static str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,{name}=info,dialout_core=info")));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true));

    if registry.try_init().is_err() {
        tracing::debug!("tracing subscriber already initialized, skipping");
    }
}
