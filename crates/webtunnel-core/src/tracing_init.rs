//! Shared tracing/logging initialization.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber for a `webtunnel` binary.
///
/// `RUST_LOG` wins when set. Otherwise `crate_name` and `webtunnel_core` log
/// at `debug` when `verbose` is on and at `info` when it is off. With
/// `log_json` every line is a JSON object instead of human-readable text.
pub fn init_tracing(crate_name: &str, verbose: bool, log_json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(crate_name, verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(log_json.then(|| fmt::layer().json()))
        .with((!log_json).then(fmt::layer))
        .init();
}

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(crate_name: &str, verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("{crate_name}={level},webtunnel_core={level}")
}
