//! Tracing setup for the CLI.
//!
//! Diagnostics go to stderr and are controlled by `RUST_LOG`. Run artifacts
//! (`.patchloop/last*`, `NOTES.txt`) are written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `patchloop=info` if unset.
///
/// # Example
/// ```bash
/// RUST_LOG=patchloop=debug patchloop "add a health endpoint"
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("patchloop=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
