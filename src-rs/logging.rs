//! Diagnostic tracing to stderr.
//!
//! Run artifacts (frame dumps, `cycles.jsonl`, `summary.json`) are written
//! by `run_log` and do not depend on the log level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Reads `RUST_LOG`, defaulting to `info`. Compact output on stderr.
///
/// ```bash
/// RUST_LOG=visual_truth_loop=debug visual-truth-loop run --goal "open settings"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
