//! Tracing/logging initialization.
//!
//! Filtering comes from `RUST_LOG`; the default keeps the event log crates at
//! `info` and everything else at `warn` so sqlx statement logging stays quiet.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,eventlog_infra=info,eventlog_events=info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    // JSON logs + timestamps, configurable via RUST_LOG.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Initialize compact logging routed through the libtest output capture.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_test_writer()
        .compact()
        .try_init();
}
