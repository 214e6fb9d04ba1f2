//! Utilities for logging.

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize the global tracing subscriber.
///
/// Filtering defaults to INFO and may be overridden through `RUST_LOG`.
pub fn init() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize logging for tests.
///
/// Output goes through the test writer so it's captured per-test. Safe to
/// call multiple times; only the first call installs a subscriber.
pub fn init_for_tests() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::DEBUG.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_test_writer()
        .with_env_filter(env_filter)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
