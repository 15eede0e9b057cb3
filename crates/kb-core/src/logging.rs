//! `tracing-subscriber` initialization, shared by every binary in the
//! workspace.
//!
//! Grounded on `agentor-cli/src/main.rs`'s `tracing_subscriber::fmt()
//! .with_env_filter(...)` setup.

use tracing_subscriber::EnvFilter;

/// Install a process-wide `tracing` subscriber. Honors `RUST_LOG`,
/// defaulting to `info`. Safe to call once per process; a second call is a
/// no-op (the underlying `try_init` error is swallowed).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Same as [`init`] but emits newline-delimited JSON, for environments that
/// ingest structured logs.
pub fn init_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init();
}
