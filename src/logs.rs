//! Tracing subscriber setup for the binary.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the process.
use tracing_subscriber::EnvFilter;

use crate::cli::LogLevelArg;

/// Builds the filter: explicit level first, then `RUST_LOG`, then `info`.
pub fn env_filter(level: Option<LogLevelArg>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Installs the global fmt subscriber with source locations and thread names.
///
/// A second call is a no-op.
pub fn init_logging(level: Option<LogLevelArg>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_file(true)
        .with_line_number(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init();
}
