//! # wsjrpc-logging
//!
//! Structured logging with `tracing`.
//!
//! - [`LogLevel`] and [`LogFormat`] parsed from settings strings
//! - [`init_subscriber`] installs the global stderr subscriber
//! - [`test_utils::capture_logs`] records events in memory for assertions
//!
//! Log context (connection id, method) travels on tracing spans and fields;
//! wire traffic is logged at `debug` so it stays out of the default output.

#![deny(unsafe_code)]

pub mod test_utils;
pub mod types;

pub use test_utils::{CapturedLogs, capture_logs};
pub use types::{LogFormat, LogLevel};

/// Initialize the global tracing subscriber writing to stderr.
///
/// Call once at application startup. Subsequent calls are no-ops.
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn init_subscriber(level: LogLevel, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails only when a global subscriber already exists
    let _ = match format {
        LogFormat::Pretty => builder.compact().try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
