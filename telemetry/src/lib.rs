//! Logger configuration shared by every binary in this workspace.

#![deny(clippy::disallowed_methods)]

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Output format for the global logger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored, single-line-per-event. Used in local dev.
    Compact,
    /// Newline-delimited JSON. Used wherever logs are shipped off-host.
    Json,
}

/// Initialize the global `tracing` subscriber.
///
/// The default log level is INFO/WARN/ERROR; set `RUST_LOG` to override,
/// using the standard `tracing_subscriber::filter::Targets` syntax.
///
/// Panics if a logger is already initialized.
pub fn init(format: LogFormat) {
    try_init(format).expect("Failed to setup logger");
}

/// Initialize the global logger for tests. Skips setup entirely if `RUST_LOG`
/// isn't set, and tolerates a logger already being installed by another test.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = try_init(LogFormat::Compact);
}

fn rust_log_filter() -> Targets {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| Targets::from_str(&rust_log).ok())
        .unwrap_or_else(|| Targets::new().with_default(Level::INFO))
}

/// Fallible version of [`init`].
pub fn try_init(format: LogFormat) -> Result<(), TryInitError> {
    match format {
        LogFormat::Compact => {
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(true)
                .with_ansi(true)
                .with_filter(rust_log_filter());
            tracing_subscriber::registry().with(layer).try_init()
        }
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_level(true)
                .with_target(true)
                .with_current_span(true)
                .with_filter(rust_log_filter());
            tracing_subscriber::registry().with(layer).try_init()
        }
    }
}
