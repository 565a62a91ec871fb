//! Logging initialization for library embedders
//!
//! The crate itself only emits `tracing` events; hosts that want a ready
//! subscriber can call [`init`] once at startup.

use tracing_subscriber::EnvFilter;

/// Output format for the default subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output
    #[default]
    Text,
    /// JSON lines, one event per line
    Json,
}

/// Install the default tracing subscriber
///
/// The filter is taken from `RUST_LOG` when set, otherwise `info`.
/// Returns an error string when a global subscriber is already installed.
pub fn init(format: LogFormat) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    match format {
        LogFormat::Text => builder.try_init().map_err(|e| e.to_string()),
        LogFormat::Json => builder.json().try_init().map_err(|e| e.to_string()),
    }
}
