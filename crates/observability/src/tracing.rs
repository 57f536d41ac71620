//! Tracing subscriber initialization.

use tracing_subscriber::EnvFilter;

/// Output encoding for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event (production).
    #[default]
    Json,
    /// Human-readable, for local runs.
    Pretty,
}

/// Install a global subscriber.
///
/// `RUST_LOG` wins over `default_directive` when set. Returns `false` when a
/// subscriber was already installed (the call is then a no-op).
pub fn init_with(default_directive: &str, format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true);

    match format {
        LogFormat::Json => builder.json().with_current_span(true).try_init().is_ok(),
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
    }
}
