//! Logging bootstrap shared by binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Output format for structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Text,
    /// JSON lines for log shippers.
    Json,
}

/// Initialize the global subscriber. Reads `RUST_LOG` for the filter and
/// falls back to `info`. Safe to call once per process.
pub fn init() {
    init_with_format(LogFormat::Text);
}

/// Initialize with an explicit output format.
pub fn init_with_format(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => fmt().with_env_filter(filter).init(),
        LogFormat::Json => fmt().with_env_filter(filter).json().init(),
    }
}

/// Best-effort init for tests: ignores the error when a subscriber is
/// already installed.
pub fn try_init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
