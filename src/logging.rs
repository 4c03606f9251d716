//! Logger initialization.
//!
//! Log output is a compact single-line record per event on stderr,
//! filtered by the `AIMAGER_LOG_LEVEL` environment variable
//! (`debug|info|warn|error|fatal`, default `info`).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable controlling the log level.
pub const LOG_LEVEL_VAR: &str = "AIMAGER_LOG_LEVEL";

/// Initialize the logging system from `AIMAGER_LOG_LEVEL`.
///
/// `fatal` is accepted for compatibility and folds into `error`. Unknown
/// values fall back to `info`.
pub fn init() {
    let level = std::env::var(LOG_LEVEL_VAR).unwrap_or_default();
    let directive = match level.as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" | "fatal" => "error",
        _ => "info",
    };

    let filter = EnvFilter::new(directive);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .try_init();
}
