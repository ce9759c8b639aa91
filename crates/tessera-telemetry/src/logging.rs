//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry driven by the pipeline's
//! [`LoggingConfig`]: an `EnvFilter` built from `level` and a JSON or pretty
//! `fmt` layer selected by `format`.
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_config::LoggingConfig;
//! use tessera_telemetry::logging::init_logging;
//!
//! init_logging(&LoggingConfig::default())?;
//!
//! tracing::info!(operation = "fetchQuestions", "pipeline ready");
//! ```

use crate::error::TelemetryError;
use crate::TelemetryResult;
use tessera_config::{LogFormat, LoggingConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Initializes the global logging subscriber.
///
/// # Errors
///
/// Returns `TelemetryError::InvalidLevel` if `level` does not parse and
/// `TelemetryError::AlreadyInstalled` if a global subscriber exists.
pub fn init_logging(config: &LoggingConfig) -> TelemetryResult<()> {
    let filter = create_env_filter(&config.level)?;

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}

/// Parses a directive such as `info` or `tessera_middleware=debug,warn`.
///
/// # Errors
///
/// Returns `TelemetryError::InvalidLevel` if the directive is malformed.
pub fn create_env_filter(level: &str) -> TelemetryResult<EnvFilter> {
    EnvFilter::try_new(level).map_err(|e| TelemetryError::InvalidLevel {
        level: level.to_string(),
        reason: e.to_string(),
    })
}

/// Returns `true` when a global `tracing` subscriber has been installed.
///
/// Stages use this to decide whether to fall back to stderr.
pub fn subscriber_installed() -> bool {
    tracing::dispatcher::has_been_set()
}
