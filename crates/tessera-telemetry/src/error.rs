//! Telemetry error types.

use thiserror::Error;

/// Logging could not be installed.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// `logging.level` is not a valid filter directive.
    #[error("invalid log level '{level}': {reason}")]
    InvalidLevel {
        /// The rejected directive.
        level: String,
        /// Parser message.
        reason: String,
    },

    /// Another global subscriber is already in place.
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}
