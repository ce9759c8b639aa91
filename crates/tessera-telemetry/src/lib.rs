//! Logging setup and metrics facade for the Tessera pipeline.
//!
//! - **Logging**: a `tracing-subscriber` registry with JSON or pretty output
//! - **Metrics**: counters, histograms and gauges through the `metrics`
//!   facade; hosts install whichever recorder they use
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_config::PipelineConfig;
//! use tessera_telemetry::init_telemetry;
//!
//! let config = PipelineConfig::production();
//! init_telemetry(&config)?;
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::TelemetryError;
pub use logging::{init_logging, subscriber_installed};
pub use metrics::{describe_metrics, InFlightGuard};

use tessera_config::PipelineConfig;

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Installs logging from `config.logging` and registers metric descriptions.
///
/// # Errors
///
/// Returns `TelemetryError` if logging cannot be initialized.
pub fn init_telemetry(config: &PipelineConfig) -> TelemetryResult<()> {
    init_logging(&config.logging)?;
    describe_metrics();
    Ok(())
}
