//! Typed configuration for the Tessera instrumentation pipeline.
//!
//! This crate provides:
//! - [`PipelineConfig`] with `logging`, `analytics`, `performance` and
//!   `retry` sections plus the global `enabled` switch
//! - Presets for development, production and test
//! - A layered [`ConfigLoader`] (defaults → TOML/JSON → environment)
//! - Strict parsing that fails on unknown fields
//!
//! # Example
//!
//! ```no_run
//! use tessera_config::ConfigLoader;
//!
//! # fn main() -> Result<(), tessera_config::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_dotenv()?
//!     .with_optional_file("tessera.toml")?
//!     .with_env_prefix("TESSERA")
//!     .load()?;
//!
//! println!("analytics sample rate: {}", config.analytics.sample_rate);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File Format
//!
//! ```toml
//! enabled = true
//! environment = "production"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! fallback_to_console = false
//! redact_keys = ["token"]
//!
//! [analytics]
//! enabled = true
//! sample_rate = 25.0
//! buffer_size = 50
//! flush_interval_ms = 30000
//!
//! [performance]
//! enabled = true
//! warning_threshold_ms = 1000
//! critical_threshold_ms = 3000
//!
//! [performance.sampling]
//! enabled = true
//! rate = 0.1
//!
//! [retry]
//! max_retries = 3
//! retry_delay_ms = 1000
//! timeout_ms = 5000
//! ```
//!
//! # Environment Variable Overrides
//!
//! Values can be overridden with `PREFIX__SECTION__KEY` variables:
//!
//! - `TESSERA__ENABLED=false`
//! - `TESSERA__ANALYTICS__SAMPLE_RATE=10`
//! - `TESSERA__PERFORMANCE__SAMPLING__RATE=0.5`

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::*;
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_toml_config() {
        let toml = r#"
            enabled = true
            environment = "test"

            [logging]
            level = "debug"
            format = "pretty"
            redact_keys = ["token"]

            [analytics]
            sample_rate = 50.0
            buffer_size = 5
            flush_interval_ms = 100

            [performance]
            warning_threshold_ms = 200
            critical_threshold_ms = 800

            [performance.sampling]
            enabled = true
            rate = 0.5

            [retry]
            max_retries = 2
            retry_delay_ms = 10
            timeout_ms = 50
        "#;

        let config = ConfigLoader::new()
            .with_string(toml, "toml")
            .unwrap()
            .load()
            .unwrap();

        assert_eq!(config.environment, Environment::Test);
        assert_eq!(config.logging.redact_keys, vec!["token"]);
        assert_eq!(config.analytics.buffer_size, 5);
        assert_eq!(config.performance.critical_threshold_ms, 800);
        assert!(config.performance.sampling.enabled);
        assert_eq!(config.retry.timeout_ms, 50);
    }

    #[test]
    fn test_config_serializes_back() {
        let config = PipelineConfig::production();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["environment"], "production");
        assert_eq!(json["logging"]["format"], "json");
    }
}
