//! Configuration schema types.
//!
//! Each section of [`PipelineConfig`](crate::PipelineConfig) lives here with
//! its serde defaults.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Deployment environment the pipeline runs in.
///
/// Production hides internal error messages and stack details from
/// structured error responses.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development.
    #[default]
    Development,
    /// Production deployment.
    Production,
    /// Automated test runs.
    Test,
}

impl Environment {
    /// Returns `true` for [`Environment::Production`].
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Lowercase name of the environment.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::invalid_value(
                "environment",
                format!("unknown environment '{other}'"),
            )),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON formatted logs (production).
    #[default]
    Json,
    /// Human-readable pretty format (development).
    Pretty,
}

/// Logging stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Minimum level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format. Also selects compact or pretty context snapshots.
    #[serde(default)]
    pub format: LogFormat,

    /// Print records to stderr when no tracing subscriber is installed.
    #[serde(default = "default_true")]
    pub fallback_to_console: bool,

    /// Extra keys redacted from context snapshots, on top of
    /// `credentials` and `secrets`.
    #[serde(default)]
    pub redact_keys: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            fallback_to_console: true,
            redact_keys: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Analytics stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AnalyticsConfig {
    /// Enable the analytics stage.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Percentage of executions recorded, `0.0..=100.0`.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Buffered events that trigger an immediate flush.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Interval of the background flush timer in milliseconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: default_sample_rate(),
            buffer_size: default_buffer_size(),
            flush_interval_ms: default_flush_interval(),
        }
    }
}

fn default_sample_rate() -> f64 {
    100.0
}

fn default_buffer_size() -> usize {
    50
}

fn default_flush_interval() -> u64 {
    30_000
}

/// Sampling gate for the performance stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SamplingConfig {
    /// Enable sampling. When disabled every execution is measured.
    #[serde(default)]
    pub enabled: bool,

    /// Fraction of executions measured, `0.0..=1.0`.
    #[serde(default = "default_sampling_rate")]
    pub rate: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: default_sampling_rate(),
        }
    }
}

fn default_sampling_rate() -> f64 {
    1.0
}

/// Performance stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PerformanceConfig {
    /// Enable the performance stage.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Durations above this are classified as `warning`.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold_ms: u64,

    /// Durations above this are classified as `critical`.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold_ms: u64,

    /// Sampling gate.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Age after which detailed records are pruned.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Interval of the pruning sweep in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold_ms: default_warning_threshold(),
            critical_threshold_ms: default_critical_threshold(),
            sampling: SamplingConfig::default(),
            retention_hours: default_retention_hours(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_warning_threshold() -> u64 {
    1000
}

fn default_critical_threshold() -> u64 {
    3000
}

fn default_retention_hours() -> u64 {
    24
}

fn default_cleanup_interval() -> u64 {
    3600
}

/// Retry policy of the middleware manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts per execution, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay of the linear backoff in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Timeout applied to each phase of an attempt in milliseconds.
    #[serde(default = "default_attempt_timeout")]
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            timeout_ms: default_attempt_timeout(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_attempt_timeout() -> u64 {
    5000
}

pub(crate) fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse() {
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("DEV".parse::<Environment>().unwrap(), Environment::Development);
        assert_eq!("test".parse::<Environment>().unwrap(), Environment::Test);
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_environment_serde_lowercase() {
        let env: Environment = serde_json::from_str(r#""production""#).unwrap();
        assert!(env.is_production());
        assert_eq!(serde_json::to_string(&Environment::Test).unwrap(), r#""test""#);
    }

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.fallback_to_console);
        assert!(config.redact_keys.is_empty());
    }

    #[test]
    fn test_analytics_config_default() {
        let config = AnalyticsConfig::default();
        assert!(config.enabled);
        assert!((config.sample_rate - 100.0).abs() < f64::EPSILON);
        assert_eq!(config.buffer_size, 50);
        assert_eq!(config.flush_interval_ms, 30_000);
    }

    #[test]
    fn test_performance_config_default() {
        let config = PerformanceConfig::default();
        assert_eq!(config.warning_threshold_ms, 1000);
        assert_eq!(config.critical_threshold_ms, 3000);
        assert!(!config.sampling.enabled);
        assert_eq!(config.retention_hours, 24);
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 1000);
        assert_eq!(config.timeout_ms, 5000);
    }

    #[test]
    fn test_analytics_unknown_field_rejected() {
        let toml = r"
            sample_rate = 50.0
            batch = 10
        ";
        let result: Result<AnalyticsConfig, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_partial_performance_section_uses_defaults() {
        let toml = r"
            warning_threshold_ms = 250

            [sampling]
            enabled = true
            rate = 0.25
        ";
        let config: PerformanceConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.warning_threshold_ms, 250);
        assert_eq!(config.critical_threshold_ms, 3000);
        assert!(config.sampling.enabled);
        assert!((config.sampling.rate - 0.25).abs() < f64::EPSILON);
    }
}
