//! Top-level pipeline configuration.
//!
//! This module provides [`PipelineConfig`] and its builder.

use serde::{Deserialize, Serialize};

use crate::schema::default_true;
use crate::{
    AnalyticsConfig, ConfigError, Environment, LogFormat, LoggingConfig, PerformanceConfig,
    RetryConfig,
};

/// Complete configuration of the instrumentation pipeline.
///
/// Use [`ConfigLoader`](crate::ConfigLoader) to load it from files and
/// environment variables, or one of the presets.
///
/// # Example
///
/// ```
/// use tessera_config::PipelineConfig;
///
/// let config = PipelineConfig::default();
/// assert!(config.enabled);
/// assert_eq!(config.performance.warning_threshold_ms, 1000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Global kill switch. When `false` operations run without any stage.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Deployment environment.
    #[serde(default)]
    pub environment: Environment,

    /// Logging stage.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Analytics stage.
    #[serde(default)]
    pub analytics: AnalyticsConfig,

    /// Performance stage.
    #[serde(default)]
    pub performance: PerformanceConfig,

    /// Manager retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            environment: Environment::default(),
            logging: LoggingConfig::default(),
            analytics: AnalyticsConfig::default(),
            performance: PerformanceConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration builder.
    ///
    /// # Example
    ///
    /// ```
    /// use tessera_config::{AnalyticsConfig, PipelineConfig};
    ///
    /// let config = PipelineConfig::builder()
    ///     .analytics(AnalyticsConfig {
    ///         buffer_size: 3,
    ///         ..Default::default()
    ///     })
    ///     .build();
    ///
    /// assert_eq!(config.analytics.buffer_size, 3);
    /// ```
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    /// Validate value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - `analytics.sample_rate` is not in 0.0..=100.0
    /// - `analytics.buffer_size` or `analytics.flush_interval_ms` is zero
    /// - `performance.sampling.rate` is not in 0.0..=1.0
    /// - `performance.warning_threshold_ms` is not below the critical threshold
    /// - `retry.max_retries` or `retry.timeout_ms` is zero
    /// - `logging.level` is not a known level
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

        if !LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("unknown level '{}'", self.logging.level),
            ));
        }

        if !(0.0..=100.0).contains(&self.analytics.sample_rate) {
            return Err(ConfigError::invalid_value(
                "analytics.sample_rate",
                "must be between 0.0 and 100.0",
            ));
        }

        if self.analytics.buffer_size == 0 {
            return Err(ConfigError::invalid_value(
                "analytics.buffer_size",
                "must be at least 1",
            ));
        }

        if self.analytics.flush_interval_ms == 0 {
            return Err(ConfigError::invalid_value(
                "analytics.flush_interval_ms",
                "must be greater than zero",
            ));
        }

        if !(0.0..=1.0).contains(&self.performance.sampling.rate) {
            return Err(ConfigError::invalid_value(
                "performance.sampling.rate",
                "must be between 0.0 and 1.0",
            ));
        }

        if self.performance.warning_threshold_ms >= self.performance.critical_threshold_ms {
            return Err(ConfigError::invalid_value(
                "performance.warning_threshold_ms",
                "must be lower than performance.critical_threshold_ms",
            ));
        }

        if self.performance.cleanup_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "performance.cleanup_interval_secs",
                "must be greater than zero",
            ));
        }

        if self.retry.max_retries == 0 {
            return Err(ConfigError::invalid_value(
                "retry.max_retries",
                "must be at least 1",
            ));
        }

        if self.retry.timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "retry.timeout_ms",
                "must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Development preset: debug level, pretty output, no sampling.
    ///
    /// ```
    /// use tessera_config::PipelineConfig;
    ///
    /// let config = PipelineConfig::development();
    /// assert_eq!(config.logging.level, "debug");
    /// ```
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();

        config.environment = Environment::Development;
        config.logging.level = "debug".to_string();
        config.logging.format = LogFormat::Pretty;
        config.analytics.sample_rate = 100.0;

        config
    }

    /// Production preset: JSON output, sampled analytics and performance.
    ///
    /// ```
    /// use tessera_config::{LogFormat, PipelineConfig};
    ///
    /// let config = PipelineConfig::production();
    /// assert_eq!(config.logging.format, LogFormat::Json);
    /// assert!(config.environment.is_production());
    /// ```
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();

        config.environment = Environment::Production;
        config.logging.level = "info".to_string();
        config.logging.format = LogFormat::Json;
        config.logging.fallback_to_console = false;

        config.analytics.sample_rate = 10.0;
        config.analytics.buffer_size = 100;

        config.performance.sampling.enabled = true;
        config.performance.sampling.rate = 0.1;

        config
    }

    /// Test preset: short delays and timeouts, everything sampled.
    #[must_use]
    pub fn test() -> Self {
        let mut config = Self::default();

        config.environment = Environment::Test;
        config.logging.level = "warn".to_string();
        config.logging.fallback_to_console = false;
        config.retry.retry_delay_ms = 10;
        config.retry.timeout_ms = 1000;

        config
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Create a builder seeded with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global kill switch.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Set the environment.
    #[must_use]
    pub fn environment(mut self, environment: Environment) -> Self {
        self.config.environment = environment;
        self
    }

    /// Set the logging section.
    #[must_use]
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Set the analytics section.
    #[must_use]
    pub fn analytics(mut self, analytics: AnalyticsConfig) -> Self {
        self.config.analytics = analytics;
        self
    }

    /// Set the performance section.
    #[must_use]
    pub fn performance(mut self, performance: PerformanceConfig) -> Self {
        self.config.performance = performance;
        self
    }

    /// Set the retry section.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build the configuration without validating it.
    #[must_use]
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}
