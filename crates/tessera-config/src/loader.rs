//! Layered configuration loader.
//!
//! Layers apply in order, later ones overriding earlier ones:
//! 1. Defaults or a preset
//! 2. A TOML or JSON file (or string)
//! 3. Environment variables

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::{ConfigError, Environment, LogFormat, PipelineConfig};

/// Configuration loader with layered approach.
///
/// # Example
///
/// ```no_run
/// use tessera_config::ConfigLoader;
///
/// # fn main() -> Result<(), tessera_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_production()
///     .with_optional_file("tessera.toml")?
///     .with_env_prefix("TESSERA")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    config: PipelineConfig,
    env_prefix: Option<String>,
    file_loaded: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a loader starting from default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            env_prefix: None,
            file_loaded: false,
        }
    }

    /// Start with development preset configuration.
    #[must_use]
    pub fn with_development(mut self) -> Self {
        self.config = PipelineConfig::development();
        self
    }

    /// Start with production preset configuration.
    #[must_use]
    pub fn with_production(mut self) -> Self {
        self.config = PipelineConfig::production();
        self
    }

    /// Start with test preset configuration.
    #[must_use]
    pub fn with_test(mut self) -> Self {
        self.config = PipelineConfig::test();
        self
    }

    /// Load configuration from a `.toml` or `.json` file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing, unreadable, malformed,
    /// or contains unknown fields.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;

        self.config = Self::parse_file(&content, path)?;
        self.file_loaded = true;

        Ok(self)
    }

    /// Load configuration from a file if it exists.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but cannot be loaded.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Load configuration from a string in the given format (`toml` or `json`).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if parsing fails or the format is unsupported.
    ///
    /// # Example
    ///
    /// ```
    /// use tessera_config::ConfigLoader;
    ///
    /// let toml = r#"
    ///     [analytics]
    ///     buffer_size = 3
    /// "#;
    ///
    /// let config = ConfigLoader::new()
    ///     .with_string(toml, "toml")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    ///
    /// assert_eq!(config.analytics.buffer_size, 3);
    /// ```
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.config = match format.to_lowercase().as_str() {
            "toml" => toml::from_str(content)?,
            "json" => serde_json::from_str(content)?,
            _ => {
                return Err(ConfigError::UnsupportedFormat(format.to_string()))
            }
        };
        Ok(self)
    }

    /// Set the environment variable prefix for overrides.
    ///
    /// Variables use the format `PREFIX__SECTION__KEY`, for example
    /// `TESSERA__ANALYTICS__SAMPLE_RATE=25`.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Load variables from a `.env` file in the working directory, if any.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` if a `.env` file exists but cannot be
    /// parsed.
    pub fn with_dotenv(self) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => Ok(self),
            Err(e) if e.not_found() => Ok(self),
            Err(e) => Err(ConfigError::read_error(
                ".env",
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
            )),
        }
    }

    /// Whether a configuration file was loaded.
    pub fn file_loaded(&self) -> bool {
        self.file_loaded
    }

    /// Apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if an override cannot be parsed or validation
    /// fails.
    pub fn load(mut self) -> Result<PipelineConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            self.apply_env_overrides(&prefix)?;
        }

        self.config.validate()?;

        Ok(self.config)
    }

    /// Return the configuration without env overrides or validation.
    #[must_use]
    pub fn load_unvalidated(self) -> PipelineConfig {
        self.config
    }

    fn parse_file(content: &str, path: &Path) -> Result<PipelineConfig, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);

        match extension.as_deref() {
            Some("toml") => Ok(toml::from_str(content)?),
            Some("json") => Ok(serde_json::from_str(content)?),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    fn apply_env_overrides(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let env_vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect();

        for (key, value) in env_vars {
            self.apply_env_var(&key, &value, prefix)?;
        }

        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let key_without_prefix = key
            .strip_prefix(prefix)
            .and_then(|k| k.strip_prefix("__"))
            .ok_or_else(|| ConfigError::env_override(key, "invalid key format"))?;

        let parts: Vec<&str> = key_without_prefix.split("__").collect();
        let config = &mut self.config;

        match parts.as_slice() {
            ["ENABLED"] => config.enabled = bool_var(key, value)?,
            ["ENVIRONMENT"] => {
                config.environment = Environment::from_str(value)
                    .map_err(|_| ConfigError::env_override(key, "expected environment name"))?;
            }

            ["LOGGING", "LEVEL"] => config.logging.level = value.to_string(),
            ["LOGGING", "FORMAT"] => {
                config.logging.format = match value.to_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "pretty" => LogFormat::Pretty,
                    _ => {
                        return Err(ConfigError::env_override(
                            key,
                            "expected 'json' or 'pretty'",
                        ))
                    }
                };
            }
            ["LOGGING", "FALLBACK_TO_CONSOLE"] => {
                config.logging.fallback_to_console = bool_var(key, value)?;
            }
            ["LOGGING", "REDACT_KEYS"] => {
                config.logging.redact_keys = value
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect();
            }

            ["ANALYTICS", "ENABLED"] => config.analytics.enabled = bool_var(key, value)?,
            ["ANALYTICS", "SAMPLE_RATE"] => config.analytics.sample_rate = num_var(key, value)?,
            ["ANALYTICS", "BUFFER_SIZE"] => config.analytics.buffer_size = num_var(key, value)?,
            ["ANALYTICS", "FLUSH_INTERVAL_MS"] => {
                config.analytics.flush_interval_ms = num_var(key, value)?;
            }

            ["PERFORMANCE", "ENABLED"] => config.performance.enabled = bool_var(key, value)?,
            ["PERFORMANCE", "WARNING_THRESHOLD_MS"] => {
                config.performance.warning_threshold_ms = num_var(key, value)?;
            }
            ["PERFORMANCE", "CRITICAL_THRESHOLD_MS"] => {
                config.performance.critical_threshold_ms = num_var(key, value)?;
            }
            ["PERFORMANCE", "SAMPLING", "ENABLED"] => {
                config.performance.sampling.enabled = bool_var(key, value)?;
            }
            ["PERFORMANCE", "SAMPLING", "RATE"] => {
                config.performance.sampling.rate = num_var(key, value)?;
            }
            ["PERFORMANCE", "RETENTION_HOURS"] => {
                config.performance.retention_hours = num_var(key, value)?;
            }
            ["PERFORMANCE", "CLEANUP_INTERVAL_SECS"] => {
                config.performance.cleanup_interval_secs = num_var(key, value)?;
            }

            ["RETRY", "MAX_RETRIES"] => config.retry.max_retries = num_var(key, value)?,
            ["RETRY", "RETRY_DELAY_MS"] => config.retry.retry_delay_ms = num_var(key, value)?,
            ["RETRY", "TIMEOUT_MS"] => config.retry.timeout_ms = num_var(key, value)?,

            // Unknown keys are ignored
            _ => {}
        }

        Ok(())
    }
}

fn bool_var(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| ConfigError::env_override(key, "expected boolean"))
}

fn num_var<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::env_override(key, "expected number"))
}

/// Parse a boolean from a string.
fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
