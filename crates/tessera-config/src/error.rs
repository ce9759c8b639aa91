//! Errors raised while loading and validating a [`PipelineConfig`](crate::PipelineConfig).

use std::path::PathBuf;
use thiserror::Error;

/// Why a configuration could not be produced.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required file does not exist.
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// Missing path.
        path: PathBuf,
    },

    /// A file exists but could not be read.
    #[error("cannot read {path}")]
    Read {
        /// File being read.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// TOML input did not match the schema.
    #[error("invalid TOML pipeline configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON input did not match the schema.
    #[error("invalid JSON pipeline configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// Input was neither TOML nor JSON.
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    /// A field holds a value outside its allowed range.
    #[error("{field}: {reason}")]
    InvalidValue {
        /// Dotted field path, e.g. `analytics.sample_rate`.
        field: String,
        /// Allowed range or shape.
        reason: String,
    },

    /// An environment override could not be parsed.
    #[error("environment override {var} rejected: {reason}")]
    EnvOverride {
        /// Variable name.
        var: String,
        /// Parse failure.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    pub(crate) fn read_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    /// Creates an out-of-range error for `field`.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn env_override(var: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EnvOverride {
            var: var.into(),
            reason: reason.into(),
        }
    }

    /// Field path for `InvalidValue` errors.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::InvalidValue { field, .. } => Some(field),
            _ => None,
        }
    }
}
