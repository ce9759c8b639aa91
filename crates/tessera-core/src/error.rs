//! Error types for the pipeline.
//!
//! [`MiddlewareError`] is what every stage and the manager return.
//! Failures of the wrapped unit of work are [`OperationError`]s tagged with an
//! [`ErrorKind`]; the error-handling stage turns them into an
//! [`ErrorResponse`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::context::RequestId;

/// Kind of an operation failure.
///
/// The type name doubles as the key of the status-code table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid input.
    Validation,
    /// Missing or invalid credentials.
    Authentication,
    /// Permission denied.
    Authorization,
    /// Resource not found.
    NotFound,
    /// Concurrent modification or duplicate resource.
    Conflict,
    /// Rate limit exceeded.
    RateLimit,
    /// Storage backend failure.
    Database,
    /// Malformed payload, such as unparsable JSON.
    Syntax,
    /// Any other failure, named by the caller.
    Other(String),
}

impl ErrorKind {
    /// Type name reported in envelopes and metrics.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Validation => "ValidationError",
            Self::Authentication => "AuthenticationError",
            Self::Authorization => "AuthorizationError",
            Self::NotFound => "NotFoundError",
            Self::Conflict => "ConflictError",
            Self::RateLimit => "RateLimitError",
            Self::Database => "DatabaseError",
            Self::Syntax => "SyntaxError",
            Self::Other(name) => name,
        }
    }
}

/// Failure of the wrapped unit of work.
///
/// # Example
///
/// ```
/// use tessera_core::{ErrorKind, OperationError};
///
/// let err = OperationError::not_found("question 42 does not exist");
/// assert_eq!(err.kind(), &ErrorKind::NotFound);
/// assert_eq!(err.type_name(), "NotFoundError");
/// ```
#[derive(Error, Debug)]
#[error("{message}")]
pub struct OperationError {
    kind: ErrorKind,
    message: String,
    code: Option<String>,
    details: Option<Value>,
    #[source]
    source: Option<anyhow::Error>,
}

impl OperationError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            details: None,
            source: None,
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    /// Creates an authorization error.
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Creates a rate limit error.
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    /// Creates a syntax error.
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    /// Creates an error with a caller-defined type name.
    pub fn other(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other(type_name.into()), message)
    }

    /// Attaches a machine-readable code such as `ECONNREFUSED`.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attaches the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Error kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Type name of the kind.
    pub fn type_name(&self) -> &str {
        self.kind.type_name()
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Machine-readable code, if any.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Structured details, if any.
    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }
}

/// Errors produced by stages, the manager and the retry layer.
#[derive(Error, Debug)]
pub enum MiddlewareError {
    /// The execution context failed validation. Never retried.
    #[error("invalid execution context: {message}")]
    InvalidContext {
        /// What is wrong with the context.
        message: String,
    },

    /// A middleware with this name is already registered.
    #[error("middleware '{0}' is already registered")]
    DuplicateName(String),

    /// A phase of an attempt exceeded its timeout.
    #[error("{phase} phase timed out after {}ms", .elapsed.as_millis())]
    Timeout {
        /// Phase that timed out.
        phase: &'static str,
        /// Configured timeout.
        elapsed: Duration,
    },

    /// The wrapped operation failed.
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// A middleware failed to initialize.
    #[error("failed to initialize middleware '{name}': {message}")]
    Initialization {
        /// Middleware name.
        name: String,
        /// Failure description.
        message: String,
    },

    /// A pre- or post-process hook rejected the execution.
    #[error("hook failed: {0}")]
    Hook(String),
}

impl MiddlewareError {
    /// Creates an invalid context error.
    pub fn invalid_context(message: impl Into<String>) -> Self {
        Self::InvalidContext {
            message: message.into(),
        }
    }

    /// Creates a timeout error for a phase.
    pub fn timeout(phase: &'static str, elapsed: Duration) -> Self {
        Self::Timeout { phase, elapsed }
    }

    /// Creates an initialization error.
    pub fn initialization(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Initialization {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Type name used for status mapping and counters.
    pub fn type_name(&self) -> &str {
        match self {
            Self::InvalidContext { .. } => "ValidationError",
            Self::DuplicateName(_) => "RegistrationError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Operation(e) => e.type_name(),
            Self::Initialization { .. } => "InitializationError",
            Self::Hook(_) => "HookError",
        }
    }

    /// Machine-readable code, if the operation supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Operation(e) => e.code(),
            _ => None,
        }
    }

    /// Structured details, if the operation supplied them.
    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::Operation(e) => e.details(),
            _ => None,
        }
    }

    /// Whether the retry layer may run another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidContext { .. } | Self::DuplicateName(_) | Self::Initialization { .. }
        )
    }

    /// The error followed by its chain of sources, one per line.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

/// Coarse classification of an error for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed payload.
    Syntax,
    /// Downstream connection refused.
    ConnectionRefused,
    /// Invalid input.
    Validation,
    /// Authentication or authorization failure.
    Auth,
    /// Anything else.
    Unknown,
}

/// Error section of an [`ErrorResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Status code.
    pub code: u16,
    /// Message, generic for 5xx errors in production.
    pub message: String,
    /// Error type name.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Category.
    pub category: ErrorCategory,
    /// Structured details from the operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Error chain, omitted in production.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Structured failure returned in place of an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always `false`.
    pub success: bool,
    /// Error details.
    pub error: ErrorEnvelope,
    /// Correlation id of the failed execution.
    pub request_id: Option<RequestId>,
    /// When the response was produced.
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    /// Wraps an envelope, stamping the current time.
    pub fn new(error: ErrorEnvelope, request_id: Option<RequestId>) -> Self {
        Self {
            success: false,
            error,
            request_id,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_type_names() {
        assert_eq!(ErrorKind::Validation.type_name(), "ValidationError");
        assert_eq!(ErrorKind::RateLimit.type_name(), "RateLimitError");
        assert_eq!(ErrorKind::Database.type_name(), "DatabaseError");
        assert_eq!(ErrorKind::Other("PaymentError".into()).type_name(), "PaymentError");
    }

    #[test]
    fn test_operation_error_builders() {
        let err = OperationError::database("connection pool exhausted")
            .with_code("ECONNREFUSED")
            .with_details(json!({"pool": "primary"}));

        assert_eq!(err.to_string(), "connection pool exhausted");
        assert_eq!(err.code(), Some("ECONNREFUSED"));
        assert_eq!(err.details().unwrap()["pool"], "primary");
    }

    #[test]
    fn test_middleware_error_from_operation() {
        let err: MiddlewareError = OperationError::conflict("version mismatch").into();
        assert_eq!(err.type_name(), "ConflictError");
        assert_eq!(err.to_string(), "version mismatch");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_context_not_retryable() {
        let err = MiddlewareError::invalid_context("operation is required");
        assert_eq!(err.type_name(), "ValidationError");
        assert!(!err.is_retryable());
        assert!(!MiddlewareError::DuplicateName("logging".into()).is_retryable());
    }

    #[test]
    fn test_timeout_display() {
        let err = MiddlewareError::timeout("main", Duration::from_millis(5000));
        assert_eq!(err.to_string(), "main phase timed out after 5000ms");
        assert_eq!(err.type_name(), "TimeoutError");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: MiddlewareError = OperationError::database("query failed")
            .with_source(io)
            .into();

        let chain = err.chain();
        assert!(chain.starts_with("query failed"));
        assert!(chain.contains("caused by: refused"));
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse::new(
            ErrorEnvelope {
                code: 400,
                message: "bad input".into(),
                error_type: "ValidationError".into(),
                category: ErrorCategory::Validation,
                details: None,
                stack: None,
            },
            None,
        );

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["type"], "ValidationError");
        assert_eq!(json["error"]["category"], "validation");
        assert!(json["error"].get("stack").is_none());
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::ConnectionRefused).unwrap();
        assert_eq!(json, r#""connection_refused""#);
    }
}
