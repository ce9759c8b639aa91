//! Error taxonomy and safe responses.
//!
//! Failures from the rest of the chain are mapped to a status code and a
//! category, counted once, and returned as an [`ErrorResponse`] instead of
//! being propagated. In production the messages of 5xx errors are replaced
//! and the error chain is left out.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tessera_core::{
    ErrorCategory, ErrorEnvelope, ErrorResponse, ExecutionContext, MiddlewareError,
};
use tessera_telemetry::metrics::record_error;
use tracing::error;

use crate::middleware::{
    BoxFuture, ErrorHandler, Middleware, MiddlewareBase, MiddlewareResult, Next, Outcome,
};

/// Default priority. Runs outermost so it sees every failure.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Status used for unmapped error types.
pub const DEFAULT_STATUS: u16 = 500;

const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred";

const STATUS_CODES: &[(&str, u16)] = &[
    ("ValidationError", 400),
    ("AuthenticationError", 401),
    ("AuthorizationError", 403),
    ("NotFoundError", 404),
    ("ConflictError", 409),
    ("RateLimitError", 429),
    ("DatabaseError", 503),
];

/// Status code for an error type name.
pub fn status_code_for(error_type: &str) -> u16 {
    STATUS_CODES
        .iter()
        .find(|(name, _)| *name == error_type)
        .map_or(DEFAULT_STATUS, |(_, code)| *code)
}

/// Coarse category for an error.
pub fn categorize(error: &MiddlewareError) -> ErrorCategory {
    let message = error.to_string().to_ascii_lowercase();
    match error.type_name() {
        "SyntaxError" => ErrorCategory::Syntax,
        _ if message.contains("econnrefused") || message.contains("connection refused") => {
            ErrorCategory::ConnectionRefused
        }
        "ValidationError" => ErrorCategory::Validation,
        "AuthenticationError" | "AuthorizationError" => ErrorCategory::Auth,
        _ => ErrorCategory::Unknown,
    }
}

/// All-time error counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorMetrics {
    /// Errors caught.
    pub total_errors: u64,
    /// Counts by error type name.
    pub by_type: HashMap<String, u64>,
    /// Counts by request path.
    pub by_path: HashMap<String, u64>,
    /// Counts by resulting status code.
    pub by_status_code: HashMap<u16, u64>,
}

/// Error-handling stage.
pub struct ErrorHandlingMiddleware {
    base: MiddlewareBase,
    metrics: Mutex<ErrorMetrics>,
}

impl ErrorHandlingMiddleware {
    /// Creates the stage with the default priority.
    pub fn new() -> Self {
        Self::with_priority(DEFAULT_PRIORITY)
    }

    /// Creates the stage with a custom priority.
    pub fn with_priority(priority: i32) -> Self {
        Self {
            base: MiddlewareBase::new("error_handling", priority),
            metrics: Mutex::new(ErrorMetrics::default()),
        }
    }

    /// Snapshot of the counters.
    pub fn metrics(&self) -> ErrorMetrics {
        self.metrics.lock().clone()
    }

    fn count(&self, error_type: &str, path: &str, status: u16) {
        let mut metrics = self.metrics.lock();
        metrics.total_errors += 1;
        *metrics.by_type.entry(error_type.to_string()).or_default() += 1;
        *metrics.by_path.entry(path.to_string()).or_default() += 1;
        *metrics.by_status_code.entry(status).or_default() += 1;
    }
}

impl Default for ErrorHandlingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler for ErrorHandlingMiddleware {
    fn handle_error(&self, err: &MiddlewareError, ctx: &ExecutionContext) -> ErrorResponse {
        let error_type = err.type_name();
        let status = status_code_for(error_type);
        let production = ctx.environment().is_production();

        self.count(error_type, ctx.path(), status);
        record_error(error_type, status);

        let request_id = ctx.request_id().map(|id| id.to_string());
        error!(
            request_id = request_id.as_deref().unwrap_or("-"),
            operation = ctx.operation(),
            error_type,
            status,
            error = %err,
            "execution failed"
        );

        let message = if production && status >= 500 {
            INTERNAL_ERROR_MESSAGE.to_string()
        } else {
            err.to_string()
        };

        let envelope = ErrorEnvelope {
            code: status,
            message,
            error_type: error_type.to_string(),
            category: categorize(err),
            details: err.details().cloned(),
            stack: (!production).then(|| err.chain()),
        };

        ErrorResponse::new(envelope, ctx.request_id())
    }
}

impl Middleware for ErrorHandlingMiddleware {
    fn base(&self) -> &MiddlewareBase {
        &self.base
    }

    fn as_error_handler(&self) -> Option<&dyn ErrorHandler> {
        Some(self)
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            match next.run(ctx).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => Ok(Outcome::Handled(self.handle_error(&e, ctx))),
            }
        })
    }
}
