//! Built-in instrumentation stages.
//!
//! | Stage | Default priority | Responsibility |
//! |-------|------------------|----------------|
//! | [`ErrorHandlingMiddleware`] | 100 | Taxonomy mapping and safe responses |
//! | [`LoggingMiddleware`] | 90 | Redacted request start/complete/error records |
//! | [`PerformanceMiddleware`] | 80 | Timing, memory and threshold warnings |
//! | [`AnalyticsMiddleware`] | 70 | Sampled, buffered event capture |

pub mod analytics;
pub mod error_handling;
pub mod logging;
pub mod performance;

pub use analytics::{AnalyticsEvent, AnalyticsMetrics, AnalyticsMiddleware, EventStatus};
pub use error_handling::{ErrorHandlingMiddleware, ErrorMetrics};
pub use logging::{LogEntry, LogEvent, LoggingMiddleware};
pub use performance::{
    AggregateMetrics, MemorySource, MemoryReadError, PerformanceMiddleware, PerformanceRecord,
    PerformanceStatus, SysinfoMemorySource,
};

use serde::Serialize;
use tessera_core::MiddlewareError;

/// Short description of a failure, attached to log entries and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    /// Display form of the error.
    pub message: String,
    /// Error type name.
    #[serde(rename = "type")]
    pub error_type: String,
}

impl From<&MiddlewareError> for ErrorSummary {
    fn from(error: &MiddlewareError) -> Self {
        Self {
            message: error.to_string(),
            error_type: error.type_name().to_string(),
        }
    }
}
