//! Pipeline metrics through the `metrics` facade.
//!
//! No exporter is installed here. Hosts attach their own recorder and these
//! calls become no-ops when none is present.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tessera_executions_total` | Counter | `operation`, `outcome` | Finished executions |
//! | `tessera_execution_duration_seconds` | Histogram | `operation` | Execution latency |
//! | `tessera_in_flight_executions` | Gauge | - | Executions in progress |
//! | `tessera_errors_total` | Counter | `type`, `status` | Errors caught by the error handler |
//! | `tessera_performance_status_total` | Counter | `status` | Performance classifications |
//! | `tessera_analytics_flushes_total` | Counter | `result` | Analytics flush attempts |

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Finished executions counter.
pub const EXECUTIONS_TOTAL: &str = "tessera_executions_total";
/// Execution latency histogram.
pub const EXECUTION_DURATION_SECONDS: &str = "tessera_execution_duration_seconds";
/// In-flight executions gauge.
pub const IN_FLIGHT_EXECUTIONS: &str = "tessera_in_flight_executions";
/// Caught errors counter.
pub const ERRORS_TOTAL: &str = "tessera_errors_total";
/// Performance classification counter.
pub const PERFORMANCE_STATUS_TOTAL: &str = "tessera_performance_status_total";
/// Analytics flush counter.
pub const ANALYTICS_FLUSHES_TOTAL: &str = "tessera_analytics_flushes_total";

/// Registers descriptions for all pipeline metrics with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(EXECUTIONS_TOTAL, "Total number of pipeline executions by outcome");
    describe_histogram!(
        EXECUTION_DURATION_SECONDS,
        "Pipeline execution duration in seconds"
    );
    describe_gauge!(
        IN_FLIGHT_EXECUTIONS,
        "Number of pipeline executions currently running"
    );
    describe_counter!(ERRORS_TOTAL, "Errors handled by the error-handling stage");
    describe_counter!(
        PERFORMANCE_STATUS_TOTAL,
        "Executions classified as healthy, warning or critical"
    );
    describe_counter!(ANALYTICS_FLUSHES_TOTAL, "Analytics batch flushes by result");
}

/// Records a finished execution.
///
/// `outcome` is `completed`, `handled` or `failed`.
pub fn record_execution(operation: &str, outcome: &str, duration: Duration) {
    counter!(
        EXECUTIONS_TOTAL,
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        EXECUTION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Records an error caught by the error-handling stage.
pub fn record_error(error_type: &str, status_code: u16) {
    counter!(
        ERRORS_TOTAL,
        "type" => error_type.to_string(),
        "status" => status_code.to_string()
    )
    .increment(1);
}

/// Records a performance classification.
pub fn record_performance_status(status: &str) {
    counter!(PERFORMANCE_STATUS_TOTAL, "status" => status.to_string()).increment(1);
}

/// Records an analytics flush attempt.
pub fn record_analytics_flush(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!(ANALYTICS_FLUSHES_TOTAL, "result" => result).increment(1);
}

/// Guard that decrements the in-flight gauge on drop.
///
/// The gauge is restored even when the execution future is cancelled.
pub struct InFlightGuard {
    _private: (),
}

impl InFlightGuard {
    /// Creates a new guard and increments the in-flight gauge.
    #[must_use]
    pub fn new() -> Self {
        gauge!(IN_FLIGHT_EXECUTIONS).increment(1.0);
        Self { _private: () }
    }
}

impl Default for InFlightGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        gauge!(IN_FLIGHT_EXECUTIONS).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_without_recorder() {
        describe_metrics();
        record_execution("fetchQuestions", "completed", Duration::from_millis(50));
        record_error("ValidationError", 400);
        record_performance_status("healthy");
        record_analytics_flush(false);
    }

    #[test]
    fn test_in_flight_guard() {
        let guard = InFlightGuard::new();
        drop(guard);
    }

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            EXECUTIONS_TOTAL,
            EXECUTION_DURATION_SECONDS,
            IN_FLIGHT_EXECUTIONS,
            ERRORS_TOTAL,
            PERFORMANCE_STATUS_TOTAL,
            ANALYTICS_FLUSHES_TOTAL,
        ] {
            assert!(name.starts_with("tessera_"));
        }
    }
}
