//! Retry layer wrapped around chain attempts.
//!
//! [`RetryExecutor`] is independent of the chain itself: anything that
//! implements [`Attempt`] can be retried. Attempts run up to
//! `max_retries` times with linear backoff `retry_delay * attempt`.

use std::time::Duration;

use chrono::Utc;
use tessera_config::RetryConfig;
use tessera_core::{ExecutionContext, ExecutionMetadata};
use tracing::{debug, warn};

use crate::middleware::{BoxFuture, ErrorHandler, MiddlewareResult, Outcome};

/// Retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    /// Base backoff, multiplied by the attempt number.
    pub retry_delay: Duration,
    /// Timeout applied to each phase of an attempt.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    /// Backoff before the attempt following `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            attempt_timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

/// One retryable unit of work.
pub trait Attempt: Send + Sync {
    /// Runs the attempt against `ctx`.
    fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, MiddlewareResult>;
}

/// Drives an [`Attempt`] under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates an executor for `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `attempt` until it succeeds, is handled, or attempts run out.
    ///
    /// With an error handler every failure is converted into a structured
    /// response on the spot and the loop ends. Without one, retryable
    /// failures are retried and the last error is returned.
    ///
    /// # Errors
    ///
    /// Returns the last error when no handler is present and either the
    /// error is not retryable or every attempt failed.
    pub async fn run(
        &self,
        ctx: &mut ExecutionContext,
        attempt: &dyn Attempt,
        handler: Option<&dyn ErrorHandler>,
    ) -> MiddlewareResult {
        let max_retries = self.policy.max_retries.max(1);
        let started_at = Utc::now();
        let mut current = 1;

        loop {
            ctx.execution_metadata = Some(ExecutionMetadata {
                attempt: current,
                max_retries,
                started_at,
            });

            let error = match attempt.run(ctx).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => error,
            };

            if let Some(handler) = handler {
                debug!(
                    operation = ctx.operation(),
                    attempt = current,
                    error = %error,
                    "failure routed to error handler"
                );
                return Ok(Outcome::Handled(handler.handle_error(&error, ctx)));
            }

            if !error.is_retryable() || current >= max_retries {
                return Err(error);
            }

            let delay = self.policy.backoff(current);
            warn!(
                operation = ctx.operation(),
                attempt = current,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            current += 1;
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tessera_core::{
        ErrorCategory, ErrorEnvelope, ErrorResponse, MiddlewareError, OperationError,
    };

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl Flaky {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl Attempt for Flaky {
        fn run<'a>(&'a self, _ctx: &'a mut ExecutionContext) -> BoxFuture<'a, MiddlewareResult> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
                if n <= self.fail_first {
                    Err(MiddlewareError::from(OperationError::database(format!("failure {n}"))))
                } else {
                    Ok(Outcome::Completed(json!(n)))
                }
            })
        }
    }

    struct AlwaysInvalid;

    impl Attempt for AlwaysInvalid {
        fn run<'a>(&'a self, _ctx: &'a mut ExecutionContext) -> BoxFuture<'a, MiddlewareResult> {
            Box::pin(async { Err(MiddlewareError::invalid_context("operation is required")) })
        }
    }

    struct StaticHandler;

    impl ErrorHandler for StaticHandler {
        fn handle_error(&self, error: &MiddlewareError, ctx: &ExecutionContext) -> ErrorResponse {
            ErrorResponse::new(
                ErrorEnvelope {
                    code: 500,
                    message: error.to_string(),
                    error_type: error.type_name().to_string(),
                    category: ErrorCategory::Unknown,
                    details: None,
                    stack: None,
                },
                ctx.request_id(),
            )
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_delay, Duration::from_millis(1000));
        assert_eq!(policy.attempt_timeout, Duration::from_millis(5000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(RetryPolicy::none().max_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let attempt = Flaky::new(2);
        let mut ctx = ExecutionContext::new("op");

        let start = tokio::time::Instant::now();
        let outcome = RetryExecutor::new(policy(3))
            .run(&mut ctx, &attempt, None)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Completed(json!(3)));
        assert_eq!(attempt.calls(), 3);
        // 100ms after attempt 1, 200ms after attempt 2
        assert!(start.elapsed() >= Duration::from_millis(300));

        let meta = ctx.execution_metadata.unwrap();
        assert_eq!(meta.attempt, 3);
        assert_eq!(meta.max_retries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let attempt = Flaky::new(u32::MAX);
        let mut ctx = ExecutionContext::new("op");

        let err = RetryExecutor::new(policy(2))
            .run(&mut ctx, &attempt, None)
            .await
            .unwrap_err();

        assert_eq!(attempt.calls(), 2);
        assert_eq!(err.to_string(), "failure 2");
    }

    #[tokio::test]
    async fn test_invalid_context_is_not_retried() {
        let mut ctx = ExecutionContext::new("op");
        let err = RetryExecutor::new(policy(5))
            .run(&mut ctx, &AlwaysInvalid, None)
            .await
            .unwrap_err();

        assert!(matches!(err, MiddlewareError::InvalidContext { .. }));
        assert_eq!(ctx.execution_metadata.unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn test_handler_ends_loop() {
        let attempt = Flaky::new(u32::MAX);
        let mut ctx = ExecutionContext::new("op");

        let outcome = RetryExecutor::new(policy(3))
            .run(&mut ctx, &attempt, Some(&StaticHandler))
            .await
            .unwrap();

        assert_eq!(attempt.calls(), 1);
        let response = outcome.as_handled().unwrap();
        assert!(!response.success);
        assert_eq!(response.error.error_type, "DatabaseError");
    }
}
