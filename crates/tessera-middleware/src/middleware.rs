//! Core middleware trait and types.
//!
//! Every stage implements [`Middleware`]. The manager walks a priority-sorted
//! slice of stages; each stage receives a [`Next`] continuation that runs the
//! remainder of the slice and, at the end, the terminal operation.
//!
//! # Example
//!
//! ```ignore
//! use tessera_middleware::{BoxFuture, Middleware, MiddlewareBase, MiddlewareResult, Next};
//! use tessera_core::ExecutionContext;
//!
//! struct Audit {
//!     base: MiddlewareBase,
//! }
//!
//! impl Middleware for Audit {
//!     fn base(&self) -> &MiddlewareBase {
//!         &self.base
//!     }
//!
//!     fn process<'a>(
//!         &'a self,
//!         ctx: &'a mut ExecutionContext,
//!         next: Next<'a>,
//!     ) -> BoxFuture<'a, MiddlewareResult> {
//!         Box::pin(async move {
//!             tracing::info!(operation = ctx.operation(), "audit");
//!             next.run(ctx).await
//!         })
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tessera_core::{ErrorResponse, ExecutionContext, MiddlewareError};
use tokio::time::Instant;
use tracing::{debug, error};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a chain walk that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    /// The operation ran to completion.
    Completed(Value),
    /// A failure was converted into a structured response.
    Handled(ErrorResponse),
}

impl Outcome {
    /// Returns `true` for [`Outcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// The structured response, if the failure was handled.
    pub fn as_handled(&self) -> Option<&ErrorResponse> {
        match self {
            Self::Handled(response) => Some(response),
            Self::Completed(_) => None,
        }
    }

    /// The completed value, if any.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Handled(_) => None,
        }
    }
}

/// Result type returned by stages and the manager.
pub type MiddlewareResult = Result<Outcome, MiddlewareError>;

/// Terminal unit of work run at the end of the chain.
///
/// `'o` bounds what the operation may borrow, so closures over locals work.
pub type Operation<'o> = dyn for<'c> Fn(&'c mut ExecutionContext) -> BoxFuture<'c, Result<Value, MiddlewareError>>
    + Send
    + Sync
    + 'o;

/// Boxes a closure as an [`Operation`].
///
/// ```ignore
/// let op = boxed_operation(|ctx| Box::pin(async move { Ok(json!(ctx.operation())) }));
/// ```
pub fn boxed_operation<F>(operation: F) -> Box<Operation<'static>>
where
    F: for<'c> Fn(&'c mut ExecutionContext) -> BoxFuture<'c, Result<Value, MiddlewareError>>
        + Send
        + Sync
        + 'static,
{
    Box::new(operation)
}

/// A type-erased middleware shared between registries.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// State common to every middleware: identity, priority and the enabled flag.
#[derive(Debug)]
pub struct MiddlewareBase {
    name: String,
    priority: i32,
    enabled: AtomicBool,
    track_performance: bool,
}

impl MiddlewareBase {
    /// Creates an enabled base.
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            enabled: AtomicBool::new(true),
            track_performance: false,
        }
    }

    /// Logs each execution's duration at debug level.
    #[must_use]
    pub fn with_track_performance(mut self, track: bool) -> Self {
        self.track_performance = track;
        self
    }

    /// Sets the initial enabled state.
    #[must_use]
    pub fn with_enabled(self, enabled: bool) -> Self {
        self.enabled.store(enabled, Ordering::Relaxed);
        self
    }

    /// Unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority; higher runs first.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Current enabled state.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Toggles the enabled state. Takes effect on the next execution.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether duration logging is on.
    pub fn track_performance(&self) -> bool {
        self.track_performance
    }
}

/// A stage of the instrumentation chain.
///
/// # Invariants
///
/// - `process` must call `next.run()` at most once
/// - Errors from downstream are propagated unless the stage is an error
///   handler
/// - `request_id` and `timestamp` on the context are never reassigned
pub trait Middleware: Send + Sync + 'static {
    /// Shared name, priority and enabled state.
    fn base(&self) -> &MiddlewareBase;

    /// Stage-specific behaviour wrapped around `next`.
    fn process<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult>;

    /// One-time asynchronous setup, run lazily by the manager.
    fn initialize(&self) -> BoxFuture<'_, Result<(), MiddlewareError>> {
        Box::pin(async { Ok(()) })
    }

    /// Returns `Some` when this stage can turn failures into responses.
    fn as_error_handler(&self) -> Option<&dyn ErrorHandler> {
        None
    }

    /// Unique name.
    fn name(&self) -> &str {
        self.base().name()
    }

    /// Priority; higher runs first.
    fn priority(&self) -> i32 {
        self.base().priority()
    }

    /// Current enabled state.
    fn is_enabled(&self) -> bool {
        self.base().is_enabled()
    }

    /// Enables the stage.
    fn enable(&self) {
        self.base().set_enabled(true);
    }

    /// Disables the stage. Disabled stages pass straight through.
    fn disable(&self) {
        self.base().set_enabled(false);
    }

    /// Runs the stage.
    ///
    /// Disabled stages call `next` with no side effects. Enabled stages
    /// validate the context, stamp its timestamp, delegate to
    /// [`process`](Middleware::process) and log any failure before
    /// propagating it.
    fn execute<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            if !self.is_enabled() {
                return next.run(ctx).await;
            }

            if let Err(e) = ctx.validate() {
                error!(middleware = self.name(), error = %e, "middleware execution failed");
                return Err(e);
            }
            ctx.mark_started();

            let started = Instant::now();
            let result = self.process(ctx, next).await;

            if self.base().track_performance() {
                debug!(
                    middleware = self.name(),
                    operation = ctx.operation(),
                    duration_ms = started.elapsed().as_secs_f64() * 1000.0,
                    "middleware executed"
                );
            }

            if let Err(e) = &result {
                error!(middleware = self.name(), error = %e, "middleware execution failed");
            }

            result
        })
    }
}

/// A stage that converts failures into structured responses.
pub trait ErrorHandler: Send + Sync {
    /// Builds the response for `error` and records it.
    fn handle_error(&self, error: &MiddlewareError, ctx: &ExecutionContext) -> ErrorResponse;
}

/// Continuation that runs the rest of the chain.
///
/// Walks a registry snapshot by index. Consumed by [`run`](Next::run), so it
/// can be invoked at most once.
pub struct Next<'a> {
    stages: &'a [BoxedMiddleware],
    index: usize,
    operation: Option<&'a Operation<'a>>,
}

impl<'a> Next<'a> {
    /// Creates a continuation over `stages` ending in `operation`.
    pub fn new(stages: &'a [BoxedMiddleware], operation: Option<&'a Operation<'a>>) -> Self {
        Self {
            stages,
            index: 0,
            operation,
        }
    }

    /// Continuation with no stages left.
    pub fn terminal(operation: Option<&'a Operation<'a>>) -> Self {
        Self::new(&[], operation)
    }

    /// Stages still to run.
    pub fn remaining(&self) -> usize {
        self.stages.len().saturating_sub(self.index)
    }

    /// Runs the next enabled stage, or the operation once the stages are
    /// exhausted.
    ///
    /// Disabled stages are stepped over in place. Without an operation the
    /// chain resolves to `Completed(Null)`.
    pub async fn run(mut self, ctx: &mut ExecutionContext) -> MiddlewareResult {
        let stages = self.stages;
        while let Some(stage) = stages.get(self.index) {
            self.index += 1;
            if stage.is_enabled() {
                return stage.execute(ctx, self).await;
            }
        }

        match self.operation {
            Some(operation) => operation(ctx).await.map(Outcome::Completed),
            None => Ok(Outcome::Completed(Value::Null)),
        }
    }
}

/// A middleware built from a closure.
///
/// # Example
///
/// ```ignore
/// let stage = FnMiddleware::new("timing", 10, |ctx, next| {
///     Box::pin(async move {
///         let start = tokio::time::Instant::now();
///         let result = next.run(ctx).await;
///         tracing::info!(elapsed = ?start.elapsed(), "done");
///         result
///     })
/// });
/// ```
pub struct FnMiddleware<F> {
    base: MiddlewareBase,
    func: F,
}

impl<F> FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut ExecutionContext, Next<'a>) -> BoxFuture<'a, MiddlewareResult>
        + Send
        + Sync
        + 'static,
{
    /// Creates a new closure-based middleware.
    pub fn new(name: impl Into<String>, priority: i32, func: F) -> Self {
        Self {
            base: MiddlewareBase::new(name, priority),
            func,
        }
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut ExecutionContext, Next<'a>) -> BoxFuture<'a, MiddlewareResult>
        + Send
        + Sync
        + 'static,
{
    fn base(&self) -> &MiddlewareBase {
        &self.base
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        (self.func)(ctx, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use tessera_core::OperationError;

    fn recording(
        name: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
    ) -> BoxedMiddleware {
        Arc::new(FnMiddleware::new(name, priority, move |ctx, next| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push(format!("{name}:before"));
                let result = next.run(ctx).await;
                log.lock().push(format!("{name}:after"));
                result
            })
        }))
    }

    fn ok_operation() -> Box<Operation<'static>> {
        boxed_operation(|_ctx| Box::pin(async { Ok(json!({"ok": true})) }))
    }

    #[tokio::test]
    async fn test_terminal_without_operation_is_null() {
        let mut ctx = ExecutionContext::new("op");
        let outcome = Next::terminal(None).run(&mut ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Completed(Value::Null));
    }

    #[tokio::test]
    async fn test_chain_runs_in_slice_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![recording("a", 2, log.clone()), recording("b", 1, log.clone())];
        let op = ok_operation();

        let mut ctx = ExecutionContext::new("op");
        let outcome = Next::new(&stages, Some(op.as_ref())).run(&mut ctx).await.unwrap();

        assert_eq!(outcome.into_value(), Some(json!({"ok": true})));
        assert_eq!(
            *log.lock(),
            vec!["a:before", "b:before", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn test_disabled_stage_is_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![recording("a", 2, log.clone()), recording("b", 1, log.clone())];
        stages[0].disable();
        assert!(!stages[0].is_enabled());

        let mut ctx = ExecutionContext::new("op");
        let outcome = Next::new(&stages, None).run(&mut ctx).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(*log.lock(), vec!["b:before", "b:after"]);

        stages[0].enable();
        assert!(stages[0].is_enabled());
    }

    #[tokio::test]
    async fn test_walk_steps_over_disabled_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<_> = (0..64)
            .map(|i| recording(if i == 63 { "last" } else { "off" }, 0, log.clone()))
            .collect();
        for stage in &stages[..63] {
            stage.disable();
        }

        let next = Next::new(&stages, None);
        assert_eq!(next.remaining(), 64);

        let mut ctx = ExecutionContext::new("op");
        next.run(&mut ctx).await.unwrap();
        assert_eq!(*log.lock(), vec!["last:before", "last:after"]);
    }

    #[tokio::test]
    async fn test_operation_may_borrow_caller_state() {
        fn operation<F>(f: F) -> F
        where
            F: for<'c> Fn(&'c mut ExecutionContext) -> BoxFuture<'c, Result<Value, MiddlewareError>>,
        {
            f
        }

        let prefix = String::from("answer-");
        let op = operation(|ctx| {
            let id = format!("{prefix}{}", ctx.operation());
            Box::pin(async move { Ok(json!(id)) })
        });

        let mut ctx = ExecutionContext::new("42");
        let outcome = Next::terminal(Some(&op)).run(&mut ctx).await.unwrap();
        assert_eq!(outcome.into_value(), Some(json!("answer-42")));
    }

    #[tokio::test]
    async fn test_execute_validates_context() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![recording("a", 1, log.clone())];

        let mut ctx = ExecutionContext::new("");
        let err = Next::new(&stages, None).run(&mut ctx).await.unwrap_err();

        assert!(matches!(err, MiddlewareError::InvalidContext { .. }));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_execute_stamps_timestamp() {
        let stages = vec![recording("a", 1, Arc::new(Mutex::new(Vec::new())))];
        let mut ctx = ExecutionContext::new("op");
        assert!(ctx.timestamp().is_none());

        Next::new(&stages, None).run(&mut ctx).await.unwrap();
        assert!(ctx.timestamp().is_some());
    }

    #[tokio::test]
    async fn test_errors_propagate_through_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![recording("a", 2, log.clone()), recording("b", 1, log.clone())];
        let op = boxed_operation(|_ctx| {
            Box::pin(async { Err(MiddlewareError::from(OperationError::database("down"))) })
        });

        let mut ctx = ExecutionContext::new("op");
        let err = Next::new(&stages, Some(op.as_ref()))
            .run(&mut ctx)
            .await
            .unwrap_err();

        assert_eq!(err.type_name(), "DatabaseError");
        assert_eq!(
            *log.lock(),
            vec!["a:before", "b:before", "b:after", "a:after"]
        );
    }

    #[test]
    fn test_base_defaults() {
        let base = MiddlewareBase::new("logging", 90);
        assert_eq!(base.name(), "logging");
        assert_eq!(base.priority(), 90);
        assert!(base.is_enabled());
        assert!(!base.track_performance());

        let base = MiddlewareBase::new("x", 0).with_enabled(false);
        assert!(!base.is_enabled());
    }
}
