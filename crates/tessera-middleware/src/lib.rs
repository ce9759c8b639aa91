//! # Tessera Middleware
//!
//! The instrumentation chain: a priority-ordered registry of [`Middleware`]
//! stages driven by the [`MiddlewareManager`], a separate [`RetryExecutor`]
//! layer, and the four built-in stages.
//!
//! ## Execution Order
//!
//! Stages run in descending priority. Each wraps the rest of the chain, so a
//! stage's code after `next.run(ctx).await` runs after every inner stage and
//! the operation have finished, on success and on failure alike:
//!
//! ```text
//! error_handling(100) → logging(90) → performance(80) → analytics(70) → operation
//! ```
//!
//! ## Events
//!
//! Stages publish [`PipelineEvent`]s through a shared [`EventBus`]:
//! `performance_warning`, `metrics_update` and `analytics_batch`.

#![doc(html_root_url = "https://docs.rs/tessera-middleware/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod events;
pub mod manager;
pub mod middleware;
pub mod periodic;
pub mod retry;
pub mod stages;

pub use events::{EmitError, EventBus, EventSink, PipelineEvent};
pub use manager::{
    HookError, MiddlewareManager, MiddlewareManagerBuilder, PostProcessHook, PreProcessHook,
};
pub use middleware::{
    boxed_operation, BoxFuture, BoxedMiddleware, ErrorHandler, FnMiddleware, Middleware,
    MiddlewareBase, MiddlewareResult, Next, Operation, Outcome,
};
pub use periodic::PeriodicTask;
pub use retry::{Attempt, RetryExecutor, RetryPolicy};
pub use stages::{
    AggregateMetrics, AnalyticsMiddleware, ErrorHandlingMiddleware, LoggingMiddleware,
    PerformanceMiddleware,
};
