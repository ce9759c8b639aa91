//! Composition root.
//!
//! [`Instrumentation`] wires one [`EventBus`], the four built-in stages and a
//! [`MiddlewareManager`] from a single [`PipelineConfig`], and owns the
//! background tasks that flush analytics and prune performance records.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tessera_config::{ConfigError, PipelineConfig};
use tessera_core::{ExecutionContext, MiddlewareError};
use tessera_middleware::{
    AnalyticsMiddleware, BoxFuture, EmitError, ErrorHandlingMiddleware, EventBus, EventSink,
    LoggingMiddleware, MiddlewareManager, MiddlewareResult, PerformanceMiddleware, PeriodicTask,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while assembling the pipeline.
#[derive(Error, Debug)]
pub enum InstrumentationError {
    /// The configuration did not validate.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A stage could not be registered.
    #[error(transparent)]
    Registration(#[from] MiddlewareError),
}

/// The assembled pipeline.
pub struct Instrumentation {
    config: Arc<PipelineConfig>,
    events: EventBus,
    manager: MiddlewareManager,
    error_handling: Arc<ErrorHandlingMiddleware>,
    logging: Arc<LoggingMiddleware>,
    performance: Arc<PerformanceMiddleware>,
    analytics: Arc<AnalyticsMiddleware>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl Instrumentation {
    /// Builds the pipeline from `config`, forwarding events to `sink` if given.
    ///
    /// Stages are registered at their default priorities: error handling
    /// (100), logging (90), performance (80) and analytics (70).
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub fn from_config(
        config: PipelineConfig,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Result<Self, InstrumentationError> {
        config.validate()?;
        let config = Arc::new(config);

        let events = sink.map_or_else(EventBus::new, EventBus::with_sink);

        let error_handling = Arc::new(ErrorHandlingMiddleware::new());
        let logging = Arc::new(LoggingMiddleware::new(&config.logging));
        let performance = Arc::new(PerformanceMiddleware::new(
            &config.performance,
            events.clone(),
        ));
        let analytics = Arc::new(AnalyticsMiddleware::new(&config.analytics, events.clone()));

        let manager = MiddlewareManager::new(config.clone());
        manager.add_shared(error_handling.clone())?;
        manager.add_shared(logging.clone())?;
        manager.add_shared(performance.clone())?;
        manager.add_shared(analytics.clone())?;

        debug!(
            environment = %config.environment,
            stages = ?manager.names(),
            "instrumentation assembled"
        );

        Ok(Self {
            config,
            events,
            manager,
            error_handling,
            logging,
            performance,
            analytics,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the analytics flush timer and the performance maintenance sweep.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while the
    /// tasks are running has no effect.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(self.analytics.start_flush_timer());
        tasks.push(self.performance.start_maintenance());
        info!(tasks = tasks.len(), "instrumentation started");
    }

    /// Whether background tasks are running.
    pub fn is_started(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Stops the background tasks and flushes buffered analytics.
    ///
    /// Returns the number of events in the final flush.
    ///
    /// # Errors
    ///
    /// Returns the sink's `EmitError` if the final flush is rejected. The
    /// events stay buffered in that case.
    pub async fn shutdown(&self) -> Result<usize, EmitError> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.stop().await;
        }

        match self.analytics.flush() {
            Ok(flushed) => {
                info!(flushed, "instrumentation shut down");
                Ok(flushed)
            }
            Err(e) => {
                warn!(error = %e, "final analytics flush failed");
                Err(e)
            }
        }
    }

    /// Runs the chain with no terminal operation.
    ///
    /// # Errors
    ///
    /// See [`MiddlewareManager::execute_with`].
    pub async fn execute(&self, ctx: &mut ExecutionContext) -> MiddlewareResult {
        self.manager.execute(ctx).await
    }

    /// Runs the chain around `operation`.
    ///
    /// # Errors
    ///
    /// See [`MiddlewareManager::execute_with`].
    pub async fn execute_with<F>(&self, ctx: &mut ExecutionContext, operation: F) -> MiddlewareResult
    where
        F: for<'c> Fn(&'c mut ExecutionContext) -> BoxFuture<'c, Result<Value, MiddlewareError>>
            + Send
            + Sync,
    {
        self.manager.execute_with(ctx, operation).await
    }

    /// The active configuration.
    pub fn config(&self) -> &Arc<PipelineConfig> {
        &self.config
    }

    /// The shared event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The manager, for registering additional stages.
    pub fn manager(&self) -> &MiddlewareManager {
        &self.manager
    }

    /// The error handling stage.
    pub fn error_handling(&self) -> &Arc<ErrorHandlingMiddleware> {
        &self.error_handling
    }

    /// The logging stage.
    pub fn logging(&self) -> &Arc<LoggingMiddleware> {
        &self.logging
    }

    /// The performance stage.
    pub fn performance(&self) -> &Arc<PerformanceMiddleware> {
        &self.performance
    }

    /// The analytics stage.
    pub fn analytics(&self) -> &Arc<AnalyticsMiddleware> {
        &self.analytics
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("stages", &self.manager.names())
            .field("events", &self.events)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_registered_in_priority_order() {
        let instrumentation = Instrumentation::from_config(PipelineConfig::test(), None).unwrap();

        assert_eq!(
            instrumentation.manager().names(),
            vec!["error_handling", "logging", "performance", "analytics"]
        );
        assert!(!instrumentation.events().has_sink());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::test();
        config.analytics.buffer_size = 0;

        let err = Instrumentation::from_config(config, None).unwrap_err();
        assert!(matches!(err, InstrumentationError::Config(_)));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let instrumentation = Instrumentation::from_config(PipelineConfig::test(), None).unwrap();

        instrumentation.start();
        instrumentation.start();
        assert_eq!(instrumentation.tasks.lock().len(), 2);

        instrumentation.shutdown().await.unwrap();
        assert!(!instrumentation.is_started());
    }
}
