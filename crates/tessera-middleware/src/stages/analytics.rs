//! Sampled, buffered event capture.
//!
//! Sampled executions append one [`AnalyticsEvent`] to an in-memory buffer.
//! The buffer is flushed as a single `analytics_batch` event when it reaches
//! `buffer_size`, on every tick of the flush timer, and on shutdown. A batch
//! the sink rejects is put back at the front of the buffer so the next flush
//! retries it.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tessera_config::AnalyticsConfig;
use tessera_core::{ExecutionContext, RequestId};
use tessera_telemetry::metrics::record_analytics_flush;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::ErrorSummary;
use crate::events::{AnalyticsBatch, EmitError, EventBus, PipelineEvent};
use crate::middleware::{BoxFuture, Middleware, MiddlewareBase, MiddlewareResult, Next};
use crate::periodic::PeriodicTask;

/// Default priority.
pub const DEFAULT_PRIORITY: i32 = 70;

/// Result of one captured execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// The chain succeeded.
    Success,
    /// The chain failed.
    Error,
}

/// Performance fields copied from the context, when the performance stage
/// ran first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStub {
    /// Id of the matching performance record.
    pub operation_id: Option<String>,
    /// Resident memory at the start of the execution.
    pub memory_start: Option<u64>,
    /// Checkpoints recorded so far.
    pub checkpoints: usize,
}

/// One captured execution.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Correlation id, generated if the context had none.
    pub request_id: RequestId,
    /// Session id from the context.
    pub session_id: Option<String>,
    /// Operation name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Outcome.
    pub status: EventStatus,
    /// Chain duration.
    pub duration_ms: f64,
    /// Failure summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    /// Performance fields.
    pub performance: PerformanceStub,
}

/// All-time analytics counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalyticsMetrics {
    /// Sampled executions.
    pub total_requests: u64,
    /// Sampled executions that failed.
    pub error_count: u64,
    /// Running mean duration.
    pub average_duration_ms: f64,
    /// Counts by event type.
    pub by_type: HashMap<String, u64>,
}

impl AnalyticsMetrics {
    fn record(&mut self, event: &AnalyticsEvent) {
        self.total_requests += 1;
        let n = self.total_requests as f64;
        self.average_duration_ms = (self.average_duration_ms * (n - 1.0) + event.duration_ms) / n;
        if event.status == EventStatus::Error {
            self.error_count += 1;
        }
        *self.by_type.entry(event.event_type.clone()).or_default() += 1;
    }
}

/// Analytics stage.
pub struct AnalyticsMiddleware {
    base: MiddlewareBase,
    config: AnalyticsConfig,
    events: EventBus,
    buffer: Mutex<Vec<AnalyticsEvent>>,
    metrics: Mutex<AnalyticsMetrics>,
}

impl AnalyticsMiddleware {
    /// Creates the stage from the analytics section of the configuration.
    pub fn new(config: &AnalyticsConfig, events: EventBus) -> Self {
        Self {
            base: MiddlewareBase::new("analytics", DEFAULT_PRIORITY).with_enabled(config.enabled),
            config: config.clone(),
            events,
            buffer: Mutex::new(Vec::with_capacity(config.buffer_size)),
            metrics: Mutex::new(AnalyticsMetrics::default()),
        }
    }

    /// Overrides the default priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.base =
            MiddlewareBase::new("analytics", priority).with_enabled(self.config.enabled);
        self
    }

    /// Snapshot of the counters.
    pub fn metrics(&self) -> AnalyticsMetrics {
        self.metrics.lock().clone()
    }

    /// Events waiting for the next flush.
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Publishes every buffered event as one batch.
    ///
    /// Returns the number of events flushed. An empty buffer publishes
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns the sink's `EmitError`. The batch is restored to the front of
    /// the buffer in that case.
    pub fn flush(&self) -> Result<usize, EmitError> {
        let batch = mem::take(&mut *self.buffer.lock());
        self.publish(batch)
    }

    /// Spawns the timer that flushes every `flush_interval_ms`.
    pub fn start_flush_timer(self: &Arc<Self>) -> PeriodicTask {
        let period = Duration::from_millis(self.config.flush_interval_ms);
        let stage: Weak<Self> = Arc::downgrade(self);

        PeriodicTask::spawn("analytics-flush", period, move || match stage.upgrade() {
            Some(stage) => {
                let _ = stage.flush();
                true
            }
            None => false,
        })
    }

    fn sampled(&self) -> bool {
        rand::thread_rng().gen_range(0.0..100.0) < self.config.sample_rate
    }

    fn append(&self, event: AnalyticsEvent) {
        let full = {
            let mut buffer = self.buffer.lock();
            buffer.push(event);
            (buffer.len() >= self.config.buffer_size).then(|| mem::take(&mut *buffer))
        };

        if let Some(batch) = full {
            debug!(size = batch.len(), "analytics buffer full, flushing");
            let _ = self.publish(batch);
        }
    }

    fn publish(&self, batch: Vec<AnalyticsEvent>) -> Result<usize, EmitError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let size = batch.len();
        let event = PipelineEvent::AnalyticsBatch(AnalyticsBatch {
            metrics: self.metrics(),
            events: batch.clone(),
        });

        match self.events.publish(event) {
            Ok(()) => {
                record_analytics_flush(true);
                debug!(size, "analytics batch flushed");
                Ok(size)
            }
            Err(e) => {
                record_analytics_flush(false);
                warn!(size, error = %e, "analytics flush failed, batch retained");

                let mut buffer = self.buffer.lock();
                let newer = mem::replace(&mut *buffer, batch);
                buffer.extend(newer);
                Err(e)
            }
        }
    }
}

impl Middleware for AnalyticsMiddleware {
    fn base(&self) -> &MiddlewareBase {
        &self.base
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            if !self.sampled() {
                return next.run(ctx).await;
            }

            let mut event = AnalyticsEvent {
                timestamp: Utc::now(),
                request_id: ctx.ensure_request_id(),
                session_id: ctx.session_id().map(str::to_string),
                event_type: ctx.operation().to_string(),
                status: EventStatus::Success,
                duration_ms: 0.0,
                error: None,
                performance: PerformanceStub::default(),
            };

            let started = Instant::now();
            let result = next.run(ctx).await;
            event.duration_ms = started.elapsed().as_secs_f64() * 1000.0;

            if let Err(e) = &result {
                event.status = EventStatus::Error;
                event.error = Some(ErrorSummary::from(e));
            }
            if let Some(tracking) = &ctx.performance_tracking {
                event.performance = PerformanceStub {
                    operation_id: Some(tracking.operation_id.clone()),
                    memory_start: Some(tracking.memory_start),
                    checkpoints: tracking.checkpoints.len(),
                };
            }

            self.metrics.lock().record(&event);
            self.append(event);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tessera_core::{MiddlewareError, OperationError};

    use crate::middleware::boxed_operation;

    fn config(buffer_size: usize, sample_rate: f64) -> AnalyticsConfig {
        AnalyticsConfig {
            enabled: true,
            sample_rate,
            buffer_size,
            flush_interval_ms: 1000,
        }
    }

    async fn run(stage: &AnalyticsMiddleware, fail: bool) -> MiddlewareResult {
        let op = boxed_operation(move |_ctx| {
            Box::pin(async move {
                if fail {
                    Err(MiddlewareError::from(OperationError::not_found("gone")))
                } else {
                    Ok(json!(1))
                }
            })
        });
        let mut ctx = ExecutionContext::new("list").with_session_id("s-1");
        stage.execute(&mut ctx, Next::terminal(Some(op.as_ref()))).await
    }

    #[tokio::test]
    async fn test_flush_on_fill() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let stage = AnalyticsMiddleware::new(&config(3, 100.0), events);

        run(&stage, false).await.unwrap();
        run(&stage, false).await.unwrap();
        assert_eq!(stage.buffered_len(), 2);
        assert!(rx.try_recv().is_err());

        run(&stage, false).await.unwrap();
        assert_eq!(stage.buffered_len(), 0);

        match rx.try_recv().unwrap() {
            PipelineEvent::AnalyticsBatch(batch) => {
                assert_eq!(batch.events.len(), 3);
                assert_eq!(batch.metrics.total_requests, 3);
                assert_eq!(batch.events[0].session_id.as_deref(), Some("s-1"));
            }
            other => panic!("unexpected event {}", other.name()),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_is_observed_and_propagated() {
        let stage = AnalyticsMiddleware::new(&config(10, 100.0), EventBus::new());

        let err = run(&stage, true).await.unwrap_err();
        assert_eq!(err.type_name(), "NotFoundError");

        let metrics = stage.metrics();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.by_type["list"], 1);
        assert_eq!(stage.buffered_len(), 1);
    }

    #[tokio::test]
    async fn test_event_carries_context_request_id() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let stage = AnalyticsMiddleware::new(&config(1, 100.0), events);

        let mut ctx = ExecutionContext::new("list");
        stage.execute(&mut ctx, Next::terminal(None)).await.unwrap();

        let id = ctx.request_id().unwrap();
        match rx.try_recv().unwrap() {
            PipelineEvent::AnalyticsBatch(batch) => assert_eq!(batch.events[0].request_id, id),
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_rate_zero_never_samples() {
        let stage = AnalyticsMiddleware::new(&config(10, 0.0), EventBus::new());
        for _ in 0..50 {
            run(&stage, false).await.unwrap();
        }
        assert_eq!(stage.metrics().total_requests, 0);
        assert_eq!(stage.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_prepends_batch() {
        let reject = Arc::new(AtomicBool::new(true));
        let gate = reject.clone();
        let sink = move |event: &PipelineEvent| -> Result<(), EmitError> {
            if gate.load(Ordering::Relaxed) {
                Err(EmitError::new(event.name(), "offline"))
            } else {
                Ok(())
            }
        };
        let events = EventBus::with_sink(Arc::new(sink));
        let stage = AnalyticsMiddleware::new(&config(2, 100.0), events);

        run(&stage, false).await.unwrap();
        run(&stage, false).await.unwrap();
        assert_eq!(stage.buffered_len(), 2);

        run(&stage, false).await.unwrap();
        assert_eq!(stage.buffered_len(), 3);

        reject.store(false, Ordering::Relaxed);
        assert_eq!(stage.flush().unwrap(), 3);
        assert_eq!(stage.buffered_len(), 0);
        assert_eq!(stage.flush().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let stage = Arc::new(AnalyticsMiddleware::new(&config(100, 100.0), events));
        let timer = stage.start_flush_timer();

        run(&stage, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(stage.buffered_len(), 0);
        assert_eq!(rx.try_recv().unwrap().name(), "analytics_batch");
        timer.stop().await;
    }
}
