//! Outbound pipeline events.
//!
//! Stages publish [`PipelineEvent`]s through an [`EventBus`]. The bus fans each
//! event out to in-process broadcast subscribers and to an optional injected
//! [`EventSink`]. Only sink failures are reported back to the publisher;
//! subscribers that lag or disappear never affect the pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::stages::analytics::{AnalyticsEvent, AnalyticsMetrics};
use crate::stages::performance::{AggregateMetrics, PerformanceRecord};
use tessera_core::Thresholds;

const DEFAULT_CAPACITY: usize = 256;

/// An event published by a stage.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "detail", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// An execution exceeded the warning threshold.
    PerformanceWarning(PerformanceWarning),
    /// A flushed batch of analytics events.
    AnalyticsBatch(AnalyticsBatch),
    /// Metrics after a performance-tracked execution.
    MetricsUpdate(MetricsUpdate),
}

impl PipelineEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PerformanceWarning(_) => "performance_warning",
            Self::AnalyticsBatch(_) => "analytics_batch",
            Self::MetricsUpdate(_) => "metrics_update",
        }
    }
}

/// Detail of a `performance_warning` event.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceWarning {
    /// The offending execution.
    pub metrics: PerformanceRecord,
    /// Thresholds in effect.
    pub thresholds: Thresholds,
    /// Aggregate snapshot after the execution.
    pub aggregate: AggregateMetrics,
}

/// Detail of an `analytics_batch` event.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsBatch {
    /// Copy of the analytics metrics at flush time.
    pub metrics: AnalyticsMetrics,
    /// Buffered events, oldest first.
    pub events: Vec<AnalyticsEvent>,
}

/// Detail of a `metrics_update` event.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsUpdate {
    /// The execution just recorded.
    pub current: PerformanceRecord,
    /// Aggregate snapshot after the execution.
    pub aggregate: AggregateMetrics,
    /// Process state at publish time.
    pub system: SystemSnapshot,
}

/// Process state attached to `metrics_update`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemSnapshot {
    /// Resident memory in bytes.
    pub memory: u64,
    /// Sample time.
    pub timestamp: DateTime<Utc>,
}

/// A sink rejected an event.
#[derive(Error, Debug, Clone)]
#[error("failed to emit '{event}': {message}")]
pub struct EmitError {
    event: String,
    message: String,
}

impl EmitError {
    /// Creates an emit error for the named event.
    pub fn new(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            message: message.into(),
        }
    }

    /// Name of the rejected event.
    pub fn event(&self) -> &str {
        &self.event
    }
}

/// Consumer of pipeline events, such as a telemetry exporter.
pub trait EventSink: Send + Sync + 'static {
    /// Delivers one event.
    ///
    /// # Errors
    ///
    /// Returns `EmitError` when the event could not be accepted.
    fn emit(&self, event: &PipelineEvent) -> Result<(), EmitError>;
}

impl<F> EventSink for F
where
    F: Fn(&PipelineEvent) -> Result<(), EmitError> + Send + Sync + 'static,
{
    fn emit(&self, event: &PipelineEvent) -> Result<(), EmitError> {
        self(event)
    }
}

/// Fan-out point shared by every stage.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
    sink: Option<Arc<dyn EventSink>>,
}

impl EventBus {
    /// Creates a bus with no sink.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { sender, sink: None }
    }

    /// Creates a bus that also forwards to `sink`.
    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new()
        }
    }

    /// Whether a sink is attached.
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Subscribes to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Publishes `event` to subscribers and the sink.
    ///
    /// # Errors
    ///
    /// Returns the sink's `EmitError`. Subscriber delivery never fails.
    pub fn publish(&self, event: PipelineEvent) -> Result<(), EmitError> {
        trace!(event = event.name(), "publishing pipeline event");

        if let Some(sink) = &self.sink {
            sink.emit(&event)?;
        }

        if self.sender.receiver_count() > 0 {
            let _ = self.sender.send(event);
        }

        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .field("has_sink", &self.has_sink())
            .finish()
    }
}
