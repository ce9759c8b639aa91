//! Per-operation timing, memory sampling and threshold warnings.
//!
//! Each measured execution produces a [`PerformanceRecord`] kept in memory
//! until the maintenance sweep prunes it, and updates a running
//! [`AggregateMetrics`]. Executions slower than the warning threshold publish
//! a `performance_warning` event; every measured execution publishes a
//! `metrics_update` event. Publishing failures are logged and never reach the
//! caller.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tessera_config::PerformanceConfig;
use tessera_core::{Checkpoint, ExecutionContext, PerformanceTracking, RequestId, Thresholds};
use tessera_telemetry::metrics::record_performance_status;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, MetricsUpdate, PerformanceWarning, PipelineEvent, SystemSnapshot};
use crate::middleware::{BoxFuture, Middleware, MiddlewareBase, MiddlewareResult, Next};
use crate::periodic::PeriodicTask;

/// Default priority.
pub const DEFAULT_PRIORITY: i32 = 80;

/// Process memory could not be read.
#[derive(Error, Debug, Clone)]
#[error("failed to read process memory: {0}")]
pub struct MemoryReadError(String);

impl MemoryReadError {
    /// Creates a memory read error.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Source of process memory samples.
pub trait MemorySource: Send + Sync + 'static {
    /// Resident memory of the current process in bytes.
    ///
    /// # Errors
    ///
    /// Returns `MemoryReadError` when the platform cannot report it.
    fn resident_bytes(&self) -> Result<u64, MemoryReadError>;
}

/// [`MemorySource`] backed by `sysinfo`.
pub struct SysinfoMemorySource {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoMemorySource {
    /// Creates a source for the current process.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource for SysinfoMemorySource {
    fn resident_bytes(&self) -> Result<u64, MemoryReadError> {
        let pid = self
            .pid
            .ok_or_else(|| MemoryReadError::new("current pid unavailable"))?;

        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(sysinfo::Process::memory)
            .ok_or_else(|| MemoryReadError::new(format!("process {pid} not found")))
    }
}

/// Classification of one execution against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceStatus {
    /// At or below the warning threshold.
    Healthy,
    /// Above the warning threshold.
    Warning,
    /// Above the critical threshold.
    Critical,
}

impl PerformanceStatus {
    /// Classifies `duration_ms`. Comparisons are strict.
    pub fn classify(duration_ms: f64, thresholds: Thresholds) -> Self {
        if duration_ms > thresholds.critical_ms as f64 {
            Self::Critical
        } else if duration_ms > thresholds.warning_ms as f64 {
            Self::Warning
        } else {
            Self::Healthy
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Measurements for one execution.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceRecord {
    /// Unique id, also the key in the record store.
    pub operation_id: String,
    /// Operation name.
    pub operation: String,
    /// Correlation id.
    pub request_id: Option<RequestId>,
    /// Wall-clock start.
    pub start_time: DateTime<Utc>,
    /// Wall-clock end.
    pub end_time: DateTime<Utc>,
    /// Duration in milliseconds.
    pub duration_ms: f64,
    /// Resident memory before the execution.
    pub memory_start: u64,
    /// Resident memory change over the execution.
    pub memory_delta: i64,
    /// Classification.
    pub status: PerformanceStatus,
    /// Whether the chain succeeded.
    pub success: bool,
    /// Caller checkpoints.
    pub checkpoints: Vec<Checkpoint>,
    /// Threshold warnings.
    pub warnings: Vec<String>,
}

/// Running statistics across every measured execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateMetrics {
    /// Measured executions.
    pub total_requests: u64,
    /// Running mean duration.
    pub average_duration_ms: f64,
    /// Fastest execution.
    pub min_duration_ms: Option<f64>,
    /// Slowest execution.
    pub max_duration_ms: Option<f64>,
    /// Executions classified as warning.
    pub warning_count: u64,
    /// Executions classified as critical.
    pub critical_count: u64,
    /// Executions whose chain failed.
    pub total_errors: u64,
    /// Percentage of failed executions, `total_errors / total_requests * 100`.
    /// 0 when empty.
    pub error_rate: f64,
    /// Health score between 0 and 100.
    pub performance_score: f64,
}

impl AggregateMetrics {
    fn record(&mut self, duration_ms: f64, status: PerformanceStatus, success: bool) {
        self.total_requests += 1;
        let n = self.total_requests as f64;
        self.average_duration_ms = (self.average_duration_ms * (n - 1.0) + duration_ms) / n;
        self.min_duration_ms = Some(self.min_duration_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        self.max_duration_ms = Some(self.max_duration_ms.map_or(duration_ms, |m| m.max(duration_ms)));

        match status {
            PerformanceStatus::Critical => self.critical_count += 1,
            PerformanceStatus::Warning => self.warning_count += 1,
            PerformanceStatus::Healthy => {}
        }
        if !success {
            self.total_errors += 1;
        }
    }

    /// Copy with `error_rate` and `performance_score` filled in.
    fn derived(&self) -> Self {
        let mut out = self.clone();
        if self.total_requests == 0 {
            out.error_rate = 0.0;
            out.performance_score = 100.0;
            return out;
        }

        let total = self.total_requests as f64;
        out.error_rate = self.total_errors as f64 / total * 100.0;
        let score = 100.0
            - 30.0 * self.total_errors as f64 / total
            - 15.0 * self.warning_count as f64 / total
            - 25.0 * self.critical_count as f64 / total;
        out.performance_score = score.clamp(0.0, 100.0);
        out
    }
}

/// Performance stage.
pub struct PerformanceMiddleware {
    base: MiddlewareBase,
    config: PerformanceConfig,
    events: EventBus,
    memory: Arc<dyn MemorySource>,
    records: DashMap<String, PerformanceRecord>,
    aggregate: Mutex<AggregateMetrics>,
}

impl PerformanceMiddleware {
    /// Creates the stage with the `sysinfo` memory source.
    pub fn new(config: &PerformanceConfig, events: EventBus) -> Self {
        Self::with_memory_source(config, events, Arc::new(SysinfoMemorySource::new()))
    }

    /// Creates the stage with a custom memory source.
    pub fn with_memory_source(
        config: &PerformanceConfig,
        events: EventBus,
        memory: Arc<dyn MemorySource>,
    ) -> Self {
        Self {
            base: MiddlewareBase::new("performance", DEFAULT_PRIORITY)
                .with_enabled(config.enabled),
            config: config.clone(),
            events,
            memory,
            records: DashMap::new(),
            aggregate: Mutex::new(AggregateMetrics::default()),
        }
    }

    /// Overrides the default priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.base =
            MiddlewareBase::new("performance", priority).with_enabled(self.config.enabled);
        self
    }

    /// Configured thresholds.
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            warning_ms: self.config.warning_threshold_ms,
            critical_ms: self.config.critical_threshold_ms,
        }
    }

    /// Aggregate snapshot including error rate and score.
    pub fn aggregate_metrics(&self) -> AggregateMetrics {
        self.aggregate.lock().derived()
    }

    /// Stored record by operation id.
    pub fn record(&self, operation_id: &str) -> Option<PerformanceRecord> {
        self.records.get(operation_id).map(|r| r.value().clone())
    }

    /// Every stored record, in no particular order.
    pub fn records(&self) -> Vec<PerformanceRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Removes records that ended more than `max_age` ago.
    ///
    /// Returns the number removed.
    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let before = self.records.len();
        self.records.retain(|_, record| record.end_time >= cutoff);
        let removed = before.saturating_sub(self.records.len());

        if removed > 0 {
            info!(removed, remaining = self.records.len(), "pruned performance records");
        }
        removed
    }

    /// Spawns the periodic sweep that prunes records past retention.
    pub fn start_maintenance(self: &Arc<Self>) -> PeriodicTask {
        let period = Duration::from_secs(self.config.cleanup_interval_secs);
        let retention = Duration::from_secs(self.config.retention_hours * 3600);
        let stage: Weak<Self> = Arc::downgrade(self);

        PeriodicTask::spawn("performance-maintenance", period, move || {
            match stage.upgrade() {
                Some(stage) => {
                    stage.prune_older_than(retention);
                    true
                }
                None => false,
            }
        })
    }

    fn sampled(&self) -> bool {
        let sampling = &self.config.sampling;
        !sampling.enabled || rand::thread_rng().gen::<f64>() < sampling.rate
    }

    fn sample_memory(&self) -> u64 {
        self.memory.resident_bytes().unwrap_or_else(|e| {
            warn!(error = %e, "memory sample failed, using 0");
            0
        })
    }

    fn finish(&self, ctx: &mut ExecutionContext, started: Instant, success: bool) {
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let memory_end = self.sample_memory();
        let thresholds = self.thresholds();
        let status = PerformanceStatus::classify(duration_ms, thresholds);
        let operation = ctx.operation().to_string();
        let request_id = ctx.request_id();

        let Some(tracking) = ctx.performance_tracking.as_mut() else {
            return;
        };

        match status {
            PerformanceStatus::Critical => tracking.warnings.push(format!(
                "duration {duration_ms:.0}ms exceeded critical threshold {}ms",
                thresholds.critical_ms
            )),
            PerformanceStatus::Warning => tracking.warnings.push(format!(
                "duration {duration_ms:.0}ms exceeded warning threshold {}ms",
                thresholds.warning_ms
            )),
            PerformanceStatus::Healthy => {}
        }

        let record = PerformanceRecord {
            operation_id: tracking.operation_id.clone(),
            operation,
            request_id,
            start_time: tracking.start_time,
            end_time: Utc::now(),
            duration_ms,
            memory_start: tracking.memory_start,
            memory_delta: memory_end as i64 - tracking.memory_start as i64,
            status,
            success,
            checkpoints: tracking.checkpoints.clone(),
            warnings: tracking.warnings.clone(),
        };

        self.records.insert(record.operation_id.clone(), record.clone());
        let aggregate = {
            let mut aggregate = self.aggregate.lock();
            aggregate.record(duration_ms, status, success);
            aggregate.derived()
        };
        record_performance_status(status.as_str());

        debug!(
            operation = %record.operation,
            duration_ms,
            status = status.as_str(),
            "execution measured"
        );

        if duration_ms > thresholds.warning_ms as f64 {
            let event = PipelineEvent::PerformanceWarning(PerformanceWarning {
                metrics: record.clone(),
                thresholds,
                aggregate: aggregate.clone(),
            });
            if let Err(e) = self.events.publish(event) {
                warn!(error = %e, "failed to publish performance warning");
            }
        }

        let event = PipelineEvent::MetricsUpdate(MetricsUpdate {
            current: record,
            aggregate,
            system: SystemSnapshot {
                memory: memory_end,
                timestamp: Utc::now(),
            },
        });
        if let Err(e) = self.events.publish(event) {
            warn!(error = %e, "failed to publish metrics update");
        }
    }
}

impl Middleware for PerformanceMiddleware {
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

            let operation_id = format!("{}-{}", ctx.operation(), Uuid::now_v7());
            let memory_start = self.sample_memory();
            let started = Instant::now();
            ctx.performance_tracking = Some(PerformanceTracking::start(
                operation_id,
                memory_start,
                self.thresholds(),
            ));

            let result = next.run(ctx).await;
            self.finish(ctx, started, result.is_ok());
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_config::SamplingConfig;
    use tessera_core::{MiddlewareError, OperationError};

    use crate::events::EmitError;
    use crate::middleware::boxed_operation;

    struct FixedMemory(u64);

    impl MemorySource for FixedMemory {
        fn resident_bytes(&self) -> Result<u64, MemoryReadError> {
            Ok(self.0)
        }
    }

    struct BrokenMemory;

    impl MemorySource for BrokenMemory {
        fn resident_bytes(&self) -> Result<u64, MemoryReadError> {
            Err(MemoryReadError::new("unsupported"))
        }
    }

    fn config() -> PerformanceConfig {
        PerformanceConfig {
            warning_threshold_ms: 100,
            critical_threshold_ms: 300,
            ..PerformanceConfig::default()
        }
    }

    fn stage(events: EventBus) -> PerformanceMiddleware {
        PerformanceMiddleware::with_memory_source(&config(), events, Arc::new(FixedMemory(1024)))
    }

    async fn run_for(stage: &PerformanceMiddleware, millis: u64, fail: bool) {
        let op = boxed_operation(move |_ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                if fail {
                    Err(MiddlewareError::from(OperationError::database("down")))
                } else {
                    Ok(json!(null))
                }
            })
        });
        let mut ctx = ExecutionContext::new("op");
        let _ = stage.execute(&mut ctx, Next::terminal(Some(op.as_ref()))).await;
    }

    #[test]
    fn test_classification_is_strict() {
        let t = Thresholds {
            warning_ms: 100,
            critical_ms: 300,
        };
        assert_eq!(PerformanceStatus::classify(100.0, t), PerformanceStatus::Healthy);
        assert_eq!(PerformanceStatus::classify(100.5, t), PerformanceStatus::Warning);
        assert_eq!(PerformanceStatus::classify(300.0, t), PerformanceStatus::Warning);
        assert_eq!(PerformanceStatus::classify(301.0, t), PerformanceStatus::Critical);
    }

    #[test]
    fn test_empty_aggregate() {
        let stage = stage(EventBus::new());
        let aggregate = stage.aggregate_metrics();
        assert_eq!(aggregate.total_requests, 0);
        assert_eq!(aggregate.error_rate, 0.0);
        assert_eq!(aggregate.performance_score, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_and_aggregates() {
        let stage = stage(EventBus::new());

        run_for(&stage, 50, false).await;
        run_for(&stage, 150, false).await;
        run_for(&stage, 400, true).await;

        let aggregate = stage.aggregate_metrics();
        assert_eq!(aggregate.total_requests, 3);
        assert!((aggregate.average_duration_ms - 200.0).abs() < 5.0);
        assert_eq!(aggregate.warning_count, 1);
        assert_eq!(aggregate.critical_count, 1);
        assert_eq!(aggregate.total_errors, 1);
        assert!((aggregate.error_rate - 100.0 / 3.0).abs() < 1e-9);
        let expected = 100.0 - 30.0 / 3.0 - 15.0 / 3.0 - 25.0 / 3.0;
        assert!((aggregate.performance_score - expected).abs() < 1e-9);

        let records = stage.records();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.memory_delta == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_attached_to_context() {
        let stage = stage(EventBus::new());
        let op = boxed_operation(|ctx| {
            Box::pin(async move {
                assert!(ctx.checkpoint("loaded"));
                Ok(json!(null))
            })
        });

        let mut ctx = ExecutionContext::new("op");
        stage
            .execute(&mut ctx, Next::terminal(Some(op.as_ref())))
            .await
            .unwrap();

        let tracking = ctx.performance_tracking.as_ref().unwrap();
        assert_eq!(tracking.memory_start, 1024);
        let record = stage.record(&tracking.operation_id).unwrap();
        assert_eq!(record.checkpoints.len(), 1);
        assert_eq!(record.checkpoints[0].label, "loaded");
        assert_eq!(record.status, PerformanceStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_published_and_sink_failure_swallowed() {
        let sink = |event: &PipelineEvent| -> Result<(), EmitError> {
            Err(EmitError::new(event.name(), "offline"))
        };
        let events = EventBus::with_sink(Arc::new(sink));
        let mut rx = events.subscribe();
        let stage = stage(events);

        run_for(&stage, 150, false).await;

        assert_eq!(stage.aggregate_metrics().warning_count, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_for_slow_execution() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let stage = stage(events);

        run_for(&stage, 150, false).await;

        let first = rx.try_recv().unwrap();
        assert_eq!(first.name(), "performance_warning");
        let second = rx.try_recv().unwrap();
        assert_eq!(second.name(), "metrics_update");
    }

    #[tokio::test]
    async fn test_broken_memory_source_reads_zero() {
        let stage =
            PerformanceMiddleware::with_memory_source(&config(), EventBus::new(), Arc::new(BrokenMemory));
        run_for(&stage, 0, false).await;
        let record = stage.records().pop().unwrap();
        assert_eq!(record.memory_start, 0);
    }

    #[tokio::test]
    async fn test_sampling_rate_zero_skips() {
        let config = PerformanceConfig {
            sampling: SamplingConfig {
                enabled: true,
                rate: 0.0,
            },
            ..config()
        };
        let stage =
            PerformanceMiddleware::with_memory_source(&config, EventBus::new(), Arc::new(FixedMemory(0)));

        run_for(&stage, 0, false).await;
        assert_eq!(stage.aggregate_metrics().total_requests, 0);
    }

    #[tokio::test]
    async fn test_prune() {
        let stage = stage(EventBus::new());
        run_for(&stage, 0, false).await;

        assert_eq!(stage.prune_older_than(Duration::from_secs(3600)), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(stage.prune_older_than(Duration::from_millis(1)), 1);
        assert!(stage.records().is_empty());
    }
}
