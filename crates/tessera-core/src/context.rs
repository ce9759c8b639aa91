//! Execution context types.
//!
//! The [`ExecutionContext`] is the mutable record handed down the middleware
//! chain for one top-level call. It carries correlation ids, the open `data`
//! payload and the per-call records owned by the performance and retry
//! layers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tessera_config::{Environment, PipelineConfig};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::MiddlewareError;

/// A unique identifier for each execution, using UUID v7.
///
/// UUID v7 is time-ordered, which keeps ids sortable in logs and batches.
///
/// # Example
///
/// ```
/// use tessera_core::RequestId;
///
/// let id = RequestId::new();
/// println!("Request ID: {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new unique request ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `RequestId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Duration thresholds applied to one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Thresholds {
    /// Above this the execution is a warning.
    pub warning_ms: u64,
    /// Above this the execution is critical.
    pub critical_ms: u64,
}

/// A labelled point in time within one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    /// Caller-supplied label.
    pub label: String,
    /// Milliseconds since tracking started.
    pub elapsed_ms: f64,
}

/// Per-execution record owned by the performance stage.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceTracking {
    /// Id of the stored performance record.
    pub operation_id: String,
    /// Wall-clock start.
    pub start_time: DateTime<Utc>,
    /// Process memory in bytes when tracking started.
    pub memory_start: u64,
    /// Checkpoints added while the execution ran.
    pub checkpoints: Vec<Checkpoint>,
    /// Warnings attached by the stage.
    pub warnings: Vec<String>,
    /// Thresholds in effect.
    pub thresholds: Thresholds,
    #[serde(skip)]
    started: Instant,
}

impl PerformanceTracking {
    /// Starts tracking now.
    pub fn start(
        operation_id: impl Into<String>,
        memory_start: u64,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            start_time: Utc::now(),
            memory_start,
            checkpoints: Vec::new(),
            warnings: Vec::new(),
            thresholds,
            started: Instant::now(),
        }
    }

    /// Monotonic start, for duration measurement.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Milliseconds elapsed since tracking started.
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

/// Per-execution record owned by the retry layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionMetadata {
    /// Current attempt, starting at 1.
    pub attempt: u32,
    /// Total attempts allowed.
    pub max_retries: u32,
    /// When the first attempt started.
    pub started_at: DateTime<Utc>,
}

/// Mutable record that flows through the middleware chain.
///
/// `request_id` and `timestamp` are write-once: [`ensure_request_id`] and
/// [`mark_started`] only fill them when absent.
///
/// [`ensure_request_id`]: ExecutionContext::ensure_request_id
/// [`mark_started`]: ExecutionContext::mark_started
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use tessera_core::ExecutionContext;
///
/// let ctx = ExecutionContext::new("fetchQuestions")
///     .with_session_id("session-1")
///     .with_data("limit", json!(10));
///
/// assert_eq!(ctx.data_as::<u32>("limit").unwrap(), Some(10));
/// ```
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    operation: String,
    timestamp: Option<DateTime<Utc>>,
    request_id: Option<RequestId>,
    session_id: Option<String>,
    path: Option<String>,
    environment: Option<Environment>,
    config: Option<Arc<PipelineConfig>>,

    /// Open payload supplied by the caller.
    pub data: Map<String, Value>,

    /// Record owned by the performance stage for this execution.
    pub performance_tracking: Option<PerformanceTracking>,

    /// Record owned by the retry layer for this execution.
    pub execution_metadata: Option<ExecutionMetadata>,
}

impl ExecutionContext {
    /// Creates a context for the named operation.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            timestamp: None,
            request_id: None,
            session_id: None,
            path: None,
            environment: None,
            config: None,
            data: Map::new(),
            performance_tracking: None,
            execution_metadata: None,
        }
    }

    /// Sets the request id up front.
    #[must_use]
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Sets the session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the path used for per-path error breakdowns.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Inserts a payload entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Overrides the environment resolved from the config.
    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Attaches a pipeline configuration.
    #[must_use]
    pub fn with_config(mut self, config: Arc<PipelineConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// Operation name.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Request id, if assigned.
    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    /// Returns the request id, generating one if absent.
    pub fn ensure_request_id(&mut self) -> RequestId {
        *self.request_id.get_or_insert_with(RequestId::new)
    }

    /// Entry timestamp, if stamped.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Stamps the entry timestamp if absent and returns it.
    pub fn mark_started(&mut self) -> DateTime<Utc> {
        *self.timestamp.get_or_insert_with(Utc::now)
    }

    /// Session id, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Path for error breakdowns, falling back to the operation name.
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.operation)
    }

    /// Attached configuration, if any.
    pub fn config(&self) -> Option<&Arc<PipelineConfig>> {
        self.config.as_ref()
    }

    /// Attaches a configuration unless one is already present.
    pub fn attach_config(&mut self, config: Arc<PipelineConfig>) {
        if self.config.is_none() {
            self.config = Some(config);
        }
    }

    /// Effective environment: explicit value, then config, then development.
    pub fn environment(&self) -> Environment {
        self.environment
            .or_else(|| self.config.as_ref().map(|c| c.environment))
            .unwrap_or_default()
    }

    /// Checks the minimal shape of the context.
    ///
    /// # Errors
    ///
    /// Returns `MiddlewareError::InvalidContext` if the operation is blank.
    pub fn validate(&self) -> Result<(), MiddlewareError> {
        if self.operation.trim().is_empty() {
            return Err(MiddlewareError::invalid_context("operation is required"));
        }
        Ok(())
    }

    /// Reads a payload entry as `T`.
    ///
    /// Returns `Ok(None)` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error when the entry has the wrong shape.
    pub fn data_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.data
            .get(key)
            .map(T::deserialize)
            .transpose()
    }

    /// Records a checkpoint on the active performance tracking.
    ///
    /// Returns `false` when no tracking is active.
    pub fn checkpoint(&mut self, label: impl Into<String>) -> bool {
        match self.performance_tracking.as_mut() {
            Some(tracking) => {
                let elapsed_ms = tracking.elapsed_ms();
                tracking.checkpoints.push(Checkpoint {
                    label: label.into(),
                    elapsed_ms,
                });
                true
            }
            None => false,
        }
    }

    /// JSON view of the context for logging. Config is left out.
    pub fn snapshot(&self) -> Value {
        json!({
            "operation": self.operation,
            "request_id": self.request_id,
            "session_id": self.session_id,
            "path": self.path,
            "timestamp": self.timestamp,
            "environment": self.environment(),
            "data": self.data,
            "performance_tracking": self.performance_tracking,
            "execution_metadata": self.execution_metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_new_generates_unique_ids() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.to_string().len(), 36);
    }

    #[test]
    fn test_request_id_serializes_as_string() {
        let uuid = Uuid::now_v7();
        let json = serde_json::to_value(RequestId::from_uuid(uuid)).unwrap();
        assert_eq!(json, json!(uuid.to_string()));
    }

    #[test]
    fn test_ensure_request_id_is_write_once() {
        let mut ctx = ExecutionContext::new("op");
        let first = ctx.ensure_request_id();
        let second = ctx.ensure_request_id();
        assert_eq!(first, second);

        let preset = RequestId::new();
        let mut ctx = ExecutionContext::new("op").with_request_id(preset);
        assert_eq!(ctx.ensure_request_id(), preset);
    }

    #[test]
    fn test_mark_started_is_write_once() {
        let mut ctx = ExecutionContext::new("op");
        let first = ctx.mark_started();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(ctx.mark_started(), first);
        assert_eq!(ctx.timestamp(), Some(first));
    }

    #[test]
    fn test_validate_requires_operation() {
        assert!(ExecutionContext::new("fetchQuestions").validate().is_ok());
        let err = ExecutionContext::new("  ").validate().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_path_falls_back_to_operation() {
        let ctx = ExecutionContext::new("fetchQuestions");
        assert_eq!(ctx.path(), "fetchQuestions");
        let ctx = ctx.with_path("/api/questions");
        assert_eq!(ctx.path(), "/api/questions");
    }

    #[test]
    fn test_environment_resolution() {
        let ctx = ExecutionContext::new("op");
        assert_eq!(ctx.environment(), Environment::Development);

        let ctx = ctx.with_config(Arc::new(PipelineConfig::production()));
        assert_eq!(ctx.environment(), Environment::Production);

        let ctx = ctx.with_environment(Environment::Test);
        assert_eq!(ctx.environment(), Environment::Test);
    }

    #[test]
    fn test_attach_config_keeps_existing() {
        let mut ctx = ExecutionContext::new("op").with_config(Arc::new(PipelineConfig::test()));
        ctx.attach_config(Arc::new(PipelineConfig::production()));
        assert_eq!(ctx.environment(), Environment::Test);
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Page {
        limit: u32,
        cursor: Option<String>,
    }

    #[test]
    fn test_data_as_typed_access() {
        let ctx = ExecutionContext::new("op")
            .with_data("page", json!({"limit": 20, "cursor": null}))
            .with_data("name", json!("quiz"));

        let page: Option<Page> = ctx.data_as("page").unwrap();
        assert_eq!(page, Some(Page { limit: 20, cursor: None }));
        assert_eq!(ctx.data_as::<u32>("missing").unwrap(), None);
        assert!(ctx.data_as::<u32>("name").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_records_elapsed() {
        let mut ctx = ExecutionContext::new("op");
        assert!(!ctx.checkpoint("no tracking"));

        ctx.performance_tracking = Some(PerformanceTracking::start(
            "perf-1",
            0,
            Thresholds {
                warning_ms: 1000,
                critical_ms: 3000,
            },
        ));
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        assert!(ctx.checkpoint("loaded"));

        let tracking = ctx.performance_tracking.as_ref().unwrap();
        assert_eq!(tracking.checkpoints.len(), 1);
        assert_eq!(tracking.checkpoints[0].label, "loaded");
        assert!((tracking.checkpoints[0].elapsed_ms - 25.0).abs() < 1.0);
    }

    #[test]
    fn test_snapshot_shape() {
        let mut ctx = ExecutionContext::new("op")
            .with_session_id("s-1")
            .with_data("credentials", json!({"password": "x"}));
        let id = ctx.ensure_request_id();

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot["operation"], "op");
        assert_eq!(snapshot["request_id"], json!(id.to_string()));
        assert_eq!(snapshot["session_id"], "s-1");
        assert_eq!(snapshot["environment"], "development");
        assert!(snapshot["data"]["credentials"].is_object());
    }
}
