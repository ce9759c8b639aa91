//! Structured request logging.
//!
//! Emits `request_start`, `request_complete` and `request_error` records
//! correlated by request id. Context snapshots are redacted before they are
//! rendered: `credentials` and `secrets` keys are always masked at any depth,
//! plus whatever `logging.redact_keys` adds. Matching is case-insensitive.
//!
//! When no `tracing` subscriber is installed and `fallback_to_console` is
//! set, records are written to stderr instead.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tessera_config::{LogFormat, LoggingConfig};
use tessera_core::{ExecutionContext, RequestId};
use tessera_telemetry::subscriber_installed;
use tokio::time::Instant;
use tracing::Level;

use super::ErrorSummary;
use crate::middleware::{BoxFuture, Middleware, MiddlewareBase, MiddlewareResult, Next};

/// Default priority.
pub const DEFAULT_PRIORITY: i32 = 90;

/// Replacement for redacted values.
pub const REDACTED: &str = "[REDACTED]";

const ALWAYS_REDACTED: [&str; 2] = ["credentials", "secrets"];
const RECENT_CAPACITY: usize = 100;

/// Kind of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// Before the rest of the chain runs.
    RequestStart,
    /// The chain returned successfully.
    RequestComplete,
    /// The chain returned an error.
    RequestError,
}

impl LogEvent {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestStart => "request_start",
            Self::RequestComplete => "request_complete",
            Self::RequestError => "request_error",
        }
    }

    fn level(self) -> Level {
        match self {
            Self::RequestStart | Self::RequestComplete => Level::INFO,
            Self::RequestError => Level::ERROR,
        }
    }
}

/// One emitted log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Record kind.
    pub event: LogEvent,
    /// Correlation id.
    pub request_id: Option<RequestId>,
    /// Operation name.
    pub operation: String,
    /// When the record was produced.
    pub timestamp: DateTime<Utc>,
    /// Chain duration, for completion records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// Redacted context snapshot.
    pub context: Value,
    /// Failure summary, for error records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

/// Logging stage.
pub struct LoggingMiddleware {
    base: MiddlewareBase,
    level: Level,
    format: LogFormat,
    fallback_to_console: bool,
    redact_keys: HashSet<String>,
    recent: Mutex<VecDeque<LogEntry>>,
}

impl LoggingMiddleware {
    /// Creates the stage from the logging section of the configuration.
    pub fn new(config: &LoggingConfig) -> Self {
        let level = Level::from_str(&config.level).unwrap_or(Level::INFO);
        let redact_keys = ALWAYS_REDACTED
            .iter()
            .map(|k| (*k).to_string())
            .chain(config.redact_keys.iter().map(|k| k.to_ascii_lowercase()))
            .collect();

        Self {
            base: MiddlewareBase::new("logging", DEFAULT_PRIORITY),
            level,
            format: config.format,
            fallback_to_console: config.fallback_to_console,
            redact_keys,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    /// Overrides the default priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.base = MiddlewareBase::new("logging", priority);
        self
    }

    /// The most recent records, oldest first.
    pub fn recent_entries(&self) -> Vec<LogEntry> {
        self.recent.lock().iter().cloned().collect()
    }

    fn enabled_for(&self, event: LogEvent) -> bool {
        event.level() <= self.level
    }

    fn log(
        &self,
        event: LogEvent,
        ctx: &ExecutionContext,
        duration_ms: Option<f64>,
        error: Option<ErrorSummary>,
    ) {
        if !self.enabled_for(event) {
            return;
        }

        let mut context = ctx.snapshot();
        redact(&mut context, &self.redact_keys);

        let entry = LogEntry {
            event,
            request_id: ctx.request_id(),
            operation: ctx.operation().to_string(),
            timestamp: Utc::now(),
            duration_ms,
            context,
            error,
        };

        self.emit(&entry);

        let mut recent = self.recent.lock();
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(entry);
    }

    fn render(&self, value: &impl Serialize) -> String {
        let rendered = match self.format {
            LogFormat::Json => serde_json::to_string(value),
            LogFormat::Pretty => serde_json::to_string_pretty(value),
        };
        rendered.unwrap_or_else(|e| format!("<unrenderable: {e}>"))
    }

    fn emit(&self, entry: &LogEntry) {
        if !subscriber_installed() {
            if self.fallback_to_console {
                eprintln!("{}", self.render(entry));
            }
            return;
        }

        let context = self.render(&entry.context);
        let request_id = entry.request_id.map(|id| id.to_string());
        let request_id = request_id.as_deref().unwrap_or("-");

        match entry.event {
            LogEvent::RequestStart => tracing::info!(
                event = entry.event.as_str(),
                request_id,
                operation = %entry.operation,
                context = %context,
                "request started"
            ),
            LogEvent::RequestComplete => tracing::info!(
                event = entry.event.as_str(),
                request_id,
                operation = %entry.operation,
                duration_ms = entry.duration_ms,
                context = %context,
                "request completed"
            ),
            LogEvent::RequestError => tracing::error!(
                event = entry.event.as_str(),
                request_id,
                operation = %entry.operation,
                duration_ms = entry.duration_ms,
                error = entry.error.as_ref().map(|e| e.message.as_str()),
                error_type = entry.error.as_ref().map(|e| e.error_type.as_str()),
                context = %context,
                "request failed"
            ),
        }
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new(&LoggingConfig::default())
    }
}

impl Middleware for LoggingMiddleware {
    fn base(&self) -> &MiddlewareBase {
        &self.base
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            ctx.ensure_request_id();
            let started = Instant::now();
            self.log(LogEvent::RequestStart, ctx, None, None);

            let result = next.run(ctx).await;
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

            match &result {
                Ok(_) => self.log(LogEvent::RequestComplete, ctx, Some(duration_ms), None),
                Err(e) => self.log(
                    LogEvent::RequestError,
                    ctx,
                    Some(duration_ms),
                    Some(ErrorSummary::from(e)),
                ),
            }

            result
        })
    }
}

/// Masks every value whose key is in `keys`, at any depth.
///
/// `keys` must be lowercase; object keys are compared case-insensitively.
pub fn redact(value: &mut Value, keys: &HashSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if keys.contains(&key.to_ascii_lowercase()) {
                    *item = Value::String(REDACTED.to_string());
                } else {
                    redact(item, keys);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact(item, keys);
            }
        }
        _ => {}
    }
}
