//! Priority-ordered middleware registry and chain driver.
//!
//! The [`MiddlewareManager`] owns the registry, initializes stages lazily,
//! and runs each execution through three timed phases:
//!
//! 1. **Pre-process hooks**
//! 2. **Main chain** - every enabled stage in descending priority, then the
//!    operation
//! 3. **Post-process hooks**
//!
//! The attempt as a whole is driven by a [`RetryExecutor`].

use std::cmp::Reverse;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tessera_config::PipelineConfig;
use tessera_core::{ExecutionContext, MiddlewareError};
use tessera_telemetry::metrics::record_execution;
use tessera_telemetry::InFlightGuard;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::middleware::{
    BoxFuture, BoxedMiddleware, ErrorHandler, Middleware, MiddlewareResult, Next, Operation,
    Outcome,
};
use crate::retry::{Attempt, RetryExecutor, RetryPolicy};

/// A hook run before the chain on every attempt.
pub type PreProcessHook = Arc<
    dyn Fn(&ExecutionContext) -> BoxFuture<'static, Result<(), HookError>> + Send + Sync + 'static,
>;

/// A hook run after the chain on every successful attempt.
pub type PostProcessHook = Arc<
    dyn Fn(&ExecutionContext, &Outcome) -> BoxFuture<'static, Result<(), HookError>>
        + Send
        + Sync
        + 'static,
>;

/// Error returned by a pre- or post-process hook.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    /// Creates a hook error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<HookError> for MiddlewareError {
    fn from(error: HookError) -> Self {
        Self::Hook(error.message)
    }
}

/// Registry and driver for the middleware chain.
///
/// # Example
///
/// ```ignore
/// let manager = MiddlewareManager::builder()
///     .config(Arc::new(PipelineConfig::default()))
///     .build();
///
/// manager.add_middleware(LoggingMiddleware::new(&config.logging))?;
///
/// let mut ctx = ExecutionContext::new("fetchQuestions");
/// let outcome = manager
///     .execute_with(&mut ctx, |ctx| Box::pin(async move { Ok(json!([])) }))
///     .await?;
/// ```
pub struct MiddlewareManager {
    registry: RwLock<Vec<BoxedMiddleware>>,
    config: Arc<PipelineConfig>,
    retry: RetryExecutor,
    pre_process: Vec<PreProcessHook>,
    post_process: Vec<PostProcessHook>,
    generation: AtomicU64,
    initialized_generation: AtomicU64,
    init_lock: tokio::sync::Mutex<()>,
    initialized: Mutex<HashSet<String>>,
}

impl MiddlewareManager {
    /// Creates a manager whose retry policy comes from `config.retry`.
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self::builder().config(config).build()
    }

    /// Creates a new builder.
    pub fn builder() -> MiddlewareManagerBuilder {
        MiddlewareManagerBuilder::new()
    }

    /// Configuration attached to every execution.
    pub fn config(&self) -> &Arc<PipelineConfig> {
        &self.config
    }

    /// Retry policy in effect.
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    /// Registers a middleware.
    ///
    /// # Errors
    ///
    /// Returns `MiddlewareError::DuplicateName` if the name is taken. The
    /// registry is left untouched in that case.
    pub fn add_middleware<M: Middleware>(&self, middleware: M) -> Result<(), MiddlewareError> {
        self.add_shared(Arc::new(middleware))
    }

    /// Registers an already shared middleware.
    ///
    /// # Errors
    ///
    /// Returns `MiddlewareError::DuplicateName` if the name is taken.
    pub fn add_shared(&self, middleware: BoxedMiddleware) -> Result<(), MiddlewareError> {
        let mut registry = self.registry.write();
        if registry.iter().any(|m| m.name() == middleware.name()) {
            return Err(MiddlewareError::DuplicateName(middleware.name().to_string()));
        }

        info!(
            middleware = middleware.name(),
            priority = middleware.priority(),
            "registered middleware"
        );

        registry.push(middleware);
        registry.sort_by_key(|m| Reverse(m.priority()));
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Removes a middleware by name. Returns whether one was removed.
    pub fn remove_middleware(&self, name: &str) -> bool {
        let mut registry = self.registry.write();
        let before = registry.len();
        registry.retain(|m| m.name() != name);
        let removed = registry.len() != before;
        drop(registry);

        if removed {
            self.initialized.lock().remove(name);
            info!(middleware = name, "removed middleware");
        }
        removed
    }

    /// Looks up a middleware by name.
    pub fn get(&self, name: &str) -> Option<BoxedMiddleware> {
        self.registry.read().iter().find(|m| m.name() == name).cloned()
    }

    /// Registered names in execution order.
    pub fn names(&self) -> Vec<String> {
        self.registry
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Number of registered middlewares.
    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }

    /// Initializes every middleware not yet initialized.
    ///
    /// Safe to call repeatedly. Concurrent callers wait for a single pass.
    ///
    /// # Errors
    ///
    /// Returns the first initialization failure. Middlewares that failed are
    /// retried on the next call.
    pub async fn initialize(&self) -> Result<(), MiddlewareError> {
        if self.is_initialized() {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        let generation = self.generation.load(Ordering::Acquire);
        if self.initialized_generation.load(Ordering::Acquire) == generation {
            return Ok(());
        }

        let stages = self.snapshot();
        for stage in &stages {
            if self.initialized.lock().contains(stage.name()) {
                continue;
            }

            debug!(middleware = stage.name(), "initializing middleware");
            stage.initialize().await?;
            self.initialized.lock().insert(stage.name().to_string());
        }

        self.initialized_generation
            .store(generation, Ordering::Release);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized_generation.load(Ordering::Acquire)
            == self.generation.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Vec<BoxedMiddleware> {
        self.registry.read().clone()
    }

    /// Runs the chain with no terminal operation.
    ///
    /// # Errors
    ///
    /// See [`execute_with`](Self::execute_with).
    pub async fn execute(&self, ctx: &mut ExecutionContext) -> MiddlewareResult {
        self.execute_inner(ctx, None).await
    }

    /// Runs the chain around `operation`.
    ///
    /// # Errors
    ///
    /// Returns an error when initialization fails, or when an attempt fails
    /// with no error handler registered and retries are exhausted or not
    /// allowed.
    pub async fn execute_with<F>(&self, ctx: &mut ExecutionContext, operation: F) -> MiddlewareResult
    where
        F: for<'c> Fn(&'c mut ExecutionContext) -> BoxFuture<'c, Result<Value, MiddlewareError>>
            + Send
            + Sync,
    {
        self.execute_inner(ctx, Some(&operation)).await
    }

    async fn execute_inner(
        &self,
        ctx: &mut ExecutionContext,
        operation: Option<&Operation<'_>>,
    ) -> MiddlewareResult {
        ctx.attach_config(self.config.clone());

        if !ctx.config().map_or(true, |config| config.enabled) {
            debug!(operation = ctx.operation(), "pipeline disabled, running operation directly");
            return Next::terminal(operation).run(ctx).await;
        }

        ctx.validate()?;
        self.initialize().await?;

        ctx.ensure_request_id();
        ctx.mark_started();

        let _in_flight = InFlightGuard::new();
        let started = Instant::now();

        let stages = self.snapshot();
        let handler = find_error_handler(&stages);
        let attempt = ChainAttempt {
            stages: &stages,
            operation,
            pre_process: &self.pre_process,
            post_process: &self.post_process,
            timeout: self.retry.policy().attempt_timeout,
        };

        let result = self.retry.run(ctx, &attempt, handler).await;

        let outcome = match &result {
            Ok(Outcome::Completed(_)) => "completed",
            Ok(Outcome::Handled(_)) => "handled",
            Err(_) => "failed",
        };
        record_execution(ctx.operation(), outcome, started.elapsed());

        result
    }

    /// Walks the chain once with no retry, hooks or timeouts.
    ///
    /// # Errors
    ///
    /// Returns whatever the chain returns.
    pub async fn run_chain(
        &self,
        ctx: &mut ExecutionContext,
        operation: Option<&Operation<'_>>,
    ) -> MiddlewareResult {
        let stages = self.snapshot();
        Next::new(&stages, operation).run(ctx).await
    }
}

impl std::fmt::Debug for MiddlewareManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareManager")
            .field("middlewares", &self.names())
            .field("retry", self.retry.policy())
            .field("pre_process_hooks", &self.pre_process.len())
            .field("post_process_hooks", &self.post_process.len())
            .finish()
    }
}

fn find_error_handler(stages: &[BoxedMiddleware]) -> Option<&dyn ErrorHandler> {
    stages
        .iter()
        .filter(|m| m.is_enabled())
        .find_map(|m| m.as_error_handler())
}

async fn within<T, F>(phase: &'static str, limit: Duration, fut: F) -> Result<T, MiddlewareError>
where
    F: Future<Output = Result<T, MiddlewareError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(phase, timeout_ms = limit.as_millis() as u64, "phase timed out");
            Err(MiddlewareError::timeout(phase, limit))
        }
    }
}

struct ChainAttempt<'m> {
    stages: &'m [BoxedMiddleware],
    operation: Option<&'m Operation<'m>>,
    pre_process: &'m [PreProcessHook],
    post_process: &'m [PostProcessHook],
    timeout: Duration,
}

impl Attempt for ChainAttempt<'_> {
    fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            within("pre-process", self.timeout, async {
                for hook in self.pre_process {
                    hook(ctx).await?;
                }
                Ok(())
            })
            .await?;

            let outcome = within(
                "main",
                self.timeout,
                Next::new(self.stages, self.operation).run(ctx),
            )
            .await?;

            within("post-process", self.timeout, async {
                for hook in self.post_process {
                    hook(ctx, &outcome).await?;
                }
                Ok(())
            })
            .await?;

            Ok(outcome)
        })
    }
}

/// Builder for [`MiddlewareManager`].
#[derive(Default)]
pub struct MiddlewareManagerBuilder {
    config: Option<Arc<PipelineConfig>>,
    retry_policy: Option<RetryPolicy>,
    pre_process: Vec<PreProcessHook>,
    post_process: Vec<PostProcessHook>,
}

impl MiddlewareManagerBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration. Defaults to `PipelineConfig::default()`.
    #[must_use]
    pub fn config(mut self, config: Arc<PipelineConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides the retry policy derived from `config.retry`.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Adds a hook run before the chain on every attempt.
    #[must_use]
    pub fn pre_process<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExecutionContext) -> BoxFuture<'static, Result<(), HookError>>
            + Send
            + Sync
            + 'static,
    {
        self.pre_process.push(Arc::new(hook));
        self
    }

    /// Adds a hook run after the chain on every successful attempt.
    #[must_use]
    pub fn post_process<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExecutionContext, &Outcome) -> BoxFuture<'static, Result<(), HookError>>
            + Send
            + Sync
            + 'static,
    {
        self.post_process.push(Arc::new(hook));
        self
    }

    /// Builds the manager.
    pub fn build(self) -> MiddlewareManager {
        let config = self.config.unwrap_or_default();
        let policy = self
            .retry_policy
            .unwrap_or_else(|| RetryPolicy::from(&config.retry));

        MiddlewareManager {
            registry: RwLock::new(Vec::new()),
            retry: RetryExecutor::new(policy),
            config,
            pre_process: self.pre_process,
            post_process: self.post_process,
            generation: AtomicU64::new(1),
            initialized_generation: AtomicU64::new(0),
            init_lock: tokio::sync::Mutex::new(()),
            initialized: Mutex::new(HashSet::new()),
        }
    }
}
