use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{RetryPolicy, StepOutcome};

/// Error returned by an activity handler, classified for retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityError {
    /// Transient (network, rate limit); retried per the step's policy.
    Transient(String),
    /// Hard failure; never retried.
    Permanent(String),
}

impl ActivityError {
    pub fn message(&self) -> &str {
        match self {
            ActivityError::Transient(m) | ActivityError::Permanent(m) => m,
        }
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityError::Transient(m) => write!(f, "transient: {m}"),
            ActivityError::Permanent(m) => write!(f, "permanent: {m}"),
        }
    }
}

impl std::error::Error for ActivityError {}

/// Per-attempt context handed to activity handlers.
///
/// `idempotency_key` is identical across every attempt of the same step;
/// handlers pass it to the external collaborator as a dedup token.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub execution_id: String,
    pub step_name: String,
    pub idempotency_key: String,
    /// 1-based.
    pub attempt: u32,
}

/// Trait implemented by activity handlers invokable by the executor.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        (self.0)(ctx, input).await
    }
}

/// Immutable registry mapping activity names to handlers.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
    errors: Vec<String>,
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate activity registration: {name}"));
            return self;
        }
        self.map.insert(name, Arc::new(FnActivity(f)));
        self
    }

    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) -> Self {
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate activity registration: {name}"));
            return self;
        }
        self.map.insert(name, handler);
        self
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Build, surfacing duplicate-registration errors.
    pub fn build_result(self) -> Result<ActivityRegistry, String> {
        if self.errors.is_empty() {
            let map = self.map;
            Ok(ActivityRegistry { inner: Arc::new(map) })
        } else {
            Err(self.errors.join("; "))
        }
    }
}

/// Result of one activity attempt.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub outcome: StepOutcome,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// True when the attempt was cut off by its timeout.
    pub timed_out: bool,
}

impl AttemptResult {
    fn success(output: Value) -> Self {
        Self {
            outcome: StepOutcome::Success,
            output: Some(output),
            error: None,
            timed_out: false,
        }
    }
}

/// Runs single activity attempts on a bounded worker pool.
///
/// The semaphore bounds concurrent in-flight external calls, not concurrent
/// executions; a parked execution (durable sleep, retry backoff) holds no
/// permit. Retry scheduling is the engine's job; the executor only
/// classifies one attempt.
pub struct ActivityExecutor {
    registry: ActivityRegistry,
    slots: Arc<Semaphore>,
}

impl ActivityExecutor {
    pub fn new(registry: ActivityRegistry, worker_slots: usize) -> Self {
        Self {
            registry,
            slots: Arc::new(Semaphore::new(worker_slots.max(1))),
        }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Execute one attempt of `activity` under the step's timeout.
    ///
    /// A timeout or transient error counts as `RetryableFailure` until the
    /// policy's attempts are exhausted, at which point it becomes
    /// `FatalFailure` (the engine maps an exhausted timeout to TimedOut).
    pub async fn execute(
        &self,
        activity: &str,
        ctx: ActivityContext,
        input: Value,
        policy: &RetryPolicy,
        timeout_ms: u64,
    ) -> AttemptResult {
        let Some(handler) = self.registry.get(activity) else {
            return AttemptResult {
                outcome: StepOutcome::FatalFailure,
                output: None,
                error: Some(format!("unregistered activity: {activity}")),
                timed_out: false,
            };
        };

        // Permit scope covers exactly the external call.
        let _permit = self.slots.acquire().await;
        debug!(
            execution = %ctx.execution_id,
            step = %ctx.step_name,
            activity,
            attempt = ctx.attempt,
            "executing activity attempt"
        );
        let attempt = ctx.attempt;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), handler.invoke(ctx, input)).await {
            Ok(Ok(output)) => AttemptResult::success(output),
            Ok(Err(ActivityError::Permanent(msg))) => AttemptResult {
                outcome: StepOutcome::FatalFailure,
                output: None,
                error: Some(msg),
                timed_out: false,
            },
            Ok(Err(ActivityError::Transient(msg))) => {
                let outcome = if policy.attempts_exhausted(attempt) {
                    StepOutcome::FatalFailure
                } else {
                    StepOutcome::RetryableFailure
                };
                AttemptResult {
                    outcome,
                    output: None,
                    error: Some(msg),
                    timed_out: false,
                }
            }
            Err(_elapsed) => {
                let outcome = if policy.attempts_exhausted(attempt) {
                    StepOutcome::FatalFailure
                } else {
                    StepOutcome::RetryableFailure
                };
                AttemptResult {
                    outcome,
                    output: None,
                    error: Some(format!("attempt timed out after {timeout_ms}ms")),
                    timed_out: true,
                }
            }
        }
    }
}
