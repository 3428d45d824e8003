use crate::{TimerEntry, WorkflowExecution};

/// Storage abstraction for execution progress and durable timers.
///
/// All mutations are single-row read-modify-write operations keyed by
/// execution id; the store never transacts across executions.
#[async_trait::async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or replace the execution row.
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;
    /// Load one execution by id.
    async fn load_execution(&self, execution_id: &str) -> Result<Option<WorkflowExecution>, StoreError>;
    /// Find a non-terminal execution holding the given dedupe key.
    async fn find_by_dedupe_key(&self, dedupe_key: &str) -> Result<Option<WorkflowExecution>, StoreError>;
    /// Enumerate all non-terminal executions (crash recovery).
    async fn list_non_terminal(&self) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Persist a timer. At most one pending timer per execution; a second
    /// save replaces the first.
    async fn save_timer(&self, timer: &TimerEntry) -> Result<(), StoreError>;
    /// Remove the pending timer for an execution. Removing a missing timer
    /// is not an error (fire and cancel can race).
    async fn remove_timer(&self, execution_id: &str) -> Result<(), StoreError>;
    /// The pending timer for an execution, if any.
    async fn pending_timer(&self, execution_id: &str) -> Result<Option<TimerEntry>, StoreError>;
    /// All pending timers, ordered by `fire_at_ms` ascending.
    async fn load_pending_timers(&self) -> Result<Vec<TimerEntry>, StoreError>;
}

/// In-memory store for tests and local development.
pub mod in_memory;
/// SQLite-backed store for durable deployments.
pub mod sqlite;

/// Store error with retry classification.
///
/// Retryable errors (locks, timeouts, connection failures) may succeed on a
/// later attempt; permanent errors (corruption, serialization) will not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// Operation that failed (e.g. "save_execution").
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl StoreError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for StoreError {}
