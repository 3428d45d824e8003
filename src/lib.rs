//! Durable orchestration engine for a managed-namespace control plane.
//!
//! Workflow definitions are deterministic step tables executed by the
//! [`runtime::Engine`]. Progress is persisted after every step through an
//! [`providers::ExecutionStore`], so a process restart re-enters every
//! non-terminal execution exactly where it left off. Transient failures are
//! retried with exponential backoff scheduled through the durable
//! [`runtime::timers::TimerService`] rather than in-process sleeps, which is
//! also how multi-day waits (invoice finalization, dunning checkpoints)
//! survive restarts.

use serde::{Deserialize, Serialize};

pub mod billing;
pub mod capabilities;
pub mod providers;
pub mod runtime;
pub mod workflows;

pub use providers::StoreError;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The workflow definitions known to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowType {
    NamespaceProvision,
    NamespaceUpdate,
    NamespaceDelete,
    NamespaceFailover,
    BillingCycle,
    Dunning,
    UsageAggregation,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::NamespaceProvision => "NamespaceProvision",
            WorkflowType::NamespaceUpdate => "NamespaceUpdate",
            WorkflowType::NamespaceDelete => "NamespaceDelete",
            WorkflowType::NamespaceFailover => "NamespaceFailover",
            WorkflowType::BillingCycle => "BillingCycle",
            WorkflowType::Dunning => "Dunning",
            WorkflowType::UsageAggregation => "UsageAggregation",
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::TimedOut => "TimedOut",
        }
    }
}

/// Outcome of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// One executed attempt of a step, retained in the execution history.
///
/// All attempts of the same step carry the same `idempotency_key`, so the
/// external collaborator can deduplicate the side effect even when the
/// engine retries after a crash mid-call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_name: String,
    /// 1-based attempt counter.
    pub attempt: u32,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub outcome: StepOutcome,
    pub error: Option<String>,
    pub idempotency_key: String,
    /// Output of a successful attempt; later steps read it by step name.
    pub output: Option<serde_json::Value>,
}

/// Per-step retry configuration.
///
/// Backoff for attempt `n` (1-based) is
/// `min(initial * coefficient^(n-1), maximum)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub maximum_interval_ms: u64,
    /// 0 means unbounded.
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 60_000,
            maximum_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1);
        let raw = self.initial_interval_ms as f64 * self.backoff_coefficient.powi(exp as i32);
        if !raw.is_finite() || raw >= self.maximum_interval_ms as f64 {
            self.maximum_interval_ms
        } else {
            raw as u64
        }
    }

    /// Whether `attempt` (1-based) was the last permitted attempt.
    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        self.maximum_attempts != 0 && attempt >= self.maximum_attempts
    }
}

/// A durable delayed wake request for a parked execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEntry {
    pub execution_id: String,
    /// Absolute wall-clock fire time. Entries already in the past at engine
    /// startup fire immediately, oldest first.
    pub fire_at_ms: u64,
    /// Step index the execution resumes at when the timer fires.
    pub resume_step_index: usize,
}

/// States of the namespace lifecycle, driven only by completed workflow steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceState {
    Pending,
    Active,
    Updating,
    Deleting,
    Deleted,
    FailingOver,
}

impl NamespaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceState::Pending => "pending",
            NamespaceState::Active => "active",
            NamespaceState::Updating => "updating",
            NamespaceState::Deleting => "deleting",
            NamespaceState::Deleted => "deleted",
            NamespaceState::FailingOver => "failing_over",
        }
    }
}

/// One durable run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_type: WorkflowType,
    pub input: serde_json::Value,
    /// Client-supplied key guarding against double submission.
    pub dedupe_key: String,
    /// Advisory-lock key; set for workflows that own a namespace.
    pub namespace_id: Option<String>,
    pub status: ExecutionStatus,
    /// Index of the next step to execute. Monotonically non-decreasing.
    pub current_step_index: usize,
    pub history: Vec<StepRecord>,
    /// Checked between steps; a dispatched attempt runs to its own timeout.
    pub cancel_requested: bool,
    /// Error that drove a terminal Failed/TimedOut transition.
    pub failure: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl WorkflowExecution {
    pub fn new(
        id: impl Into<String>,
        workflow_type: WorkflowType,
        input: serde_json::Value,
        dedupe_key: impl Into<String>,
        namespace_id: Option<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            workflow_type,
            input,
            dedupe_key: dedupe_key.into(),
            namespace_id,
            status: ExecutionStatus::Running,
            current_step_index: 0,
            history: Vec::new(),
            cancel_requested: false,
            failure: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of attempts already recorded for a step.
    pub fn attempts_for(&self, step_name: &str) -> u32 {
        self.history.iter().filter(|r| r.step_name == step_name).count() as u32
    }

    /// Output of the successful attempt of a step, if any.
    pub fn step_output(&self, step_name: &str) -> Option<&serde_json::Value> {
        self.history
            .iter()
            .rev()
            .find(|r| r.step_name == step_name && r.outcome == StepOutcome::Success)
            .and_then(|r| r.output.as_ref())
    }

    /// JSON object mapping step names to successful outputs, fed to activities.
    pub fn step_outputs(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for r in &self.history {
            if r.outcome == StepOutcome::Success {
                if let Some(out) = &r.output {
                    map.insert(r.step_name.clone(), out.clone());
                }
            }
        }
        map
    }
}

/// Errors surfaced by the engine's public API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A non-terminal execution already holds this dedupe key.
    DuplicateSubmission { dedupe_key: String, existing: String },
    /// Another non-terminal execution owns this namespace id.
    NamespaceBusy { namespace_id: String, held_by: String },
    NotFound(String),
    UnknownWorkflow(WorkflowType),
    Store(StoreError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::DuplicateSubmission { dedupe_key, existing } => {
                write!(f, "duplicate submission: key {dedupe_key} held by execution {existing}")
            }
            EngineError::NamespaceBusy { namespace_id, held_by } => {
                write!(f, "namespace {namespace_id} busy: owned by execution {held_by}")
            }
            EngineError::NotFound(id) => write!(f, "execution not found: {id}"),
            EngineError::UnknownWorkflow(wt) => write!(f, "unregistered workflow: {wt}"),
            EngineError::Store(e) => write!(f, "store: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy {
            initial_interval_ms: 100,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 1_000,
            maximum_attempts: 5,
        };
        assert_eq!(p.backoff_for(1), 100);
        assert_eq!(p.backoff_for(2), 200);
        assert_eq!(p.backoff_for(3), 400);
        assert_eq!(p.backoff_for(4), 800);
        // attempt 5 would be 1600, capped
        assert_eq!(p.backoff_for(5), 1_000);
        assert_eq!(p.backoff_for(50), 1_000);
    }

    #[test]
    fn zero_max_attempts_is_unbounded() {
        let p = RetryPolicy {
            maximum_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(!p.attempts_exhausted(1));
        assert!(!p.attempts_exhausted(1_000));
    }

    #[test]
    fn attempts_exhausted_at_limit() {
        let p = RetryPolicy {
            maximum_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(!p.attempts_exhausted(2));
        assert!(p.attempts_exhausted(3));
        assert!(p.attempts_exhausted(4));
    }

    #[test]
    fn step_output_reads_latest_success() {
        let mut exec = WorkflowExecution::new(
            "e1",
            WorkflowType::NamespaceProvision,
            serde_json::json!({}),
            "k1",
            None,
        );
        exec.history.push(StepRecord {
            step_name: "select-cluster".into(),
            attempt: 1,
            started_at_ms: 0,
            finished_at_ms: 1,
            outcome: StepOutcome::RetryableFailure,
            error: Some("transient".into()),
            idempotency_key: "e1:0:select-cluster".into(),
            output: None,
        });
        exec.history.push(StepRecord {
            step_name: "select-cluster".into(),
            attempt: 2,
            started_at_ms: 2,
            finished_at_ms: 3,
            outcome: StepOutcome::Success,
            error: None,
            idempotency_key: "e1:0:select-cluster".into(),
            output: Some(serde_json::json!("cluster-eu-001")),
        });
        assert_eq!(exec.attempts_for("select-cluster"), 2);
        assert_eq!(
            exec.step_output("select-cluster"),
            Some(&serde_json::json!("cluster-eu-001"))
        );
        assert!(exec.step_output("gen-certs").is_none());
        // Both attempts share the idempotency key
        assert_eq!(exec.history[0].idempotency_key, exec.history[1].idempotency_key);
    }
}
