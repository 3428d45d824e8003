//! Step-table vocabulary and the control plane's workflow definitions.
//!
//! A workflow definition is a pure sequence description: the engine walks
//! the table, one step at a time, persisting progress between steps. Long
//! durations (drain waits, invoice finalization, dunning checkpoints) come
//! from [`EngineTimings`] so tests can compress days to milliseconds without
//! changing the tables' shape.

use serde_json::Value;

use crate::runtime::registry::WorkflowRegistry;
use crate::RetryPolicy;

pub mod billing;
pub mod namespace;

/// What a step failure does to the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Failure terminates the execution as Failed.
    HardStop,
    /// Failure is recorded and logged; the engine proceeds to the next step.
    SoftContinue,
}

/// Typed data-dependent exit attached to an activity step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCondition {
    /// Complete the execution early when the activity's output is `true`
    /// (Dunning's check-paid loop exit).
    WhenTrue,
}

/// Guard deciding whether a step runs at all for a given input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepGuard {
    /// Run only when the named workflow-input field is `true`
    /// (HA-gated standby setup).
    InputFlag(&'static str),
}

impl StepGuard {
    pub fn allows(&self, input: &Value) -> bool {
        match self {
            StepGuard::InputFlag(field) => input.get(*field).and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

/// An activity step: one idempotent external call with retry and timeout.
#[derive(Debug, Clone)]
pub struct ActivityStep {
    /// Unique step name within the definition; also the history key.
    pub name: &'static str,
    /// Registered activity to invoke. Usually equals `name`; differs when
    /// the same activity appears in several steps (dunning rounds).
    pub activity: &'static str,
    pub failure_mode: FailureMode,
    pub policy: RetryPolicy,
    pub timeout_ms: u64,
    pub exit_when: Option<ExitCondition>,
    pub guard: Option<StepGuard>,
    /// Static parameters merged into the step's input under "params".
    pub params: Option<Value>,
}

impl ActivityStep {
    pub fn new(name: &'static str, failure_mode: FailureMode, policy: RetryPolicy, timeout_ms: u64) -> Self {
        Self {
            name,
            activity: name,
            failure_mode,
            policy,
            timeout_ms,
            exit_when: None,
            guard: None,
            params: None,
        }
    }

    pub fn with_activity(mut self, activity: &'static str) -> Self {
        self.activity = activity;
        self
    }

    pub fn with_exit(mut self, exit: ExitCondition) -> Self {
        self.exit_when = Some(exit);
        self
    }

    pub fn with_guard(mut self, guard: StepGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// One entry in a workflow's step table.
#[derive(Debug, Clone)]
pub enum StepDef {
    Activity(ActivityStep),
    /// Durable delay; holds no worker slot while waiting.
    Sleep { name: &'static str, delay_ms: u64 },
    /// Invoke `item_activity` once per element of the named source step's
    /// array output. Per-item failures are isolated and never abort
    /// siblings or the execution.
    FanOut {
        name: &'static str,
        source_step: &'static str,
        item_activity: &'static str,
        policy: RetryPolicy,
        timeout_ms: u64,
    },
}

impl StepDef {
    pub fn name(&self) -> &'static str {
        match self {
            StepDef::Activity(s) => s.name,
            StepDef::Sleep { name, .. } => name,
            StepDef::FanOut { name, .. } => name,
        }
    }
}

/// A named, ordered step table consumed by the engine.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub workflow_type: crate::WorkflowType,
    pub steps: Vec<StepDef>,
}

impl WorkflowDefinition {
    pub fn step(&self, index: usize) -> Option<&StepDef> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Tunable durations for the workflow tables.
///
/// Defaults mirror the production control plane; tests substitute
/// millisecond-scale values.
#[derive(Debug, Clone)]
pub struct EngineTimings {
    /// Base per-attempt activity timeout (delete uses 2x, aggregation 6x).
    pub activity_timeout_ms: u64,
    /// Initial retry backoff; policies cap at fixed multiples of this.
    pub retry_initial_interval_ms: u64,
    /// Drain wait between deprecating a namespace and tearing it down.
    pub drain_delay_ms: u64,
    /// Wait for Stripe to finalize the invoice before emailing it.
    pub invoice_finalize_delay_ms: u64,
    /// Dunning checkpoints, relative to the previous one (day 3/7/14).
    pub dunning_schedule_ms: [u64; 3],
}

impl Default for EngineTimings {
    fn default() -> Self {
        const DAY_MS: u64 = 24 * 60 * 60 * 1_000;
        Self {
            activity_timeout_ms: 5 * 60 * 1_000,
            retry_initial_interval_ms: 1_000,
            drain_delay_ms: 5 * 60 * 1_000,
            invoice_finalize_delay_ms: DAY_MS,
            dunning_schedule_ms: [3 * DAY_MS, 7 * DAY_MS, 14 * DAY_MS],
        }
    }
}

impl EngineTimings {
    /// Millisecond-scale timings for tests.
    pub fn fast() -> Self {
        Self {
            activity_timeout_ms: 2_000,
            retry_initial_interval_ms: 5,
            drain_delay_ms: 20,
            invoice_finalize_delay_ms: 20,
            dunning_schedule_ms: [20, 20, 20],
        }
    }
}

/// 5 attempts, capped at 60x the initial interval (provisioning, billing).
pub fn standard_retry(t: &EngineTimings) -> RetryPolicy {
    RetryPolicy {
        initial_interval_ms: t.retry_initial_interval_ms,
        backoff_coefficient: 2.0,
        maximum_interval_ms: t.retry_initial_interval_ms * 60,
        maximum_attempts: 5,
    }
}

/// 3 attempts, capped at 60x (deletion, dunning).
pub fn short_retry(t: &EngineTimings) -> RetryPolicy {
    RetryPolicy {
        maximum_attempts: 3,
        ..standard_retry(t)
    }
}

/// 3 attempts, capped at 30x (failover wants faster convergence).
pub fn failover_retry(t: &EngineTimings) -> RetryPolicy {
    RetryPolicy {
        initial_interval_ms: t.retry_initial_interval_ms,
        backoff_coefficient: 2.0,
        maximum_interval_ms: t.retry_initial_interval_ms * 30,
        maximum_attempts: 3,
    }
}

/// 3 attempts, capped at 300x (bulk aggregation tolerates long waits).
pub fn bulk_retry(t: &EngineTimings) -> RetryPolicy {
    RetryPolicy {
        initial_interval_ms: t.retry_initial_interval_ms,
        backoff_coefficient: 2.0,
        maximum_interval_ms: t.retry_initial_interval_ms * 300,
        maximum_attempts: 3,
    }
}

/// Registry holding all seven control-plane workflow definitions.
pub fn control_plane_registry(timings: &EngineTimings) -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register(namespace::provision_definition(timings))
        .register(namespace::update_definition(timings))
        .register(namespace::delete_definition(timings))
        .register(namespace::failover_definition(timings))
        .register(billing::billing_cycle_definition(timings))
        .register(billing::dunning_definition(timings))
        .register(billing::usage_aggregation_definition(timings))
        .build()
}
