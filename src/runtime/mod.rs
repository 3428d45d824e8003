//! Engine: submits, drives, recovers, and cancels workflow executions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::providers::ExecutionStore;
use crate::workflows::{ExitCondition, StepDef};
use crate::{
    now_ms, EngineError, ExecutionStatus, StepOutcome, StepRecord, TimerEntry, WorkflowExecution, WorkflowType,
};

pub mod activity;
pub mod registry;
pub mod timers;

use activity::{ActivityContext, ActivityExecutor, ActivityRegistry};
use registry::WorkflowRegistry;
use timers::{TimerCommand, TimerService, WakeUp};

/// Configuration options for the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Size of the worker pool bounding concurrent in-flight activity
    /// attempts. Parked executions (durable sleeps, retry backoff) hold no
    /// slot.
    pub worker_slots: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { worker_slots: 8 }
    }
}

/// Notified once per execution when it reaches a terminal status. The CRUD
/// service layer consumes this to update user-facing namespace/invoice
/// state.
#[async_trait]
pub trait CompletionListener: Send + Sync {
    async fn on_complete(&self, execution: &WorkflowExecution);
}

/// Durable orchestration engine.
///
/// Owns persistence of execution progress; steps through registered
/// workflow definitions, invoking the activity executor per step and the
/// timer service for durable waits and retry backoff. All engine entry
/// points are idempotent against replays and crash recovery.
pub struct Engine {
    store: Arc<dyn ExecutionStore>,
    workflows: WorkflowRegistry,
    executor: ActivityExecutor,
    timer_tx: tokio::sync::mpsc::UnboundedSender<TimerCommand>,
    wake_tx: tokio::sync::mpsc::UnboundedSender<WakeUp>,
    /// Serializes the dedupe check-and-insert in `submit`.
    submit_gate: Mutex<()>,
    /// Per-namespace advisory locks: namespace id -> owning execution id.
    namespace_locks: Mutex<HashMap<String, String>>,
    /// Executions currently being driven by a task; guards re-entrant `run`.
    active: Mutex<HashSet<String>>,
    /// Cancellations requested since the owning task last loaded its row.
    cancels: Mutex<HashSet<String>>,
    listener: Option<Arc<dyn CompletionListener>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Start an engine and recover all non-terminal executions.
    pub async fn start(
        store: Arc<dyn ExecutionStore>,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
        options: EngineOptions,
    ) -> Arc<Self> {
        Self::start_with_listener(store, workflows, activities, options, None).await
    }

    /// Start an engine with a completion listener.
    pub async fn start_with_listener(
        store: Arc<dyn ExecutionStore>,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
        options: EngineOptions,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let (wake_tx, mut wake_rx) = tokio::sync::mpsc::unbounded_channel::<WakeUp>();
        let (timer_join, timer_tx) = TimerService::start(store.clone(), wake_tx.clone());

        let engine = Arc::new(Self {
            store,
            workflows,
            executor: ActivityExecutor::new(activities, options.worker_slots),
            timer_tx,
            wake_tx,
            submit_gate: Mutex::new(()),
            namespace_locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            cancels: Mutex::new(HashSet::new()),
            listener,
            joins: Mutex::new(Vec::new()),
        });

        // Wake dispatcher: timer fires re-enter parked executions. Wakes
        // are applied one at a time; concurrent handlers for the same
        // execution could double-record a completed sleep.
        let dispatcher = {
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(wake) = wake_rx.recv().await {
                    if let Err(e) = engine.handle_wake(wake).await {
                        warn!(error = %e, "wake handling failed");
                    }
                }
            })
        };
        engine.joins.lock().await.push(dispatcher);
        engine.joins.lock().await.push(timer_join);

        engine.recover().await;
        engine
    }

    /// Submit a workflow request; returns the new execution id.
    ///
    /// Fails with `DuplicateSubmission` when a non-terminal execution holds
    /// the same dedupe key, and with `NamespaceBusy` when another
    /// non-terminal execution owns the target namespace.
    pub async fn submit(
        self: &Arc<Self>,
        workflow_type: WorkflowType,
        input: Value,
        dedupe_key: &str,
    ) -> Result<String, EngineError> {
        if !self.workflows.has(workflow_type) {
            return Err(EngineError::UnknownWorkflow(workflow_type));
        }
        // Held until the row is saved; two concurrent submits with one
        // dedupe key must not both pass the check.
        let _gate = self.submit_gate.lock().await;
        if let Some(existing) = self.store.find_by_dedupe_key(dedupe_key).await? {
            return Err(EngineError::DuplicateSubmission {
                dedupe_key: dedupe_key.to_string(),
                existing: existing.id,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let namespace_id = namespace_key(workflow_type, &input);

        if let Some(ns) = &namespace_id {
            let mut locks = self.namespace_locks.lock().await;
            if let Some(holder) = locks.get(ns) {
                return Err(EngineError::NamespaceBusy {
                    namespace_id: ns.clone(),
                    held_by: holder.clone(),
                });
            }
            locks.insert(ns.clone(), id.clone());
        }

        let execution = WorkflowExecution::new(id.clone(), workflow_type, input, dedupe_key, namespace_id.clone());
        if let Err(e) = self.store.save_execution(&execution).await {
            if let Some(ns) = &namespace_id {
                self.namespace_locks.lock().await.remove(ns);
            }
            return Err(e.into());
        }

        info!(execution = %id, workflow = %workflow_type, dedupe_key, "submitted");
        self.spawn_run(id.clone());
        Ok(id)
    }

    /// Current state of an execution.
    pub async fn get_status(&self, execution_id: &str) -> Result<WorkflowExecution, EngineError> {
        self.store
            .load_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(execution_id.to_string()))
    }

    /// Request cancellation. Takes effect between steps; a dispatched
    /// activity attempt runs to completion or its own timeout.
    pub async fn cancel(self: &Arc<Self>, execution_id: &str) -> Result<(), EngineError> {
        let mut execution = self
            .store
            .load_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(execution_id.to_string()))?;
        if execution.is_terminal() {
            return Ok(());
        }
        execution.cancel_requested = true;
        execution.updated_at_ms = now_ms();
        self.store.save_execution(&execution).await?;
        self.cancels.lock().await.insert(execution_id.to_string());

        // Unpark if waiting on a durable timer.
        if self.store.pending_timer(execution_id).await?.is_some() {
            let _ = self.timer_tx.send(TimerCommand::Cancel {
                execution_id: execution_id.to_string(),
            });
            self.store.remove_timer(execution_id).await?;
            let _ = self.wake_tx.send(WakeUp {
                execution_id: execution_id.to_string(),
                resume_step_index: execution.current_step_index,
            });
        }
        info!(execution = %execution_id, "cancellation requested");
        Ok(())
    }

    /// Drive an execution forward. Idempotent: terminal executions are a
    /// no-op, completed steps are never re-executed, and a concurrent call
    /// for the same id returns immediately.
    pub async fn run(self: Arc<Self>, execution_id: String) -> Result<(), EngineError> {
        if !self.active.lock().await.insert(execution_id.clone()) {
            return Ok(());
        }
        let result = self.drive(&execution_id).await;
        self.active.lock().await.remove(&execution_id);
        result
    }

    fn spawn_run(self: &Arc<Self>, execution_id: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            let id = execution_id.clone();
            if let Err(e) = engine.run(execution_id).await {
                warn!(execution = %id, error = %e, "run failed");
            }
        });
    }

    /// Reload all non-terminal executions and re-enter them (crash
    /// recovery). Namespace locks are re-derived from the persisted rows.
    async fn recover(self: &Arc<Self>) {
        let pending = match self.store.list_non_terminal().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "recovery scan failed");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "recovering non-terminal executions");
        let mut locks = self.namespace_locks.lock().await;
        for execution in &pending {
            if let Some(ns) = &execution.namespace_id {
                locks.entry(ns.clone()).or_insert_with(|| execution.id.clone());
            }
        }
        drop(locks);
        for execution in pending {
            self.spawn_run(execution.id);
        }
    }

    async fn handle_wake(self: &Arc<Self>, wake: WakeUp) -> Result<(), EngineError> {
        let Some(mut execution) = self.store.load_execution(&wake.execution_id).await? else {
            self.store.remove_timer(&wake.execution_id).await?;
            return Ok(());
        };
        if execution.is_terminal() {
            self.store.remove_timer(&wake.execution_id).await?;
            return Ok(());
        }

        // A wake past the current index completes a durable sleep step.
        if wake.resume_step_index > execution.current_step_index {
            let step_index = execution.current_step_index;
            if let Some(def) = self.workflows.get(execution.workflow_type) {
                if let Some(StepDef::Sleep { name, .. }) = def.step(step_index) {
                    let now = now_ms();
                    execution.history.push(StepRecord {
                        step_name: name.to_string(),
                        attempt: 1,
                        started_at_ms: now,
                        finished_at_ms: now,
                        outcome: StepOutcome::Success,
                        error: None,
                        idempotency_key: format!("{}:{}:{}", execution.id, step_index, name),
                        output: None,
                    });
                }
            }
            execution.current_step_index = wake.resume_step_index;
            execution.updated_at_ms = now_ms();
            self.store.save_execution(&execution).await?;
        }
        // Remove the timer only after the resume is recorded; a crash in
        // between replays the wake instead of losing it.
        self.store.remove_timer(&wake.execution_id).await?;
        self.spawn_run(wake.execution_id);
        Ok(())
    }

    async fn drive(self: &Arc<Self>, execution_id: &str) -> Result<(), EngineError> {
        let Some(mut execution) = self.store.load_execution(execution_id).await? else {
            return Err(EngineError::NotFound(execution_id.to_string()));
        };
        if execution.is_terminal() {
            return Ok(());
        }
        // Parked on a durable timer; the wake will re-enter.
        if !execution.cancel_requested && self.store.pending_timer(execution_id).await?.is_some() {
            return Ok(());
        }
        let Some(definition) = self.workflows.get(execution.workflow_type) else {
            warn!(execution = %execution_id, workflow = %execution.workflow_type, "unregistered workflow");
            let msg = format!("unregistered workflow: {}", execution.workflow_type);
            self.finish(&mut execution, ExecutionStatus::Failed, Some(msg)).await?;
            return Ok(());
        };

        loop {
            if execution.cancel_requested || self.cancels.lock().await.contains(&execution.id) {
                self.finish(&mut execution, ExecutionStatus::Failed, Some("cancelled".to_string()))
                    .await?;
                return Ok(());
            }
            let Some(step) = definition.step(execution.current_step_index).cloned() else {
                self.finish(&mut execution, ExecutionStatus::Completed, None).await?;
                return Ok(());
            };

            match step {
                StepDef::Sleep { name, delay_ms } => {
                    let timer = TimerEntry {
                        execution_id: execution.id.clone(),
                        fire_at_ms: now_ms() + delay_ms,
                        resume_step_index: execution.current_step_index + 1,
                    };
                    // Persisted before armed: a crash after this point
                    // cannot lose the wake-up.
                    self.store.save_timer(&timer).await?;
                    let _ = self.timer_tx.send(TimerCommand::Arm(timer));
                    debug!(execution = %execution.id, step = name, delay_ms, "parked on durable sleep");
                    return Ok(());
                }
                StepDef::Activity(astep) => {
                    if let Some(guard) = &astep.guard {
                        if !guard.allows(&execution.input) {
                            debug!(execution = %execution.id, step = astep.name, "step skipped by guard");
                            execution.current_step_index += 1;
                            execution.updated_at_ms = now_ms();
                            self.store.save_execution(&execution).await?;
                            continue;
                        }
                    }

                    let attempt = execution.attempts_for(astep.name) + 1;
                    let key = format!("{}:{}:{}", execution.id, execution.current_step_index, astep.name);
                    let ctx = ActivityContext {
                        execution_id: execution.id.clone(),
                        step_name: astep.name.to_string(),
                        idempotency_key: key.clone(),
                        attempt,
                    };
                    let input = step_input(&execution, astep.params.as_ref(), None);
                    let started = now_ms();
                    let result = self
                        .executor
                        .execute(astep.activity, ctx, input, &astep.policy, astep.timeout_ms)
                        .await;
                    execution.history.push(StepRecord {
                        step_name: astep.name.to_string(),
                        attempt,
                        started_at_ms: started,
                        finished_at_ms: now_ms(),
                        outcome: result.outcome,
                        error: result.error.clone(),
                        idempotency_key: key,
                        output: result.output.clone(),
                    });

                    match result.outcome {
                        StepOutcome::Success => {
                            if astep.exit_when == Some(ExitCondition::WhenTrue)
                                && result.output == Some(Value::Bool(true))
                            {
                                info!(execution = %execution.id, step = astep.name, "typed exit condition met");
                                self.finish(&mut execution, ExecutionStatus::Completed, None).await?;
                                return Ok(());
                            }
                            execution.current_step_index += 1;
                            execution.updated_at_ms = now_ms();
                            self.store.save_execution(&execution).await?;
                        }
                        StepOutcome::RetryableFailure => {
                            execution.updated_at_ms = now_ms();
                            self.store.save_execution(&execution).await?;
                            let delay = astep.policy.backoff_for(attempt);
                            let timer = TimerEntry {
                                execution_id: execution.id.clone(),
                                fire_at_ms: now_ms() + delay,
                                resume_step_index: execution.current_step_index,
                            };
                            self.store.save_timer(&timer).await?;
                            let _ = self.timer_tx.send(TimerCommand::Arm(timer));
                            warn!(
                                execution = %execution.id,
                                step = astep.name,
                                attempt,
                                backoff_ms = delay,
                                error = result.error.as_deref().unwrap_or(""),
                                "retry scheduled"
                            );
                            return Ok(());
                        }
                        StepOutcome::FatalFailure => match astep.failure_mode {
                            crate::workflows::FailureMode::SoftContinue => {
                                warn!(
                                    execution = %execution.id,
                                    step = astep.name,
                                    error = result.error.as_deref().unwrap_or(""),
                                    "best-effort step failed; continuing"
                                );
                                execution.current_step_index += 1;
                                execution.updated_at_ms = now_ms();
                                self.store.save_execution(&execution).await?;
                            }
                            crate::workflows::FailureMode::HardStop => {
                                let status = if result.timed_out {
                                    ExecutionStatus::TimedOut
                                } else {
                                    ExecutionStatus::Failed
                                };
                                self.finish(&mut execution, status, result.error).await?;
                                return Ok(());
                            }
                        },
                    }
                }
                StepDef::FanOut {
                    name,
                    source_step,
                    item_activity,
                    policy,
                    timeout_ms,
                } => {
                    let items: Vec<String> = match execution
                        .step_output(source_step)
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                    {
                        Some(items) => items,
                        None => {
                            self.finish(
                                &mut execution,
                                ExecutionStatus::Failed,
                                Some(format!("fan-out source {source_step} produced no list")),
                            )
                            .await?;
                            return Ok(());
                        }
                    };

                    let started = now_ms();
                    let mut failed: Vec<String> = Vec::new();
                    for item in &items {
                        let key = format!("{}:{}:{}:{}", execution.id, execution.current_step_index, name, item);
                        let ctx = ActivityContext {
                            execution_id: execution.id.clone(),
                            step_name: name.to_string(),
                            idempotency_key: key,
                            attempt: 1,
                        };
                        let input = step_input(&execution, None, Some(item));
                        let r = self.executor.execute(item_activity, ctx, input, &policy, timeout_ms).await;
                        if r.outcome != StepOutcome::Success {
                            // Per-item failures are isolated from siblings.
                            warn!(
                                execution = %execution.id,
                                step = name,
                                item = %item,
                                error = r.error.as_deref().unwrap_or(""),
                                "fan-out item failed"
                            );
                            failed.push(item.clone());
                        }
                    }
                    execution.history.push(StepRecord {
                        step_name: name.to_string(),
                        attempt: 1,
                        started_at_ms: started,
                        finished_at_ms: now_ms(),
                        outcome: StepOutcome::Success,
                        error: None,
                        idempotency_key: format!("{}:{}:{}", execution.id, execution.current_step_index, name),
                        output: Some(json!({
                            "processed": items.len() - failed.len(),
                            "failed": failed,
                        })),
                    });
                    execution.current_step_index += 1;
                    execution.updated_at_ms = now_ms();
                    self.store.save_execution(&execution).await?;
                }
            }
        }
    }

    /// Terminal transition: persist, release the namespace lock, clear any
    /// timer, notify the listener.
    async fn finish(
        self: &Arc<Self>,
        execution: &mut WorkflowExecution,
        status: ExecutionStatus,
        failure: Option<String>,
    ) -> Result<(), EngineError> {
        execution.status = status;
        execution.failure = failure;
        execution.updated_at_ms = now_ms();
        self.store.save_execution(execution).await?;

        if let Some(ns) = &execution.namespace_id {
            let mut locks = self.namespace_locks.lock().await;
            if locks.get(ns) == Some(&execution.id) {
                locks.remove(ns);
            }
        }
        let _ = self.timer_tx.send(TimerCommand::Cancel {
            execution_id: execution.id.clone(),
        });
        self.store.remove_timer(&execution.id).await?;
        self.cancels.lock().await.remove(&execution.id);

        info!(
            execution = %execution.id,
            workflow = %execution.workflow_type,
            status = status.as_str(),
            error = execution.failure.as_deref().unwrap_or(""),
            "execution finished"
        );
        if let Some(listener) = &self.listener {
            listener.on_complete(execution).await;
        }
        Ok(())
    }

    /// Abort background tasks.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }
}

/// Advisory-lock key: namespace workflows serialize on the namespace id.
fn namespace_key(workflow_type: WorkflowType, input: &Value) -> Option<String> {
    match workflow_type {
        WorkflowType::NamespaceProvision
        | WorkflowType::NamespaceUpdate
        | WorkflowType::NamespaceDelete
        | WorkflowType::NamespaceFailover => input
            .get("namespace_id")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// Input envelope handed to an activity: the workflow's input, the outputs
/// of completed steps keyed by step name, optional static step params, and
/// the fan-out item when applicable.
fn step_input(execution: &WorkflowExecution, params: Option<&Value>, item: Option<&str>) -> Value {
    json!({
        "workflow": execution.input,
        "steps": Value::Object(execution.step_outputs()),
        "params": params.cloned().unwrap_or(Value::Null),
        "item": item.map(|s| Value::String(s.to_string())).unwrap_or(Value::Null),
    })
}
