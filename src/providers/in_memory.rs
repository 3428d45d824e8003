use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{ExecutionStore, StoreError};
use crate::{TimerEntry, WorkflowExecution};

/// In-memory store. Durable only for the lifetime of the process; used by
/// tests and local development.
#[derive(Default)]
pub struct InMemoryStore {
    executions: Mutex<HashMap<String, WorkflowExecution>>,
    timers: Mutex<HashMap<String, TimerEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ExecutionStore for InMemoryStore {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.executions
            .lock()
            .await
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn load_execution(&self, execution_id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.executions.lock().await.get(execution_id).cloned())
    }

    async fn find_by_dedupe_key(&self, dedupe_key: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self
            .executions
            .lock()
            .await
            .values()
            .find(|e| e.dedupe_key == dedupe_key && !e.is_terminal())
            .cloned())
    }

    async fn list_non_terminal(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut out: Vec<WorkflowExecution> = self
            .executions
            .lock()
            .await
            .values()
            .filter(|e| !e.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at_ms);
        Ok(out)
    }

    async fn save_timer(&self, timer: &TimerEntry) -> Result<(), StoreError> {
        self.timers
            .lock()
            .await
            .insert(timer.execution_id.clone(), timer.clone());
        Ok(())
    }

    async fn remove_timer(&self, execution_id: &str) -> Result<(), StoreError> {
        self.timers.lock().await.remove(execution_id);
        Ok(())
    }

    async fn pending_timer(&self, execution_id: &str) -> Result<Option<TimerEntry>, StoreError> {
        Ok(self.timers.lock().await.get(execution_id).cloned())
    }

    async fn load_pending_timers(&self) -> Result<Vec<TimerEntry>, StoreError> {
        let mut out: Vec<TimerEntry> = self.timers.lock().await.values().cloned().collect();
        out.sort_by_key(|t| t.fire_at_ms);
        Ok(out)
    }
}
