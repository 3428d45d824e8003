use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{ExecutionStore, StoreError};
use crate::{TimerEntry, WorkflowExecution};

/// SQLite-backed store with WAL journaling for file databases.
///
/// Executions are stored as a JSON body plus indexed columns for the fields
/// the engine queries (status, dedupe key). Timers get one row per
/// execution, keyed on execution id.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Classify an sqlx error. Locks and connection trouble are retryable;
    /// constraint violations are permanent.
    fn sqlx_to_store_error(operation: &str, e: sqlx::Error) -> StoreError {
        let msg = e.to_string();
        if msg.contains("database is locked") || msg.contains("SQLITE_BUSY") {
            return StoreError::retryable(operation, format!("database locked: {msg}"));
        }
        if msg.contains("UNIQUE constraint") || msg.contains("PRIMARY KEY") {
            return StoreError::permanent(operation, format!("constraint violation: {msg}"));
        }
        if msg.contains("connection") || msg.contains("timeout") {
            return StoreError::retryable(operation, format!("connection error: {msg}"));
        }
        StoreError::retryable(operation, msg)
    }

    /// Open a store at `database_url` (e.g. "sqlite:cloudplane.db").
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Shared-cache in-memory store so the pool's connections see one DB.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:?cache=shared").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                dedupe_key TEXT NOT NULL,
                workflow_type TEXT NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_dedupe ON executions(dedupe_key, status)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)")
            .execute(pool)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS timers (
                execution_id TEXT PRIMARY KEY,
                fire_at_ms INTEGER NOT NULL,
                resume_step_index INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    fn decode_execution(operation: &str, body: &str) -> Result<WorkflowExecution, StoreError> {
        serde_json::from_str(body)
            .map_err(|e| StoreError::permanent(operation, format!("corrupt execution body: {e}")))
    }
}

#[async_trait::async_trait]
impl ExecutionStore for SqliteStore {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let body = serde_json::to_string(execution)
            .map_err(|e| StoreError::permanent("save_execution", format!("serialize: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO executions (id, dedupe_key, workflow_type, status, body, created_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                body = excluded.body,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.dedupe_key)
        .bind(execution.workflow_type.as_str())
        .bind(execution.status.as_str())
        .bind(body)
        .bind(execution.created_at_ms as i64)
        .bind(execution.updated_at_ms as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("save_execution", e))?;
        Ok(())
    }

    async fn load_execution(&self, execution_id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query("SELECT body FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("load_execution", e))?;
        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(Self::decode_execution("load_execution", &body)?))
            }
            None => Ok(None),
        }
    }

    async fn find_by_dedupe_key(&self, dedupe_key: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query(
            "SELECT body FROM executions WHERE dedupe_key = ? AND status = 'Running' LIMIT 1",
        )
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("find_by_dedupe_key", e))?;
        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(Self::decode_execution("find_by_dedupe_key", &body)?))
            }
            None => Ok(None),
        }
    }

    async fn list_non_terminal(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM executions WHERE status = 'Running' ORDER BY created_at_ms ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("list_non_terminal", e))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.get("body");
            out.push(Self::decode_execution("list_non_terminal", &body)?);
        }
        Ok(out)
    }

    async fn save_timer(&self, timer: &TimerEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO timers (execution_id, fire_at_ms, resume_step_index)
            VALUES (?, ?, ?)
            ON CONFLICT(execution_id) DO UPDATE SET
                fire_at_ms = excluded.fire_at_ms,
                resume_step_index = excluded.resume_step_index
            "#,
        )
        .bind(&timer.execution_id)
        .bind(timer.fire_at_ms as i64)
        .bind(timer.resume_step_index as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("save_timer", e))?;
        Ok(())
    }

    async fn remove_timer(&self, execution_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM timers WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("remove_timer", e))?;
        Ok(())
    }

    async fn pending_timer(&self, execution_id: &str) -> Result<Option<TimerEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT execution_id, fire_at_ms, resume_step_index FROM timers WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("pending_timer", e))?;
        Ok(row.map(|row| TimerEntry {
            execution_id: row.get("execution_id"),
            fire_at_ms: row.get::<i64, _>("fire_at_ms") as u64,
            resume_step_index: row.get::<i64, _>("resume_step_index") as usize,
        }))
    }

    async fn load_pending_timers(&self) -> Result<Vec<TimerEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT execution_id, fire_at_ms, resume_step_index FROM timers ORDER BY fire_at_ms ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("load_pending_timers", e))?;
        Ok(rows
            .into_iter()
            .map(|row| TimerEntry {
                execution_id: row.get("execution_id"),
                fire_at_ms: row.get::<i64, _>("fire_at_ms") as u64,
                resume_step_index: row.get::<i64, _>("resume_step_index") as usize,
            })
            .collect())
    }
}
