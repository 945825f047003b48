//! SQLite-backed store with full transactional guarantees.
//!
//! Row-level locking via lock-token columns implements the visibility-timeout
//! leases; the workflow queue's primary key doubles as the queued-set, so an
//! `INSERT OR IGNORE` is the deduplicated enqueue. `complete_workflow_task`
//! is one transaction: the lease check and the history append cannot be
//! separated.

use std::time::{Duration, Instant};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, warn};

use super::{
    is_start_event, ActivityTask, Backend, BackendError, DiagnosticsBackend, InstanceRef,
    InstanceState, InstanceTreeNode, TaskKind, WorkflowEvent, WorkflowTask,
};
use crate::{now_ms, EventAttributes, HistoryEvent, ParentLink, WorkflowInstance};

const POLL_GRANULARITY: Duration = Duration::from_millis(10);

/// SQLite-backed [`Backend`].
pub struct SqliteBackend {
    pool: SqlitePool,
    visibility_timeout: Duration,
}

fn storage_err(operation: &str, e: sqlx::Error) -> BackendError {
    let retryable = match &e {
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    };
    BackendError::Storage {
        operation: operation.to_string(),
        message: e.to_string(),
        retryable,
    }
}

fn encode_event(event: &HistoryEvent) -> Result<String, BackendError> {
    serde_json::to_string(event).map_err(|e| BackendError::Serialization(e.to_string()))
}

fn decode_event(data: &str) -> Result<HistoryEvent, BackendError> {
    serde_json::from_str(data).map_err(|e| BackendError::Serialization(e.to_string()))
}

impl SqliteBackend {
    /// Connect and prepare the schema. Use `sqlite::memory:` for tests.
    pub async fn new(database_url: &str) -> Result<Self, BackendError> {
        Self::with_visibility_timeout(database_url, Duration::from_secs(30)).await
    }

    pub async fn with_visibility_timeout(
        database_url: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, BackendError> {
        // An in-memory database exists per connection; the pool must stay at
        // one connection for the schema to be shared.
        let max_connections = if database_url.contains(":memory:") || database_url.contains("mode=memory") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| storage_err("connect", e))?;
        Self::create_schema(&pool)
            .await
            .map_err(|e| storage_err("create_schema", e))?;
        Ok(Self {
            pool,
            visibility_timeout,
        })
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                parent_instance_id TEXT,
                parent_execution_id TEXT,
                parent_schedule_event_id INTEGER,
                created_at_ms INTEGER NOT NULL,
                completed_at_ms INTEGER,
                PRIMARY KEY (instance_id, execution_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS latest_executions (
                instance_id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                sequence_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                PRIMARY KEY (instance_id, execution_id, sequence_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                schedule_event_id INTEGER,
                visible_at_ms INTEGER,
                event_data TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_queue (
                instance_id TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                lock_token TEXT,
                locked_until_ms INTEGER,
                attempt INTEGER NOT NULL DEFAULT 0,
                enqueued_at_ms INTEGER NOT NULL,
                PRIMARY KEY (instance_id, execution_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_tasks (
                id TEXT PRIMARY KEY,
                instance_data TEXT NOT NULL,
                event_data TEXT NOT NULL,
                lock_token TEXT,
                locked_until_ms INTEGER,
                enqueued_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_instance ON pending_events(instance_id, execution_id, visible_at_ms)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_due ON pending_events(visible_at_ms)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_available ON workflow_queue(locked_until_ms, enqueued_at_ms)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_activity_available ON activity_tasks(locked_until_ms, enqueued_at_ms)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_instances_parent ON instances(parent_instance_id)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn lease_deadline(&self, now: u64) -> i64 {
        (now + self.visibility_timeout.as_millis() as u64) as i64
    }

    async fn sweep_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        now: u64,
    ) -> Result<usize, sqlx::Error> {
        let due = sqlx::query(
            "SELECT id, instance_id, execution_id, schedule_event_id, event_data
             FROM pending_events
             WHERE visible_at_ms IS NOT NULL AND visible_at_ms <= ?",
        )
        .bind(now as i64)
        .fetch_all(&mut **tx)
        .await?;

        for row in &due {
            let id: i64 = row.try_get("id")?;
            let instance_id: String = row.try_get("instance_id")?;
            let execution_id: String = row.try_get("execution_id")?;
            let schedule_event_id: Option<i64> = row.try_get("schedule_event_id")?;
            let event_data: String = row.try_get("event_data")?;
            // Deleting the future record and appending to the tail of the
            // pending stream happen in the same transaction as the enqueue.
            sqlx::query("DELETE FROM pending_events WHERE id = ?")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            sqlx::query(
                "INSERT INTO pending_events (instance_id, execution_id, schedule_event_id, visible_at_ms, event_data)
                 VALUES (?, ?, ?, NULL, ?)",
            )
            .bind(&instance_id)
            .bind(&execution_id)
            .bind(schedule_event_id)
            .bind(&event_data)
            .execute(&mut **tx)
            .await?;
            sqlx::query(
                "INSERT OR IGNORE INTO workflow_queue (instance_id, execution_id, enqueued_at_ms)
                 VALUES (?, ?, ?)",
            )
            .bind(&instance_id)
            .bind(&execution_id)
            .bind(now as i64)
            .execute(&mut **tx)
            .await?;
        }
        Ok(due.len())
    }

    async fn insert_instance_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &WorkflowInstance,
        started: &HistoryEvent,
        now: u64,
    ) -> Result<bool, BackendError> {
        let workflow_name = match &started.attributes {
            EventAttributes::WorkflowExecutionStarted { name, .. } => name.clone(),
            other => {
                return Err(BackendError::permanent(
                    "create_workflow_instance",
                    format!("expected WorkflowExecutionStarted, got {other:?}"),
                ));
            }
        };

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO instances
                (instance_id, execution_id, workflow_name,
                 parent_instance_id, parent_execution_id, parent_schedule_event_id,
                 created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .bind(&workflow_name)
        .bind(instance.parent.as_ref().map(|p| p.instance_id.clone()))
        .bind(instance.parent.as_ref().map(|p| p.execution_id.clone()))
        .bind(instance.parent.as_ref().map(|p| p.schedule_event_id as i64))
        .bind(now as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| storage_err("create_workflow_instance", e))?;

        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO latest_executions (instance_id, execution_id, created_at_ms)
            VALUES (?, ?, ?)
            ON CONFLICT(instance_id) DO UPDATE
            SET execution_id = excluded.execution_id, created_at_ms = excluded.created_at_ms
            WHERE excluded.created_at_ms >= latest_executions.created_at_ms
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .bind(now as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| storage_err("create_workflow_instance", e))?;

        sqlx::query(
            "INSERT INTO pending_events (instance_id, execution_id, schedule_event_id, visible_at_ms, event_data)
             VALUES (?, ?, ?, NULL, ?)",
        )
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .bind(started.schedule_event_id.map(|v| v as i64))
        .bind(encode_event(started)?)
        .execute(&mut **tx)
        .await
        .map_err(|e| storage_err("create_workflow_instance", e))?;

        sqlx::query(
            "INSERT OR IGNORE INTO workflow_queue (instance_id, execution_id, enqueued_at_ms)
             VALUES (?, ?, ?)",
        )
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .bind(now as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| storage_err("create_workflow_instance", e))?;

        Ok(true)
    }

    async fn deliver_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        delivery: &WorkflowEvent,
        now: u64,
    ) -> Result<(), BackendError> {
        let (instance_id, execution_id) = if delivery.instance.execution_id.is_empty() {
            let row = sqlx::query(
                "SELECT execution_id FROM latest_executions WHERE instance_id = ?",
            )
            .bind(&delivery.instance.instance_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| storage_err("complete_workflow_task", e))?;
            match row {
                Some(row) => {
                    let execution_id: String = row
                        .try_get("execution_id")
                        .map_err(|e| storage_err("complete_workflow_task", e))?;
                    (delivery.instance.instance_id.clone(), execution_id)
                }
                None => {
                    warn!(target_instance = %delivery.instance, "dropping workflow event for unknown instance");
                    return Ok(());
                }
            }
        } else {
            (
                delivery.instance.instance_id.clone(),
                delivery.instance.execution_id.clone(),
            )
        };

        sqlx::query(
            "INSERT INTO pending_events (instance_id, execution_id, schedule_event_id, visible_at_ms, event_data)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&instance_id)
        .bind(&execution_id)
        .bind(delivery.event.schedule_event_id.map(|v| v as i64))
        .bind(delivery.event.visible_at_ms.map(|v| v as i64))
        .bind(encode_event(&delivery.event)?)
        .execute(&mut **tx)
        .await
        .map_err(|e| storage_err("complete_workflow_task", e))?;

        if delivery.event.visible_at_ms.is_none() {
            sqlx::query(
                "INSERT OR IGNORE INTO workflow_queue (instance_id, execution_id, enqueued_at_ms)
                 VALUES (?, ?, ?)",
            )
            .bind(&instance_id)
            .bind(&execution_id)
            .bind(now as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| storage_err("complete_workflow_task", e))?;
        }
        Ok(())
    }

    async fn try_get_workflow_task(&self) -> Result<Option<WorkflowTask>, BackendError> {
        let now = now_ms();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("get_workflow_task", e))?;

        Self::sweep_in_tx(&mut tx, now)
            .await
            .map_err(|e| storage_err("get_workflow_task", e))?;

        let Some(row) = sqlx::query(
            r#"
            SELECT instance_id, execution_id, attempt FROM workflow_queue
            WHERE lock_token IS NULL OR locked_until_ms <= ?
            ORDER BY enqueued_at_ms, rowid
            LIMIT 1
            "#,
        )
        .bind(now as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage_err("get_workflow_task", e))?
        else {
            tx.commit()
                .await
                .map_err(|e| storage_err("get_workflow_task", e))?;
            return Ok(None);
        };

        let instance_id: String = row
            .try_get("instance_id")
            .map_err(|e| storage_err("get_workflow_task", e))?;
        let execution_id: String = row
            .try_get("execution_id")
            .map_err(|e| storage_err("get_workflow_task", e))?;
        let attempt: i64 = row
            .try_get("attempt")
            .map_err(|e| storage_err("get_workflow_task", e))?;

        let lock_token = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "UPDATE workflow_queue SET lock_token = ?, locked_until_ms = ?, attempt = attempt + 1
             WHERE instance_id = ? AND execution_id = ?",
        )
        .bind(&lock_token)
        .bind(self.lease_deadline(now))
        .bind(&instance_id)
        .bind(&execution_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("get_workflow_task", e))?;

        let Some(instance_row) = sqlx::query(
            r#"
            SELECT parent_instance_id, parent_execution_id, parent_schedule_event_id, completed_at_ms
            FROM instances WHERE instance_id = ? AND execution_id = ?
            "#,
        )
        .bind(&instance_id)
        .bind(&execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage_err("get_workflow_task", e))?
        else {
            // Queue entry without an instance row: drop it.
            sqlx::query("DELETE FROM workflow_queue WHERE instance_id = ? AND execution_id = ?")
                .bind(&instance_id)
                .bind(&execution_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| storage_err("get_workflow_task", e))?;
            tx.commit()
                .await
                .map_err(|e| storage_err("get_workflow_task", e))?;
            return Ok(None);
        };

        let parent = {
            let parent_instance_id: Option<String> = instance_row
                .try_get("parent_instance_id")
                .map_err(|e| storage_err("get_workflow_task", e))?;
            match parent_instance_id {
                Some(parent_id) => {
                    let parent_execution_id: Option<String> = instance_row
                        .try_get("parent_execution_id")
                        .map_err(|e| storage_err("get_workflow_task", e))?;
                    let parent_schedule: Option<i64> = instance_row
                        .try_get("parent_schedule_event_id")
                        .map_err(|e| storage_err("get_workflow_task", e))?;
                    Some(ParentLink {
                        instance_id: parent_id,
                        execution_id: parent_execution_id.unwrap_or_default(),
                        schedule_event_id: parent_schedule.unwrap_or_default() as u64,
                    })
                }
                None => None,
            }
        };
        let completed_at_ms: Option<i64> = instance_row
            .try_get("completed_at_ms")
            .map_err(|e| storage_err("get_workflow_task", e))?;

        let history_rows = sqlx::query(
            "SELECT event_data FROM history WHERE instance_id = ? AND execution_id = ? ORDER BY sequence_id",
        )
        .bind(&instance_id)
        .bind(&execution_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| storage_err("get_workflow_task", e))?;
        let mut history = Vec::with_capacity(history_rows.len());
        for row in history_rows {
            let data: String = row
                .try_get("event_data")
                .map_err(|e| storage_err("get_workflow_task", e))?;
            history.push(decode_event(&data)?);
        }

        let pending_rows = sqlx::query(
            "SELECT id, event_data FROM pending_events
             WHERE instance_id = ? AND execution_id = ? AND visible_at_ms IS NULL
             ORDER BY id",
        )
        .bind(&instance_id)
        .bind(&execution_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| storage_err("get_workflow_task", e))?;
        let mut new_events = Vec::with_capacity(pending_rows.len());
        let mut backend_cursor = 0u64;
        for row in pending_rows {
            let id: i64 = row
                .try_get("id")
                .map_err(|e| storage_err("get_workflow_task", e))?;
            let data: String = row
                .try_get("event_data")
                .map_err(|e| storage_err("get_workflow_task", e))?;
            backend_cursor = id as u64;
            new_events.push(decode_event(&data)?);
        }

        tx.commit()
            .await
            .map_err(|e| storage_err("get_workflow_task", e))?;

        let last_sequence_id = history.last().map(|e| e.sequence_id).unwrap_or(0);
        let mut instance = WorkflowInstance::new(instance_id, execution_id);
        instance.parent = parent;
        debug!(
            instance_id = %instance.instance_id,
            execution_id = %instance.execution_id,
            history_len = history.len(),
            new_events = new_events.len(),
            "fetched workflow task"
        );
        Ok(Some(WorkflowTask {
            instance,
            kind: TaskKind::Full,
            history,
            new_events,
            last_sequence_id,
            completed_at_ms: completed_at_ms.map(|v| v as u64),
            attempt: attempt as u32 + 1,
            lease_token: lock_token,
            backend_cursor,
        }))
    }

    async fn try_get_activity_task(&self) -> Result<Option<ActivityTask>, BackendError> {
        let now = now_ms();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("get_activity_task", e))?;

        let Some(row) = sqlx::query(
            r#"
            SELECT id, instance_data, event_data FROM activity_tasks
            WHERE lock_token IS NULL OR locked_until_ms <= ?
            ORDER BY enqueued_at_ms, rowid
            LIMIT 1
            "#,
        )
        .bind(now as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage_err("get_activity_task", e))?
        else {
            tx.commit()
                .await
                .map_err(|e| storage_err("get_activity_task", e))?;
            return Ok(None);
        };

        let id: String = row
            .try_get("id")
            .map_err(|e| storage_err("get_activity_task", e))?;
        let instance_data: String = row
            .try_get("instance_data")
            .map_err(|e| storage_err("get_activity_task", e))?;
        let event_data: String = row
            .try_get("event_data")
            .map_err(|e| storage_err("get_activity_task", e))?;

        sqlx::query("UPDATE activity_tasks SET lock_token = ?, locked_until_ms = ? WHERE id = ?")
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(self.lease_deadline(now))
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("get_activity_task", e))?;

        tx.commit()
            .await
            .map_err(|e| storage_err("get_activity_task", e))?;

        let instance: WorkflowInstance = serde_json::from_str(&instance_data)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        let event = decode_event(&event_data)?;
        Ok(Some(ActivityTask {
            id,
            instance,
            event,
        }))
    }
}

#[async_trait::async_trait]
impl Backend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_workflow_instance(
        &self,
        instance: WorkflowInstance,
        started: HistoryEvent,
    ) -> Result<(), BackendError> {
        let now = now_ms();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("create_workflow_instance", e))?;
        let inserted = Self::insert_instance_in_tx(&mut tx, &instance, &started, now).await?;
        if !inserted {
            return Err(BackendError::InstanceAlreadyExists(instance.to_string()));
        }
        tx.commit()
            .await
            .map_err(|e| storage_err("create_workflow_instance", e))?;
        Ok(())
    }

    async fn get_workflow_task(
        &self,
        timeout: Duration,
    ) -> Result<Option<WorkflowTask>, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_get_workflow_task().await? {
                return Ok(Some(task));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_GRANULARITY).await;
        }
    }

    async fn extend_workflow_task(&self, task: &WorkflowTask) -> Result<(), BackendError> {
        let now = now_ms();
        let updated = sqlx::query(
            "UPDATE workflow_queue SET locked_until_ms = ?
             WHERE instance_id = ? AND execution_id = ? AND lock_token = ? AND locked_until_ms > ?",
        )
        .bind(self.lease_deadline(now))
        .bind(&task.instance.instance_id)
        .bind(&task.instance.execution_id)
        .bind(&task.lease_token)
        .bind(now as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("extend_workflow_task", e))?;
        if updated.rows_affected() == 0 {
            return Err(BackendError::LeaseLost);
        }
        Ok(())
    }

    async fn complete_workflow_task(
        &self,
        task: WorkflowTask,
        new_events: Vec<HistoryEvent>,
        workflow_events: Vec<WorkflowEvent>,
        activity_events: Vec<HistoryEvent>,
        timers_to_schedule: Vec<WorkflowEvent>,
        timers_to_cancel: Vec<u64>,
    ) -> Result<(), BackendError> {
        let now = now_ms();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("complete_workflow_task", e))?;

        // Lease verification and release, inside the transaction that does
        // the append: deleting the queue row only succeeds while the lease
        // is held.
        let released = sqlx::query(
            "DELETE FROM workflow_queue
             WHERE instance_id = ? AND execution_id = ? AND lock_token = ? AND locked_until_ms > ?",
        )
        .bind(&task.instance.instance_id)
        .bind(&task.instance.execution_id)
        .bind(&task.lease_token)
        .bind(now as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("complete_workflow_task", e))?;
        if released.rows_affected() == 0 {
            return Err(BackendError::LeaseLost);
        }

        let completed: Option<i64> = sqlx::query_scalar(
            "SELECT completed_at_ms FROM instances WHERE instance_id = ? AND execution_id = ?",
        )
        .bind(&task.instance.instance_id)
        .bind(&task.instance.execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage_err("complete_workflow_task", e))?
        .flatten();
        if completed.is_some() && !new_events.is_empty() {
            return Err(BackendError::permanent(
                "complete_workflow_task",
                format!("append to finished instance {}", task.instance),
            ));
        }

        let mut next_sequence: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM history
             WHERE instance_id = ? AND execution_id = ?",
        )
        .bind(&task.instance.instance_id)
        .bind(&task.instance.execution_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| storage_err("complete_workflow_task", e))?;

        let mut finished = false;
        for event in new_events {
            let event = event.with_sequence(next_sequence as u64);
            finished |= event.is_terminal();
            sqlx::query(
                "INSERT INTO history (instance_id, execution_id, sequence_id, event_type, event_data)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&task.instance.instance_id)
            .bind(&task.instance.execution_id)
            .bind(next_sequence)
            .bind(event.event_type())
            .bind(encode_event(&event)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("complete_workflow_task", e))?;
            next_sequence += 1;
        }
        if finished {
            sqlx::query(
                "UPDATE instances SET completed_at_ms = ? WHERE instance_id = ? AND execution_id = ?",
            )
            .bind(now as i64)
            .bind(&task.instance.instance_id)
            .bind(&task.instance.execution_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("complete_workflow_task", e))?;
        }

        sqlx::query(
            "DELETE FROM pending_events
             WHERE instance_id = ? AND execution_id = ? AND visible_at_ms IS NULL AND id <= ?",
        )
        .bind(&task.instance.instance_id)
        .bind(&task.instance.execution_id)
        .bind(task.backend_cursor as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("complete_workflow_task", e))?;

        for event in activity_events {
            sqlx::query(
                "INSERT INTO activity_tasks (id, instance_data, event_data, enqueued_at_ms)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(
                serde_json::to_string(&task.instance)
                    .map_err(|e| BackendError::Serialization(e.to_string()))?,
            )
            .bind(encode_event(&event)?)
            .bind(now as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("complete_workflow_task", e))?;
        }

        for timer in &timers_to_schedule {
            sqlx::query(
                "INSERT INTO pending_events (instance_id, execution_id, schedule_event_id, visible_at_ms, event_data)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&timer.instance.instance_id)
            .bind(&timer.instance.execution_id)
            .bind(timer.event.schedule_event_id.map(|v| v as i64))
            .bind(timer.event.visible_at_ms.map(|v| v as i64))
            .bind(encode_event(&timer.event)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("complete_workflow_task", e))?;
        }
        for schedule_id in timers_to_cancel {
            sqlx::query(
                "DELETE FROM pending_events
                 WHERE instance_id = ? AND execution_id = ? AND schedule_event_id = ?
                   AND visible_at_ms IS NOT NULL",
            )
            .bind(&task.instance.instance_id)
            .bind(&task.instance.execution_id)
            .bind(schedule_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("complete_workflow_task", e))?;
        }

        for delivery in &workflow_events {
            if is_start_event(&delivery.event) {
                // Idempotent under retries: the child may already exist.
                Self::insert_instance_in_tx(&mut tx, &delivery.instance, &delivery.event, now)
                    .await?;
            } else {
                Self::deliver_in_tx(&mut tx, delivery, now).await?;
            }
        }

        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_events
             WHERE instance_id = ? AND execution_id = ? AND visible_at_ms IS NULL",
        )
        .bind(&task.instance.instance_id)
        .bind(&task.instance.execution_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| storage_err("complete_workflow_task", e))?;
        if remaining > 0 {
            sqlx::query(
                "INSERT OR IGNORE INTO workflow_queue (instance_id, execution_id, enqueued_at_ms)
                 VALUES (?, ?, ?)",
            )
            .bind(&task.instance.instance_id)
            .bind(&task.instance.execution_id)
            .bind(now as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("complete_workflow_task", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| storage_err("complete_workflow_task", e))?;
        debug!(
            instance_id = %task.instance.instance_id,
            execution_id = %task.instance.execution_id,
            "workflow task committed"
        );
        Ok(())
    }

    async fn get_activity_task(
        &self,
        timeout: Duration,
    ) -> Result<Option<ActivityTask>, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_get_activity_task().await? {
                return Ok(Some(task));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_GRANULARITY).await;
        }
    }

    async fn extend_activity_task(&self, task_id: &str) -> Result<(), BackendError> {
        let now = now_ms();
        let updated = sqlx::query(
            "UPDATE activity_tasks SET locked_until_ms = ? WHERE id = ? AND locked_until_ms > ?",
        )
        .bind(self.lease_deadline(now))
        .bind(task_id)
        .bind(now as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("extend_activity_task", e))?;
        if updated.rows_affected() == 0 {
            return Err(BackendError::LeaseLost);
        }
        Ok(())
    }

    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        task_id: &str,
        event: HistoryEvent,
    ) -> Result<(), BackendError> {
        let now = now_ms();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("complete_activity_task", e))?;

        // Exactly one completion: the row can only be deleted once.
        let deleted = sqlx::query("DELETE FROM activity_tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("complete_activity_task", e))?;
        if deleted.rows_affected() == 0 {
            return Err(BackendError::LeaseLost);
        }

        sqlx::query(
            "INSERT INTO pending_events (instance_id, execution_id, schedule_event_id, visible_at_ms, event_data)
             VALUES (?, ?, ?, NULL, ?)",
        )
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .bind(event.schedule_event_id.map(|v| v as i64))
        .bind(encode_event(&event)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("complete_activity_task", e))?;

        sqlx::query(
            "INSERT OR IGNORE INTO workflow_queue (instance_id, execution_id, enqueued_at_ms)
             VALUES (?, ?, ?)",
        )
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .bind(now as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("complete_activity_task", e))?;

        tx.commit()
            .await
            .map_err(|e| storage_err("complete_activity_task", e))?;
        Ok(())
    }

    async fn signal_workflow(
        &self,
        instance_id: &str,
        event: HistoryEvent,
    ) -> Result<(), BackendError> {
        let now = now_ms();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("signal_workflow", e))?;
        let Some(execution_id): Option<String> = sqlx::query_scalar(
            "SELECT execution_id FROM latest_executions WHERE instance_id = ?",
        )
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage_err("signal_workflow", e))?
        else {
            return Err(BackendError::InstanceNotFound(instance_id.to_string()));
        };

        sqlx::query(
            "INSERT INTO pending_events (instance_id, execution_id, schedule_event_id, visible_at_ms, event_data)
             VALUES (?, ?, NULL, NULL, ?)",
        )
        .bind(instance_id)
        .bind(&execution_id)
        .bind(encode_event(&event)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("signal_workflow", e))?;

        sqlx::query(
            "INSERT OR IGNORE INTO workflow_queue (instance_id, execution_id, enqueued_at_ms)
             VALUES (?, ?, ?)",
        )
        .bind(instance_id)
        .bind(&execution_id)
        .bind(now as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("signal_workflow", e))?;

        tx.commit()
            .await
            .map_err(|e| storage_err("signal_workflow", e))?;
        Ok(())
    }

    async fn sweep_future_events(&self) -> Result<usize, BackendError> {
        let now = now_ms();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("sweep_future_events", e))?;
        let moved = Self::sweep_in_tx(&mut tx, now)
            .await
            .map_err(|e| storage_err("sweep_future_events", e))?;
        tx.commit()
            .await
            .map_err(|e| storage_err("sweep_future_events", e))?;
        Ok(moved)
    }

    async fn remove_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(), BackendError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("remove_workflow_instance", e))?;
        let completed: Option<Option<i64>> = sqlx::query_scalar(
            "SELECT completed_at_ms FROM instances WHERE instance_id = ? AND execution_id = ?",
        )
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage_err("remove_workflow_instance", e))?;
        match completed {
            None => return Err(BackendError::InstanceNotFound(instance.to_string())),
            Some(None) => {
                return Err(BackendError::permanent(
                    "remove_workflow_instance",
                    format!("instance {instance} is still active"),
                ));
            }
            Some(Some(_)) => {}
        }

        for table in ["history", "pending_events", "workflow_queue", "instances"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE instance_id = ? AND execution_id = ?"
            ))
            .bind(&instance.instance_id)
            .bind(&instance.execution_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("remove_workflow_instance", e))?;
        }
        sqlx::query(
            "DELETE FROM latest_executions WHERE instance_id = ? AND execution_id = ?",
        )
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("remove_workflow_instance", e))?;

        tx.commit()
            .await
            .map_err(|e| storage_err("remove_workflow_instance", e))?;
        Ok(())
    }

    async fn read_history(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Vec<HistoryEvent>, BackendError> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM instances WHERE instance_id = ? AND execution_id = ?",
        )
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("read_history", e))?;
        if exists.is_none() {
            return Err(BackendError::InstanceNotFound(instance.to_string()));
        }

        let rows = sqlx::query(
            "SELECT event_data FROM history WHERE instance_id = ? AND execution_id = ? ORDER BY sequence_id",
        )
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_err("read_history", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row
                .try_get("event_data")
                .map_err(|e| storage_err("read_history", e))?;
            events.push(decode_event(&data)?);
        }
        Ok(events)
    }

    async fn latest_execution(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance>, BackendError> {
        let Some(execution_id): Option<String> = sqlx::query_scalar(
            "SELECT execution_id FROM latest_executions WHERE instance_id = ?",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("latest_execution", e))?
        else {
            return Ok(None);
        };
        Ok(Some(WorkflowInstance::new(instance_id, execution_id)))
    }

    fn as_diagnostics(&self) -> Option<&dyn DiagnosticsBackend> {
        Some(self)
    }
}

fn row_to_instance_ref(row: &sqlx::sqlite::SqliteRow) -> Result<InstanceRef, BackendError> {
    let instance_id: String = row
        .try_get("instance_id")
        .map_err(|e| storage_err("list_instances", e))?;
    let execution_id: String = row
        .try_get("execution_id")
        .map_err(|e| storage_err("list_instances", e))?;
    let workflow_name: String = row
        .try_get("workflow_name")
        .map_err(|e| storage_err("list_instances", e))?;
    let created_at_ms: i64 = row
        .try_get("created_at_ms")
        .map_err(|e| storage_err("list_instances", e))?;
    let completed_at_ms: Option<i64> = row
        .try_get("completed_at_ms")
        .map_err(|e| storage_err("list_instances", e))?;
    Ok(InstanceRef {
        instance: WorkflowInstance::new(instance_id, execution_id),
        workflow_name,
        created_at_ms: created_at_ms as u64,
        completed_at_ms: completed_at_ms.map(|v| v as u64),
        state: if completed_at_ms.is_some() {
            InstanceState::Finished
        } else {
            InstanceState::Active
        },
    })
}

#[async_trait::async_trait]
impl DiagnosticsBackend for SqliteBackend {
    async fn list_instances(
        &self,
        after: Option<&WorkflowInstance>,
        count: usize,
    ) -> Result<Vec<InstanceRef>, BackendError> {
        let cursor_rowid: Option<i64> = match after {
            Some(after) => {
                let rowid: Option<i64> = sqlx::query_scalar(
                    "SELECT rowid FROM instances WHERE instance_id = ? AND execution_id = ?",
                )
                .bind(&after.instance_id)
                .bind(&after.execution_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_err("list_instances", e))?;
                match rowid {
                    Some(rowid) => Some(rowid),
                    // Unknown cursor pages to an empty result.
                    None => return Ok(Vec::new()),
                }
            }
            None => None,
        };

        let rows = match cursor_rowid {
            Some(rowid) => {
                sqlx::query(
                    "SELECT instance_id, execution_id, workflow_name, created_at_ms, completed_at_ms
                     FROM instances WHERE rowid < ? ORDER BY rowid DESC LIMIT ?",
                )
                .bind(rowid)
                .bind(count as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT instance_id, execution_id, workflow_name, created_at_ms, completed_at_ms
                     FROM instances ORDER BY rowid DESC LIMIT ?",
                )
                .bind(count as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| storage_err("list_instances", e))?;

        rows.iter().map(row_to_instance_ref).collect()
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRef>, BackendError> {
        let row = sqlx::query(
            r#"
            SELECT i.instance_id, i.execution_id, i.workflow_name, i.created_at_ms, i.completed_at_ms
            FROM instances i
            JOIN latest_executions le
              ON le.instance_id = i.instance_id AND le.execution_id = i.execution_id
            WHERE i.instance_id = ?
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("get_instance", e))?;
        row.as_ref().map(row_to_instance_ref).transpose()
    }

    async fn get_instance_tree(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceTreeNode>, BackendError> {
        let Some(root) = self.get_instance(instance_id).await? else {
            return Ok(None);
        };

        // Collect the tree breadth-first, then assemble bottom-up.
        let mut refs: Vec<(String, InstanceRef)> = vec![(instance_id.to_string(), root)];
        let mut child_ids: std::collections::HashMap<String, Vec<String>> = Default::default();
        let mut frontier = vec![instance_id.to_string()];
        while let Some(id) = frontier.pop() {
            let rows = sqlx::query(
                "SELECT DISTINCT instance_id FROM instances WHERE parent_instance_id = ?",
            )
            .bind(&id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_err("get_instance_tree", e))?;
            for row in rows {
                let child_id: String = row
                    .try_get("instance_id")
                    .map_err(|e| storage_err("get_instance_tree", e))?;
                if let Some(child_ref) = self.get_instance(&child_id).await? {
                    refs.push((child_id.clone(), child_ref));
                    child_ids.entry(id.clone()).or_default().push(child_id.clone());
                    frontier.push(child_id);
                }
            }
        }

        fn assemble(
            id: &str,
            refs: &[(String, InstanceRef)],
            child_ids: &std::collections::HashMap<String, Vec<String>>,
        ) -> Option<InstanceTreeNode> {
            let instance = refs.iter().find(|(i, _)| i == id)?.1.clone();
            let children = child_ids
                .get(id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|c| assemble(c, refs, child_ids))
                        .collect()
                })
                .unwrap_or_default();
            Some(InstanceTreeNode { instance, children })
        }
        Ok(assemble(instance_id, &refs, &child_ids))
    }
}
