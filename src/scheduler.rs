use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::SchedulingError;
use crate::status::{format_ts, parse_ts};
use crate::telemetry::MonitorTelemetry;
use crate::traits::{FireHandler, ScheduledTask, TaskScheduler};

/// Delay before a task whose handler failed fires again.
const FIRE_RETRY_DELAY_SECS: i64 = 30;

/// Durable fire-at-time scheduler for invocation watchdog tasks.
pub struct SqliteTaskScheduler {
    pool: SqlitePool,
    telemetry: Arc<MonitorTelemetry>,
}

impl SqliteTaskScheduler {
    pub async fn new(pool: SqlitePool, telemetry: Arc<MonitorTelemetry>) -> anyhow::Result<Self> {
        crate::db::migrations::migrate_deferred_tasks(&pool).await?;
        Ok(Self { pool, telemetry })
    }

    /// Spawn the tick loop. The first tick runs immediately so tasks that
    /// came due while the daemon was down fire on startup.
    pub fn spawn(self: Arc<Self>, handler: Arc<dyn FireHandler>, tick: Duration) -> JoinHandle<()> {
        let handle = tokio::spawn(async move {
            match self.overdue_count().await {
                Ok(0) => {}
                Ok(count) => info!(count, "Recovering missed deferred tasks"),
                Err(e) => error!("Scheduler crash recovery failed: {}", e),
            }

            loop {
                if let Err(e) = self.fire_due(handler.as_ref()).await {
                    error!("Scheduler tick error: {}", e);
                }
                tokio::time::sleep(tick).await;
            }
        });

        info!("Deferred task scheduler spawned");
        handle
    }

    /// Remove every task whose fire time has passed and hand it to `handler`.
    ///
    /// Rows are deleted and returned by one statement, so concurrent
    /// schedulers never fire the same task twice. A task whose handler fails
    /// is put back to fire again after a short delay.
    pub async fn fire_due(
        &self,
        handler: &dyn FireHandler,
    ) -> Result<Vec<ScheduledTask>, SchedulingError> {
        let rows = sqlx::query(
            "DELETE FROM deferred_tasks WHERE fire_at <= ?
             RETURNING task_id, invocation_id, fire_at",
        )
        .bind(format_ts(Utc::now()))
        .fetch_all(&self.pool)
        .await?;

        let mut fired = rows_to_tasks(rows);
        fired.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));

        for task in &fired {
            self.telemetry.mark_fired();
            match handler.on_fire(task).await {
                Ok(()) => info!(
                    task_id = %task.task_id,
                    invocation_id = %task.invocation_id,
                    handler = handler.name(),
                    "Fired deferred task"
                ),
                Err(e) => {
                    self.telemetry.mark_fire_failed();
                    warn!(
                        task_id = %task.task_id,
                        invocation_id = %task.invocation_id,
                        handler = handler.name(),
                        error = %e,
                        "Fire handler failed, retrying in {}s",
                        FIRE_RETRY_DELAY_SECS
                    );
                    if let Err(e) = self.requeue(task).await {
                        error!(task_id = %task.task_id, error = %e, "Failed to requeue deferred task");
                    }
                }
            }
        }

        Ok(fired)
    }

    /// Put a fired task back. A task rescheduled under the same id in the
    /// meantime takes precedence.
    async fn requeue(&self, task: &ScheduledTask) -> Result<(), SchedulingError> {
        let fire_at = Utc::now() + chrono::Duration::seconds(FIRE_RETRY_DELAY_SECS);
        sqlx::query(
            "INSERT OR IGNORE INTO deferred_tasks (task_id, invocation_id, fire_at, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&task.task_id)
        .bind(&task.invocation_id)
        .bind(format_ts(fire_at))
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn overdue_count(&self) -> Result<u64, SchedulingError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM deferred_tasks WHERE fire_at < ?")
            .bind(format_ts(Utc::now()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl TaskScheduler for SqliteTaskScheduler {
    async fn schedule(
        &self,
        task_id: &str,
        invocation_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), SchedulingError> {
        if task_id.trim().is_empty() {
            return Err(SchedulingError::InvalidInput("task id must not be empty".to_string()));
        }

        let result = sqlx::query(
            "INSERT INTO deferred_tasks (task_id, invocation_id, fire_at, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(invocation_id)
        .bind(format_ts(fire_at))
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(SchedulingError::DuplicateTask(task_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel(&self, task_id: &str) -> Result<bool, SchedulingError> {
        let result = sqlx::query("DELETE FROM deferred_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active_tasks(&self) -> Result<Vec<ScheduledTask>, SchedulingError> {
        let rows = sqlx::query(
            "SELECT task_id, invocation_id, fire_at FROM deferred_tasks
             ORDER BY fire_at ASC, task_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows_to_tasks(rows))
    }
}

fn rows_to_tasks(rows: Vec<sqlx::sqlite::SqliteRow>) -> Vec<ScheduledTask> {
    rows.into_iter()
        .filter_map(|row| {
            let task_id: String = row.get("task_id");
            let fire_at_raw: String = row.get("fire_at");
            let Some(fire_at) = parse_ts(&fire_at_raw) else {
                warn!(task_id = %task_id, fire_at = %fire_at_raw, "Skipping task with unreadable fire time");
                return None;
            };
            Some(ScheduledTask {
                task_id,
                invocation_id: row.get("invocation_id"),
                fire_at,
            })
        })
        .collect()
}
