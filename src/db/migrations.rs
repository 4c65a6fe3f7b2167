use sqlx::SqlitePool;
use tracing::info;

/// Centralized database migrations for all SQLite-backed stores.
///
/// Each migration is safe to call multiple times (idempotent) by using
/// `IF NOT EXISTS`.
pub(crate) async fn migrate_status_queue(pool: &SqlitePool) -> anyhow::Result<()> {
    // `processed` is kept for compatibility with retain mode; the default
    // consolidation path deletes consumed rows instead.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS status_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            invocation_id TEXT NOT NULL,
            invocation_status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            claimed_by TEXT,
            claim_expires_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_status_queue_invocation_time
         ON status_queue(invocation_id, created_at DESC, seq DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_status_queue_pending
         ON status_queue(invocation_id) WHERE processed = 0",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_status_queue_claims
         ON status_queue(claimed_by) WHERE claimed_by IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_status_queue_prune
         ON status_queue(created_at) WHERE processed = 1",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS invocation_statuses (
            invocation_id TEXT PRIMARY KEY,
            invocation_status TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_event_at TEXT,
            last_event_seq INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Position of the winning event; older databases lack these columns.
    let _ = sqlx::query("ALTER TABLE invocation_statuses ADD COLUMN last_event_at TEXT")
        .execute(pool)
        .await;
    let _ = sqlx::query("ALTER TABLE invocation_statuses ADD COLUMN last_event_seq INTEGER")
        .execute(pool)
        .await;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_invocation_statuses_updated
         ON invocation_statuses(updated_at)",
    )
    .execute(pool)
    .await?;

    info!("Status queue migration complete");
    Ok(())
}

pub(crate) async fn migrate_deferred_tasks(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deferred_tasks (
            task_id TEXT PRIMARY KEY,
            invocation_id TEXT NOT NULL,
            fire_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_deferred_tasks_fire_at ON deferred_tasks(fire_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_deferred_tasks_invocation
         ON deferred_tasks(invocation_id)",
    )
    .execute(pool)
    .await?;

    info!("Deferred tasks migration complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::Row;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        for _ in 0..2 {
            migrate_status_queue(&pool).await.unwrap();
            migrate_deferred_tasks(&pool).await.unwrap();
        }

        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get("name")).collect();
        assert_eq!(
            names,
            vec!["deferred_tasks", "invocation_statuses", "status_queue"]
        );
    }

    #[tokio::test]
    async fn old_status_table_gains_event_position_columns() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE invocation_statuses (
                invocation_id TEXT PRIMARY KEY,
                invocation_status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();

        migrate_status_queue(&pool).await.unwrap();

        let rows = sqlx::query("SELECT name FROM pragma_table_info('invocation_statuses')")
            .fetch_all(&pool)
            .await
            .unwrap();
        let columns: Vec<String> = rows.iter().map(|r| r.get("name")).collect();
        assert!(columns.contains(&"last_event_at".to_string()));
        assert!(columns.contains(&"last_event_seq".to_string()));
    }
}
