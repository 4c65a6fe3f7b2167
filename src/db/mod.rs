pub(crate) mod migrations;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::StateConfig;

/// Open the shared SQLite pool and run every migration.
///
/// WAL mode lets readers proceed while a consolidation transaction holds the
/// write lock; the busy timeout absorbs short write contention between workers.
pub async fn connect(state: &StateConfig) -> anyhow::Result<SqlitePool> {
    let url = if state.db_path.starts_with("sqlite:") {
        state.db_path.clone()
    } else {
        format!("sqlite:{}", state.db_path)
    };
    let opts = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(state.busy_timeout_ms));
    let pool = SqlitePoolOptions::new()
        .max_connections(state.max_connections)
        .connect_with(opts)
        .await?;

    migrations::migrate_status_queue(&pool).await?;
    migrations::migrate_deferred_tasks(&pool).await?;
    Ok(pool)
}
