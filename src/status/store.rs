//! Status queue storage backed by SQLite.
//!
//! The store provides the primitives the consolidator composes into one run:
//! - Append-only inserts of status events
//! - Lease-based claiming of unprocessed rows (skip rows another worker holds)
//! - Ranked, grouped reads of the rows a worker claimed
//! - Consumption (delete or mark processed) restricted to the caller's claim

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::warn;

use super::{
    format_ts, parse_ts, resolve_effective, EventPosition, InvocationStatus, PositionedStatus,
    StatusEvent,
};
use crate::error::StoreError;
use crate::traits::StatusLookup;

/// Maximum ids bound into a single `IN (...)` clause.
const ID_CHUNK: usize = 500;

/// Last consolidated status of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InvocationStatusRecord {
    pub invocation_id: String,
    pub status: InvocationStatus,
    /// Position of the event that set `status`.
    pub position: EventPosition,
    pub updated_at: DateTime<Utc>,
}

impl InvocationStatusRecord {
    fn positioned(&self) -> PositionedStatus {
        (self.status, self.position)
    }
}

/// One claimed queue row with its rank inside the invocation group.
#[derive(Debug, Clone)]
pub struct ClaimedRow {
    pub id: String,
    pub seq: i64,
    /// `None` when the stored literal is not a known status.
    pub status: Option<InvocationStatus>,
    pub created_at: DateTime<Utc>,
    /// 1 = latest row of the group.
    pub latest_rank: i64,
}

impl ClaimedRow {
    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.created_at, self.seq)
    }
}

/// All rows of one invocation claimed by a worker, oldest first.
#[derive(Debug, Clone)]
pub struct ClaimedGroup {
    pub invocation_id: String,
    pub rows: Vec<ClaimedRow>,
    /// Effective status recorded by an earlier consolidation.
    pub prior: Option<PositionedStatus>,
}

impl ClaimedGroup {
    pub fn row_ids(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.id.clone()).collect()
    }

    /// Status of the rank-1 row.
    pub fn latest_status(&self) -> Option<InvocationStatus> {
        self.rows
            .iter()
            .find(|r| r.latest_rank == 1)
            .and_then(|r| r.status)
    }

    pub fn prior_status(&self) -> Option<InvocationStatus> {
        self.prior.map(|(status, _)| status)
    }

    /// Effective status after folding this group onto the prior status.
    /// Rows positioned before the prior status do not count.
    pub fn effective_status(&self) -> Option<PositionedStatus> {
        resolve_effective(
            self.prior,
            self.rows
                .iter()
                .filter_map(|r| r.status.map(|status| (status, r.position()))),
        )
    }
}

/// The status queue store backed by SQLite.
pub struct StatusEventStore {
    pool: SqlitePool,
}

impl StatusEventStore {
    /// Create a new store with the given database pool.
    /// This also runs migrations to create/update the queue tables.
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        crate::db::migrations::migrate_status_queue(&pool).await?;
        Ok(Self { pool })
    }

    /// Get the underlying database pool (for sharing with other components)
    #[cfg(test)]
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Append a new event to the queue. Returns the assigned arrival sequence.
    pub async fn append(&self, event: &StatusEvent) -> Result<i64, StoreError> {
        if event.invocation_id.trim().is_empty() {
            return Err(StoreError::InvalidInput(
                "invocation id must not be empty".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO status_queue (id, invocation_id, invocation_status, created_at, processed)
            VALUES (?, ?, ?, ?, 0)
            "#,
        )
        .bind(&event.id)
        .bind(&event.invocation_id)
        .bind(event.status.as_str())
        .bind(format_ts(event.created_at))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Claim every unprocessed row of up to `batch_size` invocations that no
    /// other worker currently holds a live lease on.
    ///
    /// Runs as one statement, so concurrent claimers partition invocations
    /// between them. Returns the number of rows claimed.
    pub async fn claim_unprocessed(
        &self,
        worker_id: &str,
        lease: Duration,
        batch_size: usize,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::InvalidInput(format!("lease out of range: {}", e)))?;
        let expires_at = format_ts(now + lease);

        let result = sqlx::query(
            r#"
            UPDATE status_queue
            SET claimed_by = ?, claim_expires_at = ?
            WHERE processed = 0
              AND invocation_id IN (
                SELECT invocation_id
                FROM status_queue
                WHERE processed = 0
                GROUP BY invocation_id
                HAVING SUM(CASE WHEN claimed_by IS NOT NULL AND claim_expires_at > ? THEN 1 ELSE 0 END) = 0
                ORDER BY MIN(seq)
                LIMIT ?
              )
            "#,
        )
        .bind(worker_id)
        .bind(&expires_at)
        .bind(format_ts(now))
        .bind(batch_size.max(1) as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Load the rows claimed by `worker_id`, ranked within each invocation and
    /// grouped in the order returned.
    pub async fn load_claimed_groups(&self, worker_id: &str) -> Result<Vec<ClaimedGroup>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT q.id AS id,
                   q.seq AS seq,
                   q.invocation_id AS invocation_id,
                   q.invocation_status AS invocation_status,
                   q.created_at AS created_at,
                   ROW_NUMBER() OVER (
                       PARTITION BY q.invocation_id
                       ORDER BY q.created_at DESC, q.seq DESC
                   ) AS latest_rank,
                   s.invocation_status AS prior_status,
                   s.last_event_at AS prior_event_at,
                   s.last_event_seq AS prior_event_seq,
                   s.updated_at AS prior_updated_at
            FROM status_queue q
            LEFT JOIN invocation_statuses s ON s.invocation_id = q.invocation_id
            WHERE q.claimed_by = ? AND q.processed = 0
            ORDER BY q.invocation_id ASC, q.created_at ASC, q.seq ASC
            "#,
        )
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        let mut groups: Vec<ClaimedGroup> = Vec::new();
        for row in rows {
            let invocation_id: String = row.get("invocation_id");
            let status_raw: String = row.get("invocation_status");
            let prior_raw: Option<String> = row.get("prior_status");
            let created_at_raw: String = row.get("created_at");

            let status = InvocationStatus::from_str(&status_raw);
            if status.is_none() {
                warn!(invocation_id = %invocation_id, status = %status_raw, "Unknown status in queue row");
            }

            let claimed = ClaimedRow {
                id: row.get("id"),
                seq: row.get("seq"),
                status,
                created_at: parse_ts(&created_at_raw).unwrap_or_else(Utc::now),
                latest_rank: row.get("latest_rank"),
            };

            match groups.last_mut() {
                Some(group) if group.invocation_id == invocation_id => group.rows.push(claimed),
                _ => {
                    let prior = prior_raw
                        .as_deref()
                        .and_then(InvocationStatus::from_str)
                        .map(|status| {
                            let position = stored_position(
                                row.get("prior_event_at"),
                                row.get("prior_event_seq"),
                                row.get("prior_updated_at"),
                            );
                            (status, position)
                        });
                    groups.push(ClaimedGroup {
                        invocation_id,
                        rows: vec![claimed],
                        prior,
                    })
                }
            }
        }

        Ok(groups)
    }

    /// Begin a transaction for consuming claimed groups.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Record the consolidated effective status of an invocation together
    /// with the position of the event that produced it.
    pub async fn upsert_effective(
        conn: &mut SqliteConnection,
        invocation_id: &str,
        (status, position): PositionedStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO invocation_statuses
                (invocation_id, invocation_status, updated_at, last_event_at, last_event_seq)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(invocation_id) DO UPDATE SET
              invocation_status = excluded.invocation_status,
              updated_at = excluded.updated_at,
              last_event_at = excluded.last_event_at,
              last_event_seq = excluded.last_event_seq
            "#,
        )
        .bind(invocation_id)
        .bind(status.as_str())
        .bind(format_ts(Utc::now()))
        .bind(format_ts(position.created_at))
        .bind(position.seq)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Delete the given rows if they are still claimed by `worker_id`.
    /// Returns the number of rows removed.
    pub async fn delete_claimed(
        conn: &mut SqliteConnection,
        worker_id: &str,
        ids: &[String],
    ) -> Result<u64, StoreError> {
        let mut removed = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let query = format!(
                "DELETE FROM status_queue WHERE claimed_by = ? AND id IN ({})",
                placeholders(chunk.len())
            );
            let mut q = sqlx::query(&query).bind(worker_id);
            for id in chunk {
                q = q.bind(id);
            }
            removed += q.execute(&mut *conn).await?.rows_affected();
        }
        Ok(removed)
    }

    /// Set the processed flag on rows still claimed by `worker_id`.
    pub async fn mark_processed(
        conn: &mut SqliteConnection,
        worker_id: &str,
        ids: &[String],
    ) -> Result<u64, StoreError> {
        let mut marked = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let query = format!(
                "UPDATE status_queue SET processed = 1, claimed_by = NULL, claim_expires_at = NULL
                 WHERE claimed_by = ? AND processed = 0 AND id IN ({})",
                placeholders(chunk.len())
            );
            let mut q = sqlx::query(&query).bind(worker_id);
            for id in chunk {
                q = q.bind(id);
            }
            marked += q.execute(&mut *conn).await?.rows_affected();
        }
        Ok(marked)
    }

    /// Drop the caller's claim on the given rows so the next run can take them.
    pub async fn release_claims(
        conn: &mut SqliteConnection,
        worker_id: &str,
        ids: &[String],
    ) -> Result<u64, StoreError> {
        let mut released = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let query = format!(
                "UPDATE status_queue SET claimed_by = NULL, claim_expires_at = NULL
                 WHERE claimed_by = ? AND id IN ({})",
                placeholders(chunk.len())
            );
            let mut q = sqlx::query(&query).bind(worker_id);
            for id in chunk {
                q = q.bind(id);
            }
            released += q.execute(&mut *conn).await?.rows_affected();
        }
        Ok(released)
    }

    /// Delete processed rows created before `before` (retain mode only).
    pub async fn prune_processed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM status_queue WHERE processed = 1 AND created_at < ?")
            .bind(format_ts(before))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete terminal consolidated statuses last updated before `before`.
    /// Invocations with rows still waiting in the queue are kept.
    pub async fn prune_statuses(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM invocation_statuses
            WHERE updated_at < ?
              AND invocation_status IN ('SUCCESSFUL', 'FAILED', 'CANCELLED')
              AND NOT EXISTS (
                SELECT 1 FROM status_queue q
                WHERE q.invocation_id = invocation_statuses.invocation_id
                  AND q.processed = 0
              )
            "#,
        )
        .bind(format_ts(before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Unprocessed events of one invocation, oldest first.
    pub async fn pending_events(&self, invocation_id: &str) -> Result<Vec<StatusEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, seq, invocation_id, invocation_status, created_at, processed
            FROM status_queue
            WHERE invocation_id = ? AND processed = 0
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(invocation_id)
        .fetch_all(&self.pool)
        .await?;

        self.rows_to_events(rows)
    }

    /// Number of rows (processed or not) still stored for an invocation.
    pub async fn row_count(&self, invocation_id: &str) -> Result<u64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM status_queue WHERE invocation_id = ?")
                .bind(invocation_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    /// Number of unprocessed rows across all invocations.
    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM status_queue WHERE processed = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    /// Last consolidated status of an invocation.
    pub async fn consolidated_status(
        &self,
        invocation_id: &str,
    ) -> Result<Option<InvocationStatusRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT invocation_id, invocation_status, updated_at, last_event_at, last_event_seq
             FROM invocation_statuses WHERE invocation_id = ?",
        )
        .bind(invocation_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status_raw: String = row.get("invocation_status");
        let status = InvocationStatus::from_str(&status_raw)
            .ok_or(StoreError::UnknownStatus(status_raw))?;
        let updated_at_raw: String = row.get("updated_at");
        let position = stored_position(
            row.get("last_event_at"),
            row.get("last_event_seq"),
            Some(updated_at_raw.clone()),
        );

        Ok(Some(InvocationStatusRecord {
            invocation_id: row.get("invocation_id"),
            status,
            position,
            updated_at: parse_ts(&updated_at_raw).unwrap_or_else(Utc::now),
        }))
    }

    /// Effective status: the consolidated record folded with any rows still
    /// waiting in the queue.
    pub async fn resolve_status(
        &self,
        invocation_id: &str,
    ) -> Result<Option<InvocationStatus>, StoreError> {
        let prior = self
            .consolidated_status(invocation_id)
            .await?
            .map(|r| r.positioned());
        let pending = self.pending_events(invocation_id).await?;
        let resolved = resolve_effective(
            prior,
            pending
                .into_iter()
                .map(|e| (e.status, EventPosition::new(e.created_at, e.seq))),
        );
        Ok(resolved.map(|(status, _)| status))
    }

    // =========================================================================
    // Helper Methods
    // =========================================================================

    fn rows_to_events(
        &self,
        rows: Vec<sqlx::sqlite::SqliteRow>,
    ) -> Result<Vec<StatusEvent>, StoreError> {
        let mut events = Vec::new();
        for row in rows {
            let status_raw: String = row.get("invocation_status");
            let status = match InvocationStatus::from_str(&status_raw) {
                Some(s) => s,
                None => {
                    warn!("Unknown invocation status: {}", status_raw);
                    continue;
                }
            };
            let created_at_raw: String = row.get("created_at");
            let processed: i64 = row.get("processed");

            events.push(StatusEvent {
                id: row.get("id"),
                seq: row.get("seq"),
                invocation_id: row.get("invocation_id"),
                status,
                created_at: parse_ts(&created_at_raw).unwrap_or_else(Utc::now),
                processed: processed != 0,
            });
        }
        Ok(events)
    }
}

#[async_trait]
impl StatusLookup for StatusEventStore {
    async fn effective_status(
        &self,
        invocation_id: &str,
    ) -> Result<Option<InvocationStatus>, StoreError> {
        self.resolve_status(invocation_id).await
    }
}

/// Position stored with a consolidated status. Rows written before positions
/// were recorded fall back to their update time, which no consumed event
/// can postdate.
fn stored_position(
    event_at: Option<String>,
    event_seq: Option<i64>,
    updated_at: Option<String>,
) -> EventPosition {
    let created_at = event_at
        .or(updated_at)
        .as_deref()
        .and_then(parse_ts)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    EventPosition::new(created_at, event_seq.unwrap_or(0))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}
