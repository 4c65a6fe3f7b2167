//! Status queue consolidation.
//!
//! Consolidation collapses each invocation's pending status events into a
//! single effective status, records it, and consumes the rows. Several
//! consolidators may run at once (same or different processes): each claims
//! its own invocations through a lease, so overlapping runs split the queue
//! instead of racing on it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection, Sqlite, Transaction};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::store::ClaimedGroup;
use super::{StatusChange, StatusEventStore};
use crate::config::ConsolidationConfig;
use crate::error::StoreError;
use crate::telemetry::MonitorTelemetry;

/// Statistics from one consolidation run
#[derive(Debug, Default)]
pub struct ConsolidationReport {
    pub rows_claimed: u64,
    pub groups: usize,
    pub rows_consumed: usize,
    pub failed_groups: usize,
    /// One entry per committed group that produced an effective status.
    pub changes: Vec<StatusChange>,
}

impl ConsolidationReport {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Drains the status queue into one effective status per invocation.
pub struct Consolidator {
    store: Arc<StatusEventStore>,
    worker_id: String,
    lease: Duration,
    batch_size: usize,
    retain_processed: bool,
    changes: broadcast::Sender<StatusChange>,
    telemetry: Arc<MonitorTelemetry>,
}

impl Consolidator {
    pub fn new(
        store: Arc<StatusEventStore>,
        worker_id: impl Into<String>,
        config: &ConsolidationConfig,
        changes: broadcast::Sender<StatusChange>,
        telemetry: Arc<MonitorTelemetry>,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            lease: Duration::from_secs(config.lease_secs),
            batch_size: config.batch_size,
            retain_processed: config.retain_processed,
            changes,
            telemetry,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Subscribe to consolidated status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    /// Run one consolidation cycle.
    ///
    /// Claim or load failures abort the cycle; nothing has been consumed at
    /// that point and the rows stay claimable once the lease lapses. Failures
    /// inside one invocation group roll back that group only.
    pub async fn run_cycle(&self) -> Result<ConsolidationReport, StoreError> {
        let rows_claimed = self
            .store
            .claim_unprocessed(&self.worker_id, self.lease, self.batch_size)
            .await?;
        self.telemetry.mark_consolidation_run(rows_claimed);

        // Also picks up rows this worker still holds from an earlier run.
        let groups = self.store.load_claimed_groups(&self.worker_id).await?;
        if groups.is_empty() {
            return Ok(ConsolidationReport {
                rows_claimed,
                ..ConsolidationReport::empty()
            });
        }

        let mut report = ConsolidationReport {
            rows_claimed,
            groups: groups.len(),
            ..ConsolidationReport::empty()
        };
        let mut committed: Vec<(StatusChange, bool)> = Vec::with_capacity(groups.len());
        let mut failed: Vec<Vec<String>> = Vec::new();

        let mut tx = self.store.begin().await?;
        for group in &groups {
            match self.consume_group(&mut tx, group).await {
                Ok(change) => committed.push(change),
                Err(e) => {
                    warn!(
                        worker_id = %self.worker_id,
                        invocation_id = %group.invocation_id,
                        rows = group.rows.len(),
                        error = %e,
                        "Failed to consolidate invocation group; leaving rows for next run"
                    );
                    self.telemetry.mark_group_failed();
                    report.failed_groups += 1;
                    failed.push(group.row_ids());
                }
            }
        }

        for ids in &failed {
            if let Err(e) = StatusEventStore::release_claims(&mut tx, &self.worker_id, ids).await {
                warn!(worker_id = %self.worker_id, error = %e, "Failed to release claim; lease expiry will free it");
            }
        }
        tx.commit().await.map_err(StoreError::from)?;

        for (change, emit) in committed {
            report.rows_consumed += change.consumed_rows;
            self.telemetry
                .mark_group_consolidated(change.consumed_rows as u64);
            if emit {
                if self.changes.send(change.clone()).is_err() {
                    debug!(invocation_id = %change.invocation_id, "No status change receivers active");
                }
                report.changes.push(change);
            }
        }

        info!(
            worker_id = %self.worker_id,
            groups = report.groups,
            rows_consumed = report.rows_consumed,
            failed_groups = report.failed_groups,
            "Status queue consolidation complete"
        );

        Ok(report)
    }

    /// Consume one group inside its own savepoint.
    ///
    /// Returns the change and whether it carries an effective status worth
    /// emitting (groups made only of unreadable rows are consumed silently).
    async fn consume_group(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        group: &ClaimedGroup,
    ) -> Result<(StatusChange, bool), StoreError> {
        let mut savepoint = tx.begin().await?;
        match self.apply_group(&mut savepoint, group).await {
            Ok(change) => {
                savepoint.commit().await?;
                Ok(change)
            }
            Err(e) => {
                if let Err(rollback_err) = savepoint.rollback().await {
                    warn!(
                        invocation_id = %group.invocation_id,
                        error = %rollback_err,
                        "Savepoint rollback failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn apply_group(
        &self,
        conn: &mut SqliteConnection,
        group: &ClaimedGroup,
    ) -> Result<(StatusChange, bool), StoreError> {
        let ids = group.row_ids();
        let effective = group.effective_status();

        if let (Some(latest), Some((status, _))) = (group.latest_status(), effective) {
            if latest != status {
                info!(
                    invocation_id = %group.invocation_id,
                    latest = %latest,
                    effective = %status,
                    "Ignoring stale status events"
                );
            }
        }

        if let Some(positioned) = effective {
            StatusEventStore::upsert_effective(conn, &group.invocation_id, positioned).await?;
        }

        let consumed = if self.retain_processed {
            StatusEventStore::mark_processed(conn, &self.worker_id, &ids).await?
        } else {
            StatusEventStore::delete_claimed(conn, &self.worker_id, &ids).await?
        };
        if consumed as usize != ids.len() {
            return Err(StoreError::LeaseLost {
                invocation_id: group.invocation_id.clone(),
                expected: ids.len(),
                consumed,
            });
        }

        let change = StatusChange {
            invocation_id: group.invocation_id.clone(),
            // Unreadable-only groups fall back to the prior status, if any.
            status: effective
                .or(group.prior)
                .map(|(status, _)| status)
                .unwrap_or(super::InvocationStatus::Scheduled),
            previous: group.prior_status(),
            consumed_rows: ids.len(),
        };
        Ok((change, effective.is_some()))
    }
}

/// Rows removed by one prune pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub queue_rows: u64,
    pub statuses: u64,
}

/// Ages out what consolidation leaves behind.
///
/// Processed queue rows exist only in retain mode. Terminal consolidated
/// statuses are kept for `status_retention_hours` after their last update,
/// and never while the invocation still has rows waiting in the queue.
pub struct Pruner {
    store: Arc<StatusEventStore>,
    processed_retention: Option<chrono::Duration>,
    status_retention: Option<chrono::Duration>,
}

impl Pruner {
    pub fn new(store: Arc<StatusEventStore>, config: &ConsolidationConfig) -> Self {
        let hours = |h: u64| chrono::Duration::try_hours(i64::try_from(h).unwrap_or(i64::MAX));
        Self {
            store,
            processed_retention: if config.retain_processed {
                hours(config.processed_retention_hours)
            } else {
                None
            },
            status_retention: match config.status_retention_hours {
                0 => None,
                h => hours(h),
            },
        }
    }

    /// Whether any prune pass has work to do under this configuration.
    pub fn is_enabled(&self) -> bool {
        self.processed_retention.is_some() || self.status_retention.is_some()
    }

    pub async fn prune(&self) -> Result<PruneReport, StoreError> {
        let now = Utc::now();
        let mut report = PruneReport::default();
        if let Some(cutoff) = self.processed_retention.and_then(|r| now.checked_sub_signed(r)) {
            report.queue_rows = self.store.prune_processed(cutoff).await?;
        }
        if let Some(cutoff) = self.status_retention.and_then(|r| now.checked_sub_signed(r)) {
            report.statuses = self.store.prune_statuses(cutoff).await?;
        }
        if report.queue_rows > 0 || report.statuses > 0 {
            info!(
                queue_rows = report.queue_rows,
                statuses = report.statuses,
                "Pruned consolidated state"
            );
        }
        Ok(report)
    }
}
