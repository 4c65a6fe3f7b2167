//! Watchdog task reconciliation.
//!
//! A deferred task is only useful while its invocation is running. The
//! reconciler cancels every live task whose invocation is anything other than
//! IN_PROGRESS, either on a periodic sweep or as soon as the consolidator
//! announces a new status.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ReconciliationError, SchedulingError};
use crate::status::{InvocationStatus, StatusChange};
use crate::telemetry::MonitorTelemetry;
use crate::traits::{ScheduledTask, StatusLookup, TaskScheduler};

/// Outcome of one reconciliation sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub cancelled: usize,
    pub kept: usize,
    pub failures: usize,
}

pub struct Reconciler {
    scheduler: Arc<dyn TaskScheduler>,
    lookup: Arc<dyn StatusLookup>,
    telemetry: Arc<MonitorTelemetry>,
}

impl Reconciler {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        lookup: Arc<dyn StatusLookup>,
        telemetry: Arc<MonitorTelemetry>,
    ) -> Self {
        Self {
            scheduler,
            lookup,
            telemetry,
        }
    }

    /// Sweep every live task. Failing to list tasks aborts the sweep; a
    /// failure on one task is logged and the sweep moves on.
    pub async fn run_cycle(&self) -> Result<ReconcileReport, SchedulingError> {
        let tasks = self.scheduler.list_active_tasks().await?;
        let mut report = ReconcileReport {
            examined: tasks.len(),
            ..Default::default()
        };

        for task in &tasks {
            match self.reconcile_task(task).await {
                Ok(true) => report.cancelled += 1,
                Ok(false) => report.kept += 1,
                Err(e) => {
                    report.failures += 1;
                    self.telemetry.mark_reconcile_failure();
                    warn!(task_id = %task.task_id, error = %e, "Reconciliation failed for task");
                }
            }
        }

        self.telemetry.mark_reconcile_cycle(report.examined as u64);
        if report.cancelled > 0 || report.failures > 0 {
            info!(
                examined = report.examined,
                cancelled = report.cancelled,
                failures = report.failures,
                "Reconciliation cycle complete"
            );
        } else {
            debug!(examined = report.examined, "Reconciliation cycle complete");
        }
        Ok(report)
    }

    /// Cancel `task` unless its invocation is IN_PROGRESS. Returns true if
    /// the task was cancelled by this call.
    pub async fn reconcile_task(&self, task: &ScheduledTask) -> Result<bool, ReconciliationError> {
        let status = self
            .lookup
            .effective_status(&task.invocation_id)
            .await
            .map_err(|source| ReconciliationError::Resolve {
                task_id: task.task_id.clone(),
                invocation_id: task.invocation_id.clone(),
                source,
            })?;

        if !needs_cancel(status) {
            return Ok(false);
        }

        let removed = self
            .scheduler
            .cancel(&task.task_id)
            .await
            .map_err(|source| ReconciliationError::Cancel {
                task_id: task.task_id.clone(),
                source,
            })?;

        if removed {
            self.telemetry.mark_task_cancelled();
            info!(
                task_id = %task.task_id,
                invocation_id = %task.invocation_id,
                status = status.map(|s| s.as_str()).unwrap_or("UNKNOWN"),
                "Cancelled watchdog task for invocation not in progress"
            );
        }
        Ok(removed)
    }

    /// React to a freshly consolidated status. Returns the number of tasks
    /// cancelled.
    pub async fn on_status_change(&self, change: &StatusChange) -> Result<usize, SchedulingError> {
        if !needs_cancel(Some(change.status)) {
            return Ok(0);
        }

        let tasks = self.scheduler.list_active_tasks().await?;
        let mut cancelled = 0;
        for task in tasks
            .iter()
            .filter(|t| t.invocation_id == change.invocation_id)
        {
            match self.scheduler.cancel(&task.task_id).await {
                Ok(true) => {
                    cancelled += 1;
                    self.telemetry.mark_task_cancelled();
                    info!(
                        task_id = %task.task_id,
                        invocation_id = %change.invocation_id,
                        status = %change.status,
                        "Cancelled watchdog task on status change"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    self.telemetry.mark_reconcile_failure();
                    warn!(task_id = %task.task_id, error = %e, "Failed to cancel task on status change");
                }
            }
        }
        Ok(cancelled)
    }

    /// Follow the consolidator's change stream until it closes.
    pub fn spawn_listener(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<StatusChange>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if let Err(e) = self.on_status_change(&change).await {
                            warn!(
                                invocation_id = %change.invocation_id,
                                error = %e,
                                "Status change reconciliation failed"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Status change listener lagged, next sweep will catch up");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Status change listener stopped");
        })
    }
}

/// Only an invocation that is currently running keeps its watchdog.
fn needs_cancel(status: Option<InvocationStatus>) -> bool {
    status != Some(InvocationStatus::InProgress)
}
