use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::{MonitorError, SchedulingError};
use crate::status::{InvocationStatus, ReportOutcome, StatusReporter};
use crate::telemetry::MonitorTelemetry;
use crate::traits::{StatusLookup, TaskScheduler};

/// Single entry point for callers: watchdog scheduling plus status reporting.
pub struct TaskMonitor {
    scheduler: Arc<dyn TaskScheduler>,
    reporter: Arc<StatusReporter>,
    lookup: Arc<dyn StatusLookup>,
    telemetry: Arc<MonitorTelemetry>,
}

impl TaskMonitor {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        reporter: Arc<StatusReporter>,
        lookup: Arc<dyn StatusLookup>,
        telemetry: Arc<MonitorTelemetry>,
    ) -> Self {
        Self {
            scheduler,
            reporter,
            lookup,
            telemetry,
        }
    }

    /// Register a watchdog task firing `delay_secs` from now for `invocation_id`.
    /// No status is written.
    pub async fn schedule_task(
        &self,
        task_id: &str,
        invocation_id: &str,
        delay_secs: u64,
    ) -> Result<(), SchedulingError> {
        if task_id.trim().is_empty() {
            return Err(SchedulingError::InvalidInput("task id must not be empty".to_string()));
        }
        if invocation_id.trim().is_empty() {
            return Err(SchedulingError::InvalidInput(
                "invocation id must not be empty".to_string(),
            ));
        }
        let delay = i64::try_from(delay_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| SchedulingError::InvalidInput(format!("delay {}s out of range", delay_secs)))?;
        let fire_at = Utc::now()
            .checked_add_signed(delay)
            .ok_or_else(|| SchedulingError::InvalidInput(format!("delay {}s out of range", delay_secs)))?;

        self.scheduler.schedule(task_id, invocation_id, fire_at).await?;
        self.telemetry.mark_scheduled();
        info!(task_id, invocation_id, fire_at = %fire_at, "Watchdog task scheduled");
        Ok(())
    }

    /// Cancel a watchdog task. CANCELLED is appended for `invocation_id` only
    /// when this call actually removed the task. Returns whether it did.
    pub async fn unschedule_task(
        &self,
        task_id: &str,
        invocation_id: &str,
    ) -> Result<bool, MonitorError> {
        // A removed task must always get its CANCELLED event.
        if invocation_id.trim().is_empty() {
            return Err(SchedulingError::InvalidInput(
                "invocation id must not be empty".to_string(),
            )
            .into());
        }
        let removed = self.scheduler.cancel(task_id).await?;
        if !removed {
            info!(task_id, invocation_id, "No live task to unschedule");
            return Ok(false);
        }

        self.telemetry.mark_unscheduled();
        let outcome = self
            .reporter
            .report(invocation_id, InvocationStatus::Cancelled)
            .await?;
        info!(
            task_id,
            invocation_id,
            cancelled_recorded = outcome.is_appended(),
            "Watchdog task unscheduled"
        );
        Ok(true)
    }

    pub async fn report_status(
        &self,
        invocation_id: &str,
        status: InvocationStatus,
    ) -> Result<ReportOutcome, MonitorError> {
        Ok(self.reporter.report(invocation_id, status).await?)
    }

    pub async fn effective_status(
        &self,
        invocation_id: &str,
    ) -> Result<Option<InvocationStatus>, MonitorError> {
        Ok(self.lookup.effective_status(invocation_id).await?)
    }
}
