use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::OnFireAction;
use crate::status::{InvocationStatus, ReportOutcome, StatusReporter};
use crate::traits::{FireHandler, ScheduledTask, StatusLookup};

/// Marks an invocation FAILED when its watchdog fires before it finished.
pub struct TimeoutFireHandler {
    reporter: Arc<StatusReporter>,
}

impl TimeoutFireHandler {
    pub fn new(reporter: Arc<StatusReporter>) -> Self {
        Self { reporter }
    }
}

#[async_trait]
impl FireHandler for TimeoutFireHandler {
    fn name(&self) -> &str {
        "timeout"
    }

    async fn on_fire(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        let current = self
            .reporter
            .store()
            .resolve_status(&task.invocation_id)
            .await?;
        if let Some(status) = current.filter(|s| s.is_terminal()) {
            debug!(
                task_id = %task.task_id,
                invocation_id = %task.invocation_id,
                status = %status,
                "Watchdog fired after invocation finished"
            );
            return Ok(());
        }

        // The reporter re-checks the terminal guard, so a completion that
        // lands between the read above and this write still wins.
        match self
            .reporter
            .report(&task.invocation_id, InvocationStatus::Failed)
            .await?
        {
            ReportOutcome::Appended { .. } => warn!(
                task_id = %task.task_id,
                invocation_id = %task.invocation_id,
                previous = ?current,
                "Invocation timed out, marked FAILED"
            ),
            ReportOutcome::Rejected { current } => debug!(
                invocation_id = %task.invocation_id,
                status = %current,
                "Invocation finished before timeout was recorded"
            ),
        }
        Ok(())
    }
}

/// Treats the firing as the invocation's run: IN_PROGRESS, then SUCCESSFUL.
pub struct CompleteFireHandler {
    reporter: Arc<StatusReporter>,
}

impl CompleteFireHandler {
    pub fn new(reporter: Arc<StatusReporter>) -> Self {
        Self { reporter }
    }
}

#[async_trait]
impl FireHandler for CompleteFireHandler {
    fn name(&self) -> &str {
        "complete"
    }

    async fn on_fire(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        for status in [InvocationStatus::InProgress, InvocationStatus::Successful] {
            if let ReportOutcome::Rejected { current } =
                self.reporter.report(&task.invocation_id, status).await?
            {
                debug!(
                    task_id = %task.task_id,
                    invocation_id = %task.invocation_id,
                    status = %current,
                    "Invocation already finished, skipping run"
                );
                return Ok(());
            }
        }
        info!(
            task_id = %task.task_id,
            invocation_id = %task.invocation_id,
            "Invocation run on fire, marked SUCCESSFUL"
        );
        Ok(())
    }
}

/// Logs the effective status of the invocation and changes nothing.
pub struct LogFireHandler {
    lookup: Arc<dyn StatusLookup>,
}

impl LogFireHandler {
    pub fn new(lookup: Arc<dyn StatusLookup>) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl FireHandler for LogFireHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_fire(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        let status = self.lookup.effective_status(&task.invocation_id).await?;
        info!(
            task_id = %task.task_id,
            invocation_id = %task.invocation_id,
            status = status.map(|s| s.as_str()).unwrap_or("UNKNOWN"),
            "Watchdog task fired"
        );
        Ok(())
    }
}

/// Build the fire handler selected by `scheduler.on_fire`.
pub fn build(action: OnFireAction, reporter: Arc<StatusReporter>) -> Arc<dyn FireHandler> {
    match action {
        OnFireAction::Fail => Arc::new(TimeoutFireHandler::new(reporter)),
        OnFireAction::Log => Arc::new(LogFireHandler::new(reporter.store())),
        OnFireAction::Complete => Arc::new(CompleteFireHandler::new(reporter)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusEventStore;
    use crate::telemetry::MonitorTelemetry;
    use crate::testing::setup_memory_pool;
    use chrono::Utc;
    use InvocationStatus::*;

    async fn setup_reporter() -> Arc<StatusReporter> {
        let store = Arc::new(StatusEventStore::new(setup_memory_pool().await).await.unwrap());
        Arc::new(StatusReporter::new(store, Arc::new(MonitorTelemetry::new())))
    }

    fn task(invocation_id: &str) -> ScheduledTask {
        ScheduledTask {
            task_id: format!("watch-{}", invocation_id),
            invocation_id: invocation_id.to_string(),
            fire_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn timeout_fails_unfinished_invocation() {
        let reporter = setup_reporter().await;
        reporter.report("inv-1", InProgress).await.unwrap();

        let handler = TimeoutFireHandler::new(reporter.clone());
        handler.on_fire(&task("inv-1")).await.unwrap();

        let store = reporter.store();
        assert_eq!(store.resolve_status("inv-1").await.unwrap(), Some(Failed));
    }

    #[tokio::test]
    async fn timeout_leaves_finished_invocation_alone() {
        let reporter = setup_reporter().await;
        reporter.report("inv-1", Successful).await.unwrap();

        let handler = TimeoutFireHandler::new(reporter.clone());
        handler.on_fire(&task("inv-1")).await.unwrap();

        let store = reporter.store();
        assert_eq!(store.resolve_status("inv-1").await.unwrap(), Some(Successful));
        assert_eq!(store.pending_events("inv-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn complete_reports_in_progress_then_successful() {
        let reporter = setup_reporter().await;
        reporter.report("inv-1", Scheduled).await.unwrap();

        let handler = build(OnFireAction::Complete, reporter.clone());
        assert_eq!(handler.name(), "complete");
        handler.on_fire(&task("inv-1")).await.unwrap();

        let store = reporter.store();
        let statuses: Vec<InvocationStatus> = store
            .pending_events("inv-1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses, vec![Scheduled, InProgress, Successful]);
        assert_eq!(store.resolve_status("inv-1").await.unwrap(), Some(Successful));
    }

    #[tokio::test]
    async fn complete_skips_cancelled_invocation() {
        let reporter = setup_reporter().await;
        reporter.report("inv-1", Cancelled).await.unwrap();

        CompleteFireHandler::new(reporter.clone())
            .on_fire(&task("inv-1"))
            .await
            .unwrap();

        let store = reporter.store();
        assert_eq!(store.pending_events("inv-1").await.unwrap().len(), 1);
        assert_eq!(store.resolve_status("inv-1").await.unwrap(), Some(Cancelled));
    }

    #[tokio::test]
    async fn log_handler_writes_nothing() {
        let reporter = setup_reporter().await;
        reporter.report("inv-1", InProgress).await.unwrap();

        let handler = build(OnFireAction::Log, reporter.clone());
        assert_eq!(handler.name(), "log");
        handler.on_fire(&task("inv-1")).await.unwrap();

        let store = reporter.store();
        assert_eq!(store.resolve_status("inv-1").await.unwrap(), Some(InProgress));
    }
}
