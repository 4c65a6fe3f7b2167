use std::sync::Arc;

use tracing::{debug, warn};

use super::{InvocationStatus, StatusEvent, StatusEventStore};
use crate::error::StoreError;
use crate::telemetry::MonitorTelemetry;

/// Result of a status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// A new event was appended to the queue.
    Appended { event_id: String },
    /// The invocation already reached a terminal status; nothing was written.
    Rejected { current: InvocationStatus },
}

impl ReportOutcome {
    pub fn is_appended(&self) -> bool {
        matches!(self, ReportOutcome::Appended { .. })
    }
}

/// Appends status events. Never updates in place, never touches the scheduler.
pub struct StatusReporter {
    store: Arc<StatusEventStore>,
    telemetry: Arc<MonitorTelemetry>,
}

impl StatusReporter {
    pub fn new(store: Arc<StatusEventStore>, telemetry: Arc<MonitorTelemetry>) -> Self {
        Self { store, telemetry }
    }

    /// Report a status transition for an invocation.
    ///
    /// Reports for an invocation whose effective status is already terminal
    /// are rejected so a late event cannot resurrect it.
    pub async fn report(
        &self,
        invocation_id: &str,
        status: InvocationStatus,
    ) -> Result<ReportOutcome, StoreError> {
        if invocation_id.trim().is_empty() {
            return Err(StoreError::InvalidInput(
                "invocation id must not be empty".to_string(),
            ));
        }

        if let Some(current) = self.store.resolve_status(invocation_id).await? {
            if current.is_terminal() {
                warn!(
                    invocation_id,
                    current = %current,
                    rejected = %status,
                    "Ignoring status report for invocation in terminal state"
                );
                self.telemetry.mark_stale_rejected();
                return Ok(ReportOutcome::Rejected { current });
            }
        }

        let event = StatusEvent::new(invocation_id, status);
        self.store.append(&event).await?;
        self.telemetry.mark_reported();
        debug!(invocation_id, status = %status, event_id = %event.id, "Status reported");

        Ok(ReportOutcome::Appended { event_id: event.id })
    }

    pub fn store(&self) -> Arc<StatusEventStore> {
        self.store.clone()
    }
}
