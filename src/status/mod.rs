//! Append-only invocation status queue.
//!
//! Every status transition of an invocation is captured as an immutable
//! [`StatusEvent`]. The queue serves three readers:
//! - **Consolidation**: collapses each invocation's pending events into one
//!   effective status and consumes the rows
//! - **Reconciliation**: decides whether an invocation's watchdog task is
//!   still needed
//! - **Reporting guard**: refuses to move an invocation out of a terminal state

mod consolidation;
mod reporter;
mod store;

pub use consolidation::{ConsolidationReport, Consolidator, Pruner};
pub use reporter::{ReportOutcome, StatusReporter};
pub use store::StatusEventStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an invocation, persisted as the upper-case literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Scheduled,
    InProgress,
    Successful,
    Failed,
    Cancelled,
}

impl InvocationStatus {
    /// Returns the string representation for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Scheduled => "SCHEDULED",
            InvocationStatus::InProgress => "IN_PROGRESS",
            InvocationStatus::Successful => "SUCCESSFUL",
            InvocationStatus::Failed => "FAILED",
            InvocationStatus::Cancelled => "CANCELLED",
        }
    }

    /// Parse from string (database storage or CLI input, case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "SCHEDULED" => Some(InvocationStatus::Scheduled),
            "IN_PROGRESS" => Some(InvocationStatus::InProgress),
            "SUCCESSFUL" => Some(InvocationStatus::Successful),
            "FAILED" => Some(InvocationStatus::Failed),
            "CANCELLED" => Some(InvocationStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Successful | InvocationStatus::Failed | InvocationStatus::Cancelled
        )
    }
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single immutable status fact about an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: String,
    /// Arrival order; breaks ties between identical `created_at` values.
    pub seq: i64,
    pub invocation_id: String,
    pub status: InvocationStatus,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
}

impl StatusEvent {
    /// Create a new event (seq will be assigned by the database)
    pub fn new(invocation_id: impl Into<String>, status: InvocationStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            invocation_id: invocation_id.into(),
            status,
            created_at: Utc::now(),
            processed: false,
        }
    }
}

/// One consolidated status signal, emitted once per consumed invocation group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub invocation_id: String,
    pub status: InvocationStatus,
    /// Effective status before this consolidation, if one was recorded.
    pub previous: Option<InvocationStatus>,
    pub consumed_rows: usize,
}

/// Where an event sits in an invocation's history: creation time, then
/// arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EventPosition {
    pub created_at: DateTime<Utc>,
    pub seq: i64,
}

impl EventPosition {
    pub fn new(created_at: DateTime<Utc>, seq: i64) -> Self {
        Self { created_at, seq }
    }
}

/// A status together with the position of the event that set it.
pub type PositionedStatus = (InvocationStatus, EventPosition);

/// Fold an invocation's history into its effective status.
///
/// `prior` is the last consolidated status; `events` must be ordered oldest
/// first. An event positioned at or before the current status is stale, and
/// once a terminal status is reached every later event is stale too.
pub fn resolve_effective<I>(prior: Option<PositionedStatus>, events: I) -> Option<PositionedStatus>
where
    I: IntoIterator<Item = PositionedStatus>,
{
    let mut current = prior;
    for (status, position) in events {
        match current {
            Some((s, _)) if s.is_terminal() => break,
            Some((_, at)) if position <= at => continue,
            _ => current = Some((status, position)),
        }
    }
    current
}

/// Format a timestamp for storage. Fixed width, so text order is time order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
