use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SchedulingError, StoreError};
use crate::status::InvocationStatus;

/// A deferred task registered with the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    /// Payload: the invocation this task watches.
    pub invocation_id: String,
    pub fire_at: DateTime<Utc>,
}

/// Deferred-execution scheduler: fire-at-time tasks carrying an invocation id.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Register a task. Fails if the task id is already registered.
    async fn schedule(
        &self,
        task_id: &str,
        invocation_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), SchedulingError>;

    /// Remove a task. Returns true only if a task was actually removed.
    async fn cancel(&self, task_id: &str) -> Result<bool, SchedulingError>;

    /// Snapshot of every task that has neither fired nor been cancelled.
    async fn list_active_tasks(&self) -> Result<Vec<ScheduledTask>, SchedulingError>;
}

/// Resolves the effective status of an invocation.
#[async_trait]
pub trait StatusLookup: Send + Sync {
    async fn effective_status(
        &self,
        invocation_id: &str,
    ) -> Result<Option<InvocationStatus>, StoreError>;
}

/// Invoked by the scheduler when a deferred task fires.
#[async_trait]
pub trait FireHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn on_fire(&self, task: &ScheduledTask) -> anyhow::Result<()>;
}
