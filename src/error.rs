//! Typed errors for the status queue, the deferred-task scheduler and the
//! reconciliation cycle.
//!
//! Caller-facing operations (reporting, scheduling, unscheduling) return these
//! directly. Periodic cycles log per-unit failures and only surface errors that
//! abort a whole cycle.

/// Failure against the durable status store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown invocation status '{0}'")]
    UnknownStatus(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("claim on invocation {invocation_id} was lost: consumed {consumed} of {expected} rows")]
    LeaseLost {
        invocation_id: String,
        expected: usize,
        consumed: u64,
    },
}

/// The scheduler rejected or could not perform an operation.
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("task '{0}' is already scheduled")]
    DuplicateTask(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("scheduler unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
}

impl From<sqlx::Error> for SchedulingError {
    fn from(err: sqlx::Error) -> Self {
        SchedulingError::Unavailable(err)
    }
}

/// Failure reconciling one specific task. Never aborts a cycle.
#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    #[error("failed to resolve status of invocation {invocation_id} for task {task_id}: {source}")]
    Resolve {
        task_id: String,
        invocation_id: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to cancel task {task_id}: {source}")]
    Cancel {
        task_id: String,
        #[source]
        source: SchedulingError,
    },
}

/// Error surfaced by the task monitor facade.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
