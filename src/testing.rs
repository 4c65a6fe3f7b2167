//! Test infrastructure: pool helpers, MockScheduler, scripted lookups and a
//! fully wired TestHarness on a real SQLite file.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Mutex};

use crate::config::ConsolidationConfig;
use crate::error::{SchedulingError, StoreError};
use crate::monitor::TaskMonitor;
use crate::reconciler::Reconciler;
use crate::scheduler::SqliteTaskScheduler;
use crate::status::{
    Consolidator, InvocationStatus, StatusChange, StatusEventStore, StatusReporter,
};
use crate::telemetry::MonitorTelemetry;
use crate::traits::{FireHandler, ScheduledTask, StatusLookup, TaskScheduler};

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

/// File-backed pool with several connections, so concurrent workers really
/// contend. Keep the returned file alive for the duration of the test.
pub async fn setup_file_pool() -> (SqlitePool, tempfile::NamedTempFile) {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let url = format!("sqlite:{}", db_file.path().display());
    let opts = SqliteConnectOptions::from_str(&url)
        .unwrap()
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(opts)
        .await
        .unwrap();
    (pool, db_file)
}

/// In-memory pool. One connection, since every connection to `:memory:`
/// opens its own database.
pub async fn setup_memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

fn unavailable() -> SchedulingError {
    SchedulingError::Unavailable(sqlx::Error::PoolTimedOut)
}

// ---------------------------------------------------------------------------
// MockScheduler
// ---------------------------------------------------------------------------

/// In-memory scheduler with scriptable failures.
#[derive(Default)]
pub struct MockScheduler {
    tasks: Mutex<Vec<ScheduledTask>>,
    failing_cancels: Mutex<HashSet<String>>,
    unavailable: Mutex<bool>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `cancel(task_id)` fail until the end of the test.
    pub async fn fail_cancel_for(&self, task_id: &str) {
        self.failing_cancels.lock().await.insert(task_id.to_string());
    }

    /// Make every operation fail as if the backing store were down.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().await = unavailable;
    }
}

#[async_trait]
impl TaskScheduler for MockScheduler {
    async fn schedule(
        &self,
        task_id: &str,
        invocation_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), SchedulingError> {
        if *self.unavailable.lock().await {
            return Err(unavailable());
        }
        let mut tasks = self.tasks.lock().await;
        if tasks.iter().any(|t| t.task_id == task_id) {
            return Err(SchedulingError::DuplicateTask(task_id.to_string()));
        }
        tasks.push(ScheduledTask {
            task_id: task_id.to_string(),
            invocation_id: invocation_id.to_string(),
            fire_at,
        });
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> Result<bool, SchedulingError> {
        if *self.unavailable.lock().await || self.failing_cancels.lock().await.contains(task_id) {
            return Err(unavailable());
        }
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|t| t.task_id != task_id);
        Ok(tasks.len() < before)
    }

    async fn list_active_tasks(&self) -> Result<Vec<ScheduledTask>, SchedulingError> {
        if *self.unavailable.lock().await {
            return Err(unavailable());
        }
        Ok(self.tasks.lock().await.clone())
    }
}

// ---------------------------------------------------------------------------
// Lookups and fire handlers
// ---------------------------------------------------------------------------

/// Fixed invocation statuses; anything else is unknown.
pub struct StaticLookup {
    statuses: HashMap<String, InvocationStatus>,
}

impl StaticLookup {
    pub fn empty() -> Self {
        Self {
            statuses: HashMap::new(),
        }
    }

    pub fn new<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, InvocationStatus)>,
    {
        Self {
            statuses: entries
                .into_iter()
                .map(|(id, status)| (id.to_string(), status))
                .collect(),
        }
    }
}

#[async_trait]
impl StatusLookup for StaticLookup {
    async fn effective_status(
        &self,
        invocation_id: &str,
    ) -> Result<Option<InvocationStatus>, StoreError> {
        Ok(self.statuses.get(invocation_id).copied())
    }
}

/// Lookup whose store is always down.
pub struct FailingLookup;

#[async_trait]
impl StatusLookup for FailingLookup {
    async fn effective_status(
        &self,
        _invocation_id: &str,
    ) -> Result<Option<InvocationStatus>, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }
}

/// Records every fired task; optionally fails each one.
#[derive(Default)]
pub struct RecordingFireHandler {
    fired: Mutex<Vec<ScheduledTask>>,
    fail: bool,
}

impl RecordingFireHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub async fn fired_task_ids(&self) -> Vec<String> {
        self.fired
            .lock()
            .await
            .iter()
            .map(|t| t.task_id.clone())
            .collect()
    }
}

#[async_trait]
impl FireHandler for RecordingFireHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_fire(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        self.fired.lock().await.push(task.clone());
        if self.fail {
            anyhow::bail!("scripted fire failure for {}", task.task_id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TestHarness
// ---------------------------------------------------------------------------

/// Every component wired to one SQLite file, the way the daemon wires them.
pub struct TestHarness {
    pub pool: SqlitePool,
    pub store: Arc<StatusEventStore>,
    pub reporter: Arc<StatusReporter>,
    pub scheduler: Arc<SqliteTaskScheduler>,
    pub consolidator: Arc<Consolidator>,
    pub reconciler: Arc<Reconciler>,
    pub monitor: TaskMonitor,
    pub telemetry: Arc<MonitorTelemetry>,
    pub changes: broadcast::Sender<StatusChange>,
    _db_file: tempfile::NamedTempFile,
}

impl TestHarness {
    /// A second consolidator on the same store and change channel.
    pub fn consolidator(&self, worker_id: &str, config: &ConsolidationConfig) -> Consolidator {
        Consolidator::new(
            self.store.clone(),
            worker_id,
            config,
            self.changes.clone(),
            self.telemetry.clone(),
        )
    }
}

pub async fn setup_harness() -> TestHarness {
    setup_harness_with(&ConsolidationConfig::default()).await
}

pub async fn setup_harness_with(config: &ConsolidationConfig) -> TestHarness {
    let (pool, db_file) = setup_file_pool().await;
    let telemetry = Arc::new(MonitorTelemetry::new());
    let store = Arc::new(StatusEventStore::new(pool.clone()).await.unwrap());
    let reporter = Arc::new(StatusReporter::new(store.clone(), telemetry.clone()));
    let scheduler = Arc::new(
        SqliteTaskScheduler::new(pool.clone(), telemetry.clone())
            .await
            .unwrap(),
    );
    let (changes, _) = broadcast::channel(256);
    let consolidator = Arc::new(Consolidator::new(
        store.clone(),
        "worker-a",
        config,
        changes.clone(),
        telemetry.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        scheduler.clone(),
        store.clone(),
        telemetry.clone(),
    ));
    let monitor = TaskMonitor::new(
        scheduler.clone(),
        reporter.clone(),
        store.clone(),
        telemetry.clone(),
    );

    TestHarness {
        pool,
        store,
        reporter,
        scheduler,
        consolidator,
        reconciler,
        monitor,
        telemetry,
        changes,
        _db_file: db_file,
    }
}
