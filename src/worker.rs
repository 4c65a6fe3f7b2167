//! Periodic cycle runner for the daemon.
//!
//! Consolidation, reconciliation and pruning each run as a [`Cycle`] on its
//! own interval. A run that is still in flight is never started twice; a run
//! that errors or panics pushes its next start out exponentially. Results are
//! collected on the following tick and published through [`MonitorTelemetry`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::reconciler::Reconciler;
use crate::status::{Consolidator, Pruner};
use crate::telemetry::MonitorTelemetry;

/// Cap on the backoff exponent: a failing cycle waits at most `interval * 32`.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// What one successful cycle run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    Consolidated {
        groups: usize,
        rows_consumed: usize,
        failed_groups: usize,
    },
    Reconciled {
        examined: usize,
        cancelled: usize,
        failures: usize,
    },
    Pruned {
        queue_rows: u64,
        statuses: u64,
    },
}

impl CycleOutcome {
    /// Units that failed inside a run that as a whole succeeded.
    pub fn partial_failures(&self) -> usize {
        match self {
            CycleOutcome::Consolidated { failed_groups, .. } => *failed_groups,
            CycleOutcome::Reconciled { failures, .. } => *failures,
            CycleOutcome::Pruned { .. } => 0,
        }
    }
}

/// A unit of periodic work.
#[async_trait]
pub trait Cycle: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<CycleOutcome>;
}

#[async_trait]
impl Cycle for Consolidator {
    fn name(&self) -> &'static str {
        "consolidate"
    }

    async fn run(&self) -> anyhow::Result<CycleOutcome> {
        let report = self.run_cycle().await?;
        Ok(CycleOutcome::Consolidated {
            groups: report.groups,
            rows_consumed: report.rows_consumed,
            failed_groups: report.failed_groups,
        })
    }
}

#[async_trait]
impl Cycle for Reconciler {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    async fn run(&self) -> anyhow::Result<CycleOutcome> {
        let report = self.run_cycle().await?;
        Ok(CycleOutcome::Reconciled {
            examined: report.examined,
            cancelled: report.cancelled,
            failures: report.failures,
        })
    }
}

#[async_trait]
impl Cycle for Pruner {
    fn name(&self) -> &'static str {
        "prune"
    }

    async fn run(&self) -> anyhow::Result<CycleOutcome> {
        let report = self.prune().await?;
        Ok(CycleOutcome::Pruned {
            queue_rows: report.queue_rows,
            statuses: report.statuses,
        })
    }
}

/// Delay before the next run after `failures` consecutive failed runs.
pub fn backoff_interval(interval: Duration, failures: u32) -> Duration {
    interval * 2u32.pow(failures.min(MAX_BACKOFF_EXPONENT))
}

struct CycleSlot {
    cycle: Arc<dyn Cycle>,
    interval: Duration,
    next_due: Instant,
    failures: u32,
    in_flight: Option<JoinHandle<anyhow::Result<CycleOutcome>>>,
}

/// Drives every registered cycle from one tick loop.
pub struct WorkerCoordinator {
    slots: Vec<CycleSlot>,
    pool: SqlitePool,
    permits: Arc<Semaphore>,
    tick_interval: Duration,
    telemetry: Arc<MonitorTelemetry>,
    db_reachable: bool,
}

impl WorkerCoordinator {
    pub fn new(
        pool: SqlitePool,
        tick_interval: Duration,
        max_concurrent: usize,
        telemetry: Arc<MonitorTelemetry>,
    ) -> Self {
        Self {
            slots: Vec::new(),
            pool,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tick_interval,
            telemetry,
            db_reachable: true,
        }
    }

    /// Register `cycle` to run every `interval`, first on the next tick.
    pub fn register(&mut self, cycle: Arc<dyn Cycle>, interval: Duration) {
        self.telemetry.register_cycle(cycle.name(), interval);
        self.slots.push(CycleSlot {
            cycle,
            interval,
            next_due: Instant::now(),
            failures: 0,
            in_flight: None,
        });
    }

    pub fn cycle_count(&self) -> usize {
        self.slots.len()
    }

    pub fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(cycles = self.slots.len(), "Worker coordinator started");
            loop {
                self.tick().await;
                tokio::time::sleep(self.tick_interval).await;
            }
        })
    }

    /// Settle finished runs, then start every idle cycle that is due.
    /// Nothing starts while the database is unreachable.
    pub(crate) async fn tick(&mut self) {
        for slot in &mut self.slots {
            if slot.in_flight.as_ref().is_some_and(|h| h.is_finished()) {
                if let Some(handle) = slot.in_flight.take() {
                    let result = handle.await;
                    settle(slot, result, &self.telemetry);
                }
            }
        }

        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) if !self.db_reachable => {
                info!("Database reachable again, resuming cycles");
                self.db_reachable = true;
            }
            Ok(_) => {}
            Err(e) => {
                if self.db_reachable {
                    error!(error = %e, "Database unreachable, holding cycles");
                    self.db_reachable = false;
                }
                return;
            }
        }

        let now = Instant::now();
        for slot in &mut self.slots {
            if slot.in_flight.is_some() {
                debug!(cycle = slot.cycle.name(), "Previous run still in flight");
                continue;
            }
            if now < slot.next_due {
                continue;
            }
            let cycle = slot.cycle.clone();
            let permits = self.permits.clone();
            slot.in_flight = Some(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await?;
                cycle.run().await
            }));
        }
    }
}

/// Record a finished run and schedule the slot's next start.
fn settle(
    slot: &mut CycleSlot,
    result: Result<anyhow::Result<CycleOutcome>, JoinError>,
    telemetry: &MonitorTelemetry,
) {
    let name = slot.cycle.name();
    let error = match result {
        Ok(Ok(outcome)) => {
            if slot.failures > 0 {
                info!(cycle = name, after_failures = slot.failures, "Cycle recovered");
            }
            slot.failures = 0;
            if outcome.partial_failures() > 0 {
                warn!(cycle = name, outcome = ?outcome, "Cycle finished with partial failures");
            } else {
                debug!(cycle = name, outcome = ?outcome, "Cycle finished");
            }
            telemetry.record_cycle_success(name, outcome);
            None
        }
        Ok(Err(e)) => Some(e.to_string()),
        Err(join_err) if join_err.is_panic() => Some("cycle panicked".to_string()),
        Err(join_err) => Some(join_err.to_string()),
    };

    if let Some(message) = error {
        slot.failures += 1;
        error!(
            cycle = name,
            error = %message,
            consecutive_failures = slot.failures,
            "Cycle failed, backing off"
        );
        telemetry.record_cycle_failure(name, slot.failures, message);
    }
    slot.next_due = Instant::now() + backoff_interval(slot.interval, slot.failures);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::setup_memory_pool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Script = Box<dyn Fn(usize) -> anyhow::Result<CycleOutcome> + Send + Sync>;

    /// Runs `script` with the attempt number, after an optional delay.
    struct ScriptedCycle {
        attempts: AtomicUsize,
        delay: Duration,
        script: Script,
    }

    impl ScriptedCycle {
        fn new(script: impl Fn(usize) -> anyhow::Result<CycleOutcome> + Send + Sync + 'static) -> Self {
            Self {
                attempts: AtomicUsize::new(0),
                delay: Duration::ZERO,
                script: Box::new(script),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Cycle for ScriptedCycle {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(&self) -> anyhow::Result<CycleOutcome> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            (self.script)(attempt)
        }
    }

    fn pruned() -> anyhow::Result<CycleOutcome> {
        Ok(CycleOutcome::Pruned {
            queue_rows: 0,
            statuses: 0,
        })
    }

    async fn coordinator() -> (WorkerCoordinator, Arc<MonitorTelemetry>) {
        let telemetry = Arc::new(MonitorTelemetry::new());
        let pool = setup_memory_pool().await;
        (
            WorkerCoordinator::new(pool, Duration::from_secs(1), 2, telemetry.clone()),
            telemetry,
        )
    }

    async fn tick_and_wait(coordinator: &mut WorkerCoordinator) {
        coordinator.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_interval(base, 0), base);
        assert_eq!(backoff_interval(base, 1), Duration::from_secs(10));
        assert_eq!(backoff_interval(base, 3), Duration::from_secs(40));
        assert_eq!(backoff_interval(base, 5), Duration::from_secs(160));
        assert_eq!(backoff_interval(base, 12), Duration::from_secs(160));
    }

    #[test]
    fn partial_failures_come_from_the_outcome() {
        let outcome = CycleOutcome::Reconciled {
            examined: 4,
            cancelled: 2,
            failures: 1,
        };
        assert_eq!(outcome.partial_failures(), 1);
        assert_eq!(pruned().unwrap().partial_failures(), 0);
    }

    #[tokio::test]
    async fn cycle_runs_on_first_tick_then_waits_for_its_interval() {
        let (mut coordinator, telemetry) = coordinator().await;
        let cycle = Arc::new(ScriptedCycle::new(|_| pruned()));
        coordinator.register(cycle.clone(), Duration::from_secs(3600));

        tick_and_wait(&mut coordinator).await;
        tick_and_wait(&mut coordinator).await;
        tick_and_wait(&mut coordinator).await;
        assert_eq!(cycle.attempts(), 1);

        let cycles = telemetry.cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].runs, 1);
        assert_eq!(cycles[0].last_outcome, pruned().ok());
    }

    #[tokio::test]
    async fn in_flight_run_is_not_started_again() {
        let (mut coordinator, _telemetry) = coordinator().await;
        let cycle = Arc::new(ScriptedCycle::new(|_| pruned()).slow(Duration::from_millis(300)));
        coordinator.register(cycle.clone(), Duration::ZERO);

        tick_and_wait(&mut coordinator).await;
        tick_and_wait(&mut coordinator).await;
        assert_eq!(cycle.attempts(), 1);
    }

    #[tokio::test]
    async fn failures_and_panics_are_recorded_until_recovery() {
        let (mut coordinator, telemetry) = coordinator().await;
        let cycle = Arc::new(ScriptedCycle::new(|attempt| match attempt {
            0 => anyhow::bail!("store locked"),
            1 => panic!("cycle exploded"),
            _ => pruned(),
        }));
        // Zero interval keeps the backoff at zero, so every tick retries.
        coordinator.register(cycle.clone(), Duration::ZERO);

        tick_and_wait(&mut coordinator).await;
        tick_and_wait(&mut coordinator).await;
        let snapshot = telemetry.cycles().remove(0);
        assert_eq!(snapshot.consecutive_failures, 1);
        assert_eq!(snapshot.last_error.as_deref(), Some("store locked"));

        tick_and_wait(&mut coordinator).await;
        let snapshot = telemetry.cycles().remove(0);
        assert_eq!(snapshot.consecutive_failures, 2);
        assert_eq!(snapshot.last_error.as_deref(), Some("cycle panicked"));
        assert!(telemetry.failing_cycles().contains(&"scripted".to_string()));

        tick_and_wait(&mut coordinator).await;
        let snapshot = telemetry.cycles().remove(0);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.last_error.is_none());
        assert!(telemetry.failing_cycles().is_empty());
        assert_eq!(cycle.attempts(), 4);
    }

    #[tokio::test]
    async fn consolidator_cycle_reports_its_work() {
        let h = crate::testing::setup_harness().await;
        h.reporter
            .report("inv-1", crate::status::InvocationStatus::InProgress)
            .await
            .unwrap();

        let outcome = h.consolidator.run().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Consolidated {
                groups: 1,
                rows_consumed: 1,
                failed_groups: 0
            }
        );
        assert_eq!(h.consolidator.name(), "consolidate");
        assert_eq!(h.reconciler.name(), "reconcile");
    }
}
