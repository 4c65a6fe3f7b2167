use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::worker::CycleOutcome;

/// Point-in-time copy of the monitor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub statuses_reported: u64,
    pub stale_reports_rejected: u64,
    pub consolidation_runs: u64,
    pub rows_claimed: u64,
    pub groups_consolidated: u64,
    pub rows_consumed: u64,
    pub group_failures: u64,
    pub reconcile_cycles: u64,
    pub tasks_examined: u64,
    pub tasks_cancelled: u64,
    pub reconcile_failures: u64,
    pub tasks_scheduled: u64,
    pub tasks_unscheduled: u64,
    pub tasks_fired: u64,
    pub fire_failures: u64,
}

/// Latest state of one periodic cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSnapshot {
    pub name: String,
    pub interval_secs: u64,
    pub runs: u64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<CycleOutcome>,
    pub last_error: Option<String>,
}

/// Counter sink shared by every component.
///
/// Components record what happened; the health server reads snapshots. No
/// component branches on these values.
#[derive(Debug, Default)]
pub struct MonitorTelemetry {
    statuses_reported: AtomicU64,
    stale_reports_rejected: AtomicU64,
    consolidation_runs: AtomicU64,
    rows_claimed: AtomicU64,
    groups_consolidated: AtomicU64,
    rows_consumed: AtomicU64,
    group_failures: AtomicU64,
    reconcile_cycles: AtomicU64,
    tasks_examined: AtomicU64,
    tasks_cancelled: AtomicU64,
    reconcile_failures: AtomicU64,
    tasks_scheduled: AtomicU64,
    tasks_unscheduled: AtomicU64,
    tasks_fired: AtomicU64,
    fire_failures: AtomicU64,
    cycles: Mutex<BTreeMap<String, CycleSnapshot>>,
}

impl MonitorTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_reported(&self) {
        self.statuses_reported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_stale_rejected(&self) {
        self.stale_reports_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_consolidation_run(&self, rows_claimed: u64) {
        self.consolidation_runs.fetch_add(1, Ordering::Relaxed);
        self.rows_claimed.fetch_add(rows_claimed, Ordering::Relaxed);
    }

    pub fn mark_group_consolidated(&self, rows: u64) {
        self.groups_consolidated.fetch_add(1, Ordering::Relaxed);
        self.rows_consumed.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn mark_group_failed(&self) {
        self.group_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_reconcile_cycle(&self, examined: u64) {
        self.reconcile_cycles.fetch_add(1, Ordering::Relaxed);
        self.tasks_examined.fetch_add(examined, Ordering::Relaxed);
    }

    pub fn mark_task_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_reconcile_failure(&self) {
        self.reconcile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_unscheduled(&self) {
        self.tasks_unscheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_fired(&self) {
        self.tasks_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_fire_failed(&self) {
        self.fire_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn register_cycle(&self, name: &str, interval: Duration) {
        let mut cycles = self.cycles.lock().unwrap_or_else(|e| e.into_inner());
        cycles.entry(name.to_string()).or_insert_with(|| CycleSnapshot {
            name: name.to_string(),
            interval_secs: interval.as_secs(),
            runs: 0,
            consecutive_failures: 0,
            last_success_at: None,
            last_outcome: None,
            last_error: None,
        });
    }

    pub fn record_cycle_success(&self, name: &str, outcome: CycleOutcome) {
        let mut cycles = self.cycles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cycle) = cycles.get_mut(name) {
            cycle.runs += 1;
            cycle.consecutive_failures = 0;
            cycle.last_success_at = Some(Utc::now());
            cycle.last_outcome = Some(outcome);
            cycle.last_error = None;
        }
    }

    pub fn record_cycle_failure(&self, name: &str, consecutive_failures: u32, error: String) {
        let mut cycles = self.cycles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cycle) = cycles.get_mut(name) {
            cycle.runs += 1;
            cycle.consecutive_failures = consecutive_failures;
            cycle.last_error = Some(error);
        }
    }

    /// Every registered cycle, ordered by name.
    pub fn cycles(&self) -> Vec<CycleSnapshot> {
        let cycles = self.cycles.lock().unwrap_or_else(|e| e.into_inner());
        cycles.values().cloned().collect()
    }

    /// Names of cycles whose latest run failed.
    pub fn failing_cycles(&self) -> Vec<String> {
        let cycles = self.cycles.lock().unwrap_or_else(|e| e.into_inner());
        cycles
            .values()
            .filter(|c| c.consecutive_failures > 0)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            statuses_reported: self.statuses_reported.load(Ordering::Relaxed),
            stale_reports_rejected: self.stale_reports_rejected.load(Ordering::Relaxed),
            consolidation_runs: self.consolidation_runs.load(Ordering::Relaxed),
            rows_claimed: self.rows_claimed.load(Ordering::Relaxed),
            groups_consolidated: self.groups_consolidated.load(Ordering::Relaxed),
            rows_consumed: self.rows_consumed.load(Ordering::Relaxed),
            group_failures: self.group_failures.load(Ordering::Relaxed),
            reconcile_cycles: self.reconcile_cycles.load(Ordering::Relaxed),
            tasks_examined: self.tasks_examined.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            reconcile_failures: self.reconcile_failures.load(Ordering::Relaxed),
            tasks_scheduled: self.tasks_scheduled.load(Ordering::Relaxed),
            tasks_unscheduled: self.tasks_unscheduled.load(Ordering::Relaxed),
            tasks_fired: self.tasks_fired.load(Ordering::Relaxed),
            fire_failures: self.fire_failures.load(Ordering::Relaxed),
        }
    }
}
