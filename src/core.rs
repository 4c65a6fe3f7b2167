use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::daemon;
use crate::db;
use crate::fire_handlers;
use crate::monitor::TaskMonitor;
use crate::reconciler::Reconciler;
use crate::scheduler::SqliteTaskScheduler;
use crate::status::{
    Consolidator, InvocationStatus, Pruner, ReportOutcome, StatusChange, StatusEventStore,
    StatusReporter,
};
use crate::telemetry::MonitorTelemetry;
use crate::traits::TaskScheduler;
use crate::worker::WorkerCoordinator;

/// Capacity of the consolidated status change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;
/// How often the pruner runs.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Every long-lived component, wired to one pool.
pub struct Components {
    pub pool: SqlitePool,
    pub reporter: Arc<StatusReporter>,
    pub scheduler: Arc<SqliteTaskScheduler>,
    pub consolidator: Arc<Consolidator>,
    pub reconciler: Arc<Reconciler>,
    pub pruner: Arc<Pruner>,
    pub monitor: Arc<TaskMonitor>,
    pub telemetry: Arc<MonitorTelemetry>,
}

pub async fn build(config: &AppConfig) -> anyhow::Result<Components> {
    // 1. State
    let pool = db::connect(&config.state).await?;
    info!("State store initialized ({})", config.state.db_path);

    let telemetry = Arc::new(MonitorTelemetry::new());
    let store = Arc::new(StatusEventStore::new(pool.clone()).await?);
    let reporter = Arc::new(StatusReporter::new(store.clone(), telemetry.clone()));
    let scheduler = Arc::new(SqliteTaskScheduler::new(pool.clone(), telemetry.clone()).await?);

    // 2. Consolidation
    let (changes, _) = broadcast::channel::<StatusChange>(CHANGE_CHANNEL_CAPACITY);
    let worker_id = config.consolidation.resolve_worker_id();
    let consolidator = Arc::new(Consolidator::new(
        store.clone(),
        worker_id,
        &config.consolidation,
        changes,
        telemetry.clone(),
    ));
    let pruner = Arc::new(Pruner::new(store.clone(), &config.consolidation));

    // 3. Reconciliation and the caller facade
    let reconciler = Arc::new(Reconciler::new(
        scheduler.clone(),
        store.clone(),
        telemetry.clone(),
    ));
    let monitor = Arc::new(TaskMonitor::new(
        scheduler.clone(),
        reporter.clone(),
        store.clone(),
        telemetry.clone(),
    ));

    Ok(Components {
        pool,
        reporter,
        scheduler,
        consolidator,
        reconciler,
        pruner,
        monitor,
        telemetry,
    })
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let components = build(&config).await?;
    info!(
        worker_id = components.consolidator.worker_id(),
        retain_processed = config.consolidation.retain_processed,
        "Consolidator configured"
    );

    // 4. Push-mode reconciliation
    if config.reconciliation.react_to_status_changes {
        components
            .reconciler
            .clone()
            .spawn_listener(components.consolidator.subscribe());
    }

    // 5. Periodic cycles
    let mut coordinator = WorkerCoordinator::new(
        components.pool.clone(),
        Duration::from_secs(1),
        config.daemon.max_concurrent_jobs,
        components.telemetry.clone(),
    );
    coordinator.register(
        components.consolidator.clone(),
        Duration::from_secs(config.consolidation.interval_secs),
    );
    coordinator.register(
        components.reconciler.clone(),
        Duration::from_secs(config.reconciliation.interval_secs),
    );
    if components.pruner.is_enabled() {
        coordinator.register(components.pruner.clone(), PRUNE_INTERVAL);
    }

    info!(cycles = coordinator.cycle_count(), "Registered periodic cycles");
    let coordinator_handle = coordinator.start();

    // 6. Deferred task scheduler
    let scheduler_handle = if config.scheduler.enabled {
        let handler = fire_handlers::build(config.scheduler.on_fire, components.reporter.clone());
        info!(handler = handler.name(), "Fire handler configured");
        Some(components.scheduler.clone().spawn(
            handler,
            Duration::from_secs(config.scheduler.tick_interval_secs),
        ))
    } else {
        info!("Deferred task scheduler disabled");
        None
    };

    // 7. Health server
    let telemetry = components.telemetry.clone();
    let bind = config.daemon.health_bind.clone();
    let port = config.daemon.health_port;
    tokio::spawn(async move {
        if let Err(e) = daemon::start_health_server(&bind, port, telemetry).await {
            error!("Health server error: {}", e);
        }
    });

    info!("Starting invocation-monitor v{}", env!("CARGO_PKG_VERSION"));
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    coordinator_handle.abort();
    if let Some(handle) = scheduler_handle {
        handle.abort();
    }
    components.pool.close().await;
    Ok(())
}

/// One-shot operations exposed on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Report {
        invocation_id: String,
        status: InvocationStatus,
    },
    Schedule {
        task_id: String,
        invocation_id: String,
        delay_secs: u64,
    },
    Unschedule {
        task_id: String,
        invocation_id: String,
    },
    Status {
        invocation_id: String,
    },
    Tasks,
    Consolidate,
    Reconcile,
}

impl Command {
    /// Parse the arguments that follow the program name.
    pub fn parse(args: &[String]) -> anyhow::Result<Self> {
        let name = args.first().map(String::as_str).unwrap_or_default();
        let arg = |i: usize, what: &str| -> anyhow::Result<String> {
            args.get(i)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Usage: invocation-monitor {} is missing <{}>", name, what))
        };

        let command = match name {
            "report" => {
                let invocation_id = arg(1, "invocation")?;
                let raw = arg(2, "status")?;
                let status = InvocationStatus::from_str(&raw)
                    .ok_or_else(|| anyhow::anyhow!("Unknown status '{}'", raw))?;
                Command::Report {
                    invocation_id,
                    status,
                }
            }
            "schedule" => {
                let task_id = arg(1, "task")?;
                let invocation_id = arg(2, "invocation")?;
                let raw = arg(3, "delay-secs")?;
                let delay_secs = raw
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid delay '{}', expected whole seconds", raw))?;
                Command::Schedule {
                    task_id,
                    invocation_id,
                    delay_secs,
                }
            }
            "unschedule" => Command::Unschedule {
                task_id: arg(1, "task")?,
                invocation_id: arg(2, "invocation")?,
            },
            "status" => Command::Status {
                invocation_id: arg(1, "invocation")?,
            },
            "tasks" => Command::Tasks,
            "consolidate" => Command::Consolidate,
            "reconcile" => Command::Reconcile,
            other => anyhow::bail!("Unknown command '{}'. Run with --help for usage.", other),
        };
        Ok(command)
    }
}

/// Execute a one-shot command and return the text to print.
pub async fn execute(config: &AppConfig, command: Command) -> anyhow::Result<String> {
    let components = build(config).await?;
    let output = match command {
        Command::Report {
            invocation_id,
            status,
        } => match components.monitor.report_status(&invocation_id, status).await? {
            ReportOutcome::Appended { event_id } => {
                format!("reported {} {} ({})", invocation_id, status, event_id)
            }
            ReportOutcome::Rejected { current } => {
                format!("rejected: {} is already {}", invocation_id, current)
            }
        },
        Command::Schedule {
            task_id,
            invocation_id,
            delay_secs,
        } => {
            components
                .monitor
                .schedule_task(&task_id, &invocation_id, delay_secs)
                .await?;
            format!("scheduled {} for {} in {}s", task_id, invocation_id, delay_secs)
        }
        Command::Unschedule {
            task_id,
            invocation_id,
        } => {
            if components
                .monitor
                .unschedule_task(&task_id, &invocation_id)
                .await?
            {
                format!("unscheduled {}", task_id)
            } else {
                format!("no live task {}", task_id)
            }
        }
        Command::Status { invocation_id } => components
            .monitor
            .effective_status(&invocation_id)
            .await?
            .map(|s| s.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        Command::Tasks => components
            .scheduler
            .list_active_tasks()
            .await?
            .iter()
            .map(|t| format!("{}\t{}\t{}", t.task_id, t.invocation_id, t.fire_at.to_rfc3339()))
            .collect::<Vec<_>>()
            .join("\n"),
        Command::Consolidate => {
            let report = components.consolidator.run_cycle().await?;
            format!(
                "consolidated {} groups ({} rows, {} failed)",
                report.groups, report.rows_consumed, report.failed_groups
            )
        }
        Command::Reconcile => {
            let report = components.reconciler.run_cycle().await?;
            format!(
                "examined {} tasks, cancelled {}, failures {}",
                report.examined, report.cancelled, report.failures
            )
        }
    };
    components.pool.close().await;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateConfig;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn config_in(dir: &tempfile::TempDir) -> AppConfig {
        AppConfig {
            state: StateConfig {
                db_path: dir.path().join("monitor.db").display().to_string(),
                ..StateConfig::default()
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            Command::parse(&args(&["report", "inv-1", "in-progress"])).unwrap(),
            Command::Report {
                invocation_id: "inv-1".to_string(),
                status: InvocationStatus::InProgress
            }
        );
        assert_eq!(
            Command::parse(&args(&["schedule", "t1", "inv-1", "30"])).unwrap(),
            Command::Schedule {
                task_id: "t1".to_string(),
                invocation_id: "inv-1".to_string(),
                delay_secs: 30
            }
        );
        assert_eq!(Command::parse(&args(&["tasks"])).unwrap(), Command::Tasks);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(Command::parse(&args(&["report", "inv-1"])).is_err());
        assert!(Command::parse(&args(&["report", "inv-1", "done"])).is_err());
        assert!(Command::parse(&args(&["schedule", "t1", "inv-1", "-5"])).is_err());
        assert!(Command::parse(&args(&["frobnicate"])).is_err());
    }

    #[tokio::test]
    async fn one_shot_commands_share_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        let out = execute(
            &config,
            Command::Schedule {
                task_id: "t1".to_string(),
                invocation_id: "inv-1".to_string(),
                delay_secs: 600,
            },
        )
        .await
        .unwrap();
        assert_eq!(out, "scheduled t1 for inv-1 in 600s");

        let report = Command::Report {
            invocation_id: "inv-1".to_string(),
            status: InvocationStatus::Successful,
        };
        assert!(execute(&config, report).await.unwrap().starts_with("reported inv-1 SUCCESSFUL"));

        let out = execute(&config, Command::Consolidate).await.unwrap();
        assert_eq!(out, "consolidated 1 groups (1 rows, 0 failed)");

        let out = execute(&config, Command::Reconcile).await.unwrap();
        assert_eq!(out, "examined 1 tasks, cancelled 1, failures 0");

        let status = Command::Status {
            invocation_id: "inv-1".to_string(),
        };
        assert_eq!(execute(&config, status).await.unwrap(), "SUCCESSFUL");
        assert_eq!(execute(&config, Command::Tasks).await.unwrap(), "");
    }
}
