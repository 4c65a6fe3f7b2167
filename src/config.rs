use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_db_path() -> String {
    "invocations.db".to_string()
}
fn default_max_connections() -> u32 {
    4
}
fn default_busy_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsolidationConfig {
    #[serde(default = "default_consolidation_interval_secs")]
    pub interval_secs: u64,
    /// Maximum invocation groups claimed per run.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a claim stays exclusive before another worker may take it.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Mark consumed rows processed instead of deleting them.
    #[serde(default)]
    pub retain_processed: bool,
    #[serde(default = "default_processed_retention_hours")]
    pub processed_retention_hours: u64,
    /// Hours a terminal consolidated status is kept after its last update.
    /// Until then late reports for the invocation are still rejected.
    /// 0 keeps statuses forever.
    #[serde(default = "default_status_retention_hours")]
    pub status_retention_hours: u64,
    /// Identity recorded on claimed rows. Generated when unset.
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_consolidation_interval_secs(),
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            retain_processed: false,
            processed_retention_hours: default_processed_retention_hours(),
            status_retention_hours: default_status_retention_hours(),
            worker_id: None,
        }
    }
}

impl ConsolidationConfig {
    /// Configured worker id, or `<host>-<pid>-<random>`.
    pub fn resolve_worker_id(&self) -> String {
        if let Some(id) = self.worker_id.as_deref().map(str::trim) {
            if !id.is_empty() {
                return id.to_string();
            }
        }
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "host".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
    }
}

fn default_consolidation_interval_secs() -> u64 {
    5
}
fn default_batch_size() -> usize {
    500
}
fn default_lease_secs() -> u64 {
    60
}
fn default_processed_retention_hours() -> u64 {
    24
}
fn default_status_retention_hours() -> u64 {
    168
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconciliationConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Cancel watchdog tasks as soon as a terminal status is consolidated.
    #[serde(default = "default_react_to_status_changes")]
    pub react_to_status_changes: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            react_to_status_changes: default_react_to_status_changes(),
        }
    }
}

fn default_reconcile_interval_secs() -> u64 {
    10
}
fn default_react_to_status_changes() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnFireAction {
    /// Fail the invocation if it has not reached a terminal status.
    #[default]
    Fail,
    /// Only log the invocation's effective status.
    Log,
    /// Run the invocation: report IN_PROGRESS, then SUCCESSFUL.
    Complete,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default)]
    pub on_fire: OnFireAction,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_interval_secs: default_tick_interval_secs(),
            on_fire: OnFireAction::default(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_tick_interval_secs() -> u64 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    #[serde(default = "default_health_bind")]
    pub health_bind: String,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
            health_bind: default_health_bind(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

fn default_health_port() -> u16 {
    8089
}

fn default_health_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_max_concurrent_jobs() -> usize {
    4
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.consolidation.interval_secs == 0 {
            anyhow::bail!("consolidation.interval_secs must be greater than 0");
        }
        if self.consolidation.batch_size == 0 {
            anyhow::bail!("consolidation.batch_size must be greater than 0");
        }
        if self.consolidation.lease_secs == 0 {
            anyhow::bail!("consolidation.lease_secs must be greater than 0");
        }
        let status_retention_secs = self.consolidation.status_retention_hours.saturating_mul(3600);
        if status_retention_secs != 0 && status_retention_secs <= self.consolidation.lease_secs {
            anyhow::bail!("consolidation.status_retention_hours must outlast consolidation.lease_secs");
        }
        if self.reconciliation.interval_secs == 0 {
            anyhow::bail!("reconciliation.interval_secs must be greater than 0");
        }
        if self.scheduler.tick_interval_secs == 0 {
            anyhow::bail!("scheduler.tick_interval_secs must be greater than 0");
        }
        if self.state.max_connections == 0 {
            anyhow::bail!("state.max_connections must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.state.db_path, "invocations.db");
        assert_eq!(config.consolidation.interval_secs, 5);
        assert_eq!(config.consolidation.batch_size, 500);
        assert!(!config.consolidation.retain_processed);
        assert_eq!(config.consolidation.status_retention_hours, 168);
        assert_eq!(config.reconciliation.interval_secs, 10);
        assert!(config.reconciliation.react_to_status_changes);
        assert_eq!(config.scheduler.on_fire, OnFireAction::Fail);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sections_override_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [state]
            db_path = "/tmp/monitor.db"

            [consolidation]
            interval_secs = 2
            lease_secs = 30
            worker_id = "worker-a"

            [scheduler]
            on_fire = "log"
            "#,
        )
        .unwrap();
        assert_eq!(config.state.db_path, "/tmp/monitor.db");
        assert_eq!(config.consolidation.interval_secs, 2);
        assert_eq!(config.consolidation.lease_secs, 30);
        assert_eq!(config.consolidation.resolve_worker_id(), "worker-a");
        assert_eq!(config.scheduler.on_fire, OnFireAction::Log);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config: AppConfig = toml::from_str("[consolidation]\ninterval_secs = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config: AppConfig = toml::from_str("[consolidation]\nbatch_size = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn status_retention_must_outlast_the_lease() {
        let config: AppConfig =
            toml::from_str("[consolidation]\nstatus_retention_hours = 1\nlease_secs = 7200\n").unwrap();
        assert!(config.validate().is_err());

        let config: AppConfig = toml::from_str("[consolidation]\nstatus_retention_hours = 0\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn complete_fire_action_parses() {
        let config: AppConfig = toml::from_str("[scheduler]\non_fire = \"complete\"\n").unwrap();
        assert_eq!(config.scheduler.on_fire, OnFireAction::Complete);
    }

    #[test]
    fn generated_worker_ids_are_unique() {
        let config = ConsolidationConfig::default();
        assert_ne!(config.resolve_worker_id(), config.resolve_worker_id());
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.daemon.health_port, 8089);
    }
}
