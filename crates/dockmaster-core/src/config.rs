use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Scheduler defaults — the daemon ticks once per second
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_HISTORY_LIMIT: usize = 30;
pub const DEFAULT_LATEST_LOG_RETENTION: usize = 7;
pub const DEFAULT_HISTORY_LOG_RETENTION_DAYS: i64 = 30;
pub const DEFAULT_DAEMON_LOG_RETENTION: usize = 30;

// Container runtime defaults
pub const DEFAULT_DOCKER_BINARY: &str = "docker";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;

/// Top-level tool settings (dockmaster.toml + DOCKMASTER_* env overrides).
///
/// These are per-user settings for the tool itself. Per-project state
/// (jobs, registry, container name) lives in the project document instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockmasterConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub docker: DockerConfig,
}

/// Daemon timing and retention knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between execution loop ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// How long `stop` waits for a graceful exit before escalating to SIGKILL.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    /// How long `start` waits for the detached daemon to take its lock.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    /// Run-history entries kept per job.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Rotated "latest" task log files kept per task.
    #[serde(default = "default_latest_log_retention")]
    pub latest_log_retention: usize,
    /// Per-run task log files older than this are pruned.
    #[serde(default = "default_history_log_retention_days")]
    pub history_log_retention_days: i64,
    /// Rotated daemon log files kept.
    #[serde(default = "default_daemon_log_retention")]
    pub daemon_log_retention: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            start_timeout_secs: DEFAULT_START_TIMEOUT_SECS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            latest_log_retention: DEFAULT_LATEST_LOG_RETENTION,
            history_log_retention_days: DEFAULT_HISTORY_LOG_RETENTION_DAYS,
            daemon_log_retention: DEFAULT_DAEMON_LOG_RETENTION,
        }
    }
}

/// How the `docker` CLI is invoked by job bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_docker_binary")]
    pub binary: String,
    /// Hard cap for a single docker invocation (commit/push can be slow).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Wait-for-status budget when a container must reach a given state.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_DOCKER_BINARY.to_string(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
        }
    }
}

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}
fn default_start_timeout() -> u64 {
    DEFAULT_START_TIMEOUT_SECS
}
fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}
fn default_latest_log_retention() -> usize {
    DEFAULT_LATEST_LOG_RETENTION
}
fn default_history_log_retention_days() -> i64 {
    DEFAULT_HISTORY_LOG_RETENTION_DAYS
}
fn default_daemon_log_retention() -> usize {
    DEFAULT_DAEMON_LOG_RETENTION
}
fn default_docker_binary() -> String {
    DEFAULT_DOCKER_BINARY.to_string()
}
fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}
fn default_startup_timeout() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_SECS
}

impl DockmasterConfig {
    /// Load settings from a TOML file with DOCKMASTER_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.dockmaster/dockmaster.toml
    ///
    /// A missing file is not an error; defaults fill every absent key.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: DockmasterConfig = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("DOCKMASTER_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.dockmaster/dockmaster.toml", home)
}
