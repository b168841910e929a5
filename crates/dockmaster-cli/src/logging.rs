//! Logging setup for the two faces of the binary.
//!
//! Interactive commands log to stderr and keep stdout for their own output.
//! The detached daemon has no terminal, so it writes to a daily-rotated file
//! under `logs/scheduler/` through a non-blocking tracing-appender worker.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use dockmaster_core::config::SchedulerConfig;
use dockmaster_scheduler::paths::{SchedulerPaths, DAEMON_LOG_PREFIX, LOG_SUFFIX};

/// `RUST_LOG` when set, otherwise `level` for our crates and `warn` for the
/// rest.
fn build_env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = [
        "warn".to_string(),
        format!("dockmaster={level}"),
        format!("dockmaster_core={level}"),
        format!("dockmaster_scheduler={level}"),
        format!("dockmaster_docker={level}"),
    ]
    .join(",");
    EnvFilter::try_new(&directives)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", directives, e))
}

/// Console logging for interactive commands. Library chatter is kept at
/// `warn` so command output stays readable.
pub fn init_cli() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .with_filter(build_env_filter("warn")?),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging already initialised: {e}"))
}

/// File logging for the daemon. The returned guard flushes the writer on
/// drop and must live as long as the process.
pub fn init_daemon(paths: &SchedulerPaths, config: &SchedulerConfig) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&paths.root)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DAEMON_LOG_PREFIX)
        .filename_suffix(LOG_SUFFIX)
        .max_log_files(config.daemon_log_retention.max(1))
        .build(&paths.root)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_target(true)
                .with_filter(build_env_filter("info")?),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging already initialised: {e}"))?;
    Ok(guard)
}
