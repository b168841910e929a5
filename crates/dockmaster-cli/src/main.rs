use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use dockmaster_core::DockmasterConfig;
use dockmaster_docker::DockerCli;
use dockmaster_scheduler::{paths::SchedulerPaths, DaemonSupervisor, TaskType};
use tracing::{error, warn};

mod commands;
mod format;
mod logging;

/// Manage recurring maintenance jobs for a containerised project.
#[derive(Parser, Debug)]
#[command(name = "dockmaster", version, about)]
struct Cli {
    /// Project directory (holds config.json and logs/)
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Tool settings file [default: $DOCKMASTER_CONFIG or ~/.dockmaster/dockmaster.toml]
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scheduled backup and cleanup jobs
    #[command(subcommand)]
    Schedule(ScheduleCommand),

    /// Run the scheduler daemon in the foreground (spawned by `schedule start`)
    #[command(hide = true)]
    Daemon,
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    /// Create or replace the backup job
    Backup(BackupArgs),
    /// Create or replace the cleanup job
    Cleanup(CleanupArgs),
    /// List scheduled jobs
    List,
    /// Remove the job of a task type
    Remove { task: TaskType },
    /// Start the scheduler daemon
    Start,
    /// Stop the scheduler daemon
    Stop,
    /// Restart the scheduler daemon
    Restart,
    /// Show daemon and job status
    Status,
    /// Show a task log, or the daemon log when no task is given
    Logs {
        task: Option<TaskType>,
        /// Number of lines to show
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
        /// Keep printing new lines as they are written
        #[arg(short, long)]
        follow: bool,
    },
    /// Ask the running daemon to execute a job now
    Run { task: TaskType },
}

/// When a job fires. Without a flag the job runs daily at TIME.
#[derive(Args, Debug, Clone)]
struct WhenArgs {
    /// Time of day, HH:MM
    time: Option<String>,

    /// Run weekly on this day (monday..sunday)
    #[arg(long, value_name = "WEEKDAY", conflicts_with_all = ["monthly", "hourly", "spec"])]
    weekly: Option<String>,

    /// Run monthly on this day of the month (1-31)
    #[arg(long, value_name = "DAY", conflicts_with_all = ["hourly", "spec"])]
    monthly: Option<u32>,

    /// Run hourly at this minute (0-59)
    #[arg(long, value_name = "MINUTE", conflicts_with_all = ["time", "spec"])]
    hourly: Option<u32>,

    /// Full recurrence as JSON, e.g. '{"type":"weekly","weekday":"friday","time":"22:00"}'
    #[arg(long, value_name = "JSON", conflicts_with = "time")]
    spec: Option<String>,
}

#[derive(Args, Debug)]
struct BackupArgs {
    #[command(flatten)]
    when: WhenArgs,
    /// Image name, `repo` or `repo:tag` [default: <container>:<timestamp>]
    #[arg(long)]
    image_name: Option<String>,
    /// Clean temporary paths inside the container before committing
    #[arg(long)]
    cleanup: bool,
    /// Push the image to the configured registry
    #[arg(long)]
    auto_push: bool,
    #[command(flatten)]
    after: AfterArgs,
}

#[derive(Args, Debug)]
struct CleanupArgs {
    #[command(flatten)]
    when: WhenArgs,
    /// Path glob to remove inside the container (repeatable) [default: /tmp/* /var/cache/*]
    #[arg(long = "path", value_name = "GLOB")]
    paths: Vec<String>,
    #[command(flatten)]
    after: AfterArgs,
}

#[derive(Args, Debug)]
struct AfterArgs {
    /// Execute the job once right away (starts the daemon if needed)
    #[arg(long, conflicts_with = "no_start")]
    run_now: bool,
    /// Do not start the daemon after scheduling
    #[arg(long)]
    no_start: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let project_dir = std::path::absolute(&cli.project_dir)
        .with_context(|| format!("invalid project dir {}", cli.project_dir.display()))?;

    // explicit flag > DOCKMASTER_CONFIG > ~/.dockmaster/dockmaster.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("DOCKMASTER_CONFIG").ok());
    let load = DockmasterConfig::load(config_path.as_deref());

    match cli.command {
        Command::Daemon => {
            let paths = SchedulerPaths::for_project(&project_dir);
            let config = load.unwrap_or_default();
            let _guard = logging::init_daemon(&paths, &config.scheduler)?;
            let runtime = Arc::new(DockerCli::new(&config.docker));
            let supervisor = DaemonSupervisor::new(&project_dir, config.scheduler);
            if let Err(e) = supervisor.run_daemon(runtime).await {
                error!("scheduler daemon failed: {e}");
                return Err(e.into());
            }
            Ok(())
        }
        Command::Schedule(cmd) => {
            logging::init_cli()?;
            let config = load.unwrap_or_else(|e| {
                warn!(code = e.code(), "Config load failed ({}), using defaults", e);
                DockmasterConfig::default()
            });
            let mut daemon_args = vec![
                "--project-dir".into(),
                project_dir.clone().into_os_string(),
            ];
            if let Some(path) = &config_path {
                daemon_args.push("--config".into());
                daemon_args.push(path.into());
            }
            daemon_args.push("daemon".into());

            let ctx = commands::Context::new(&project_dir, config, daemon_args)?;
            commands::run(cmd, &ctx).await
        }
    }
}
