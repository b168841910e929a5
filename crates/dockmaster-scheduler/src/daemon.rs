//! Daemon lifecycle: the detached background process and the controls the
//! CLI uses to start, stop and observe it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use dockmaster_core::{config::SchedulerConfig, ContainerRuntime};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    engine::SchedulerEngine,
    error::{Result, SchedulerError},
    lock::{self, Liveness, ProcessLock},
    paths::SchedulerPaths,
    status::StatusStore,
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const KILL_RELEASE_POLLS: u32 = 25;

/// Program and arguments that launch the daemon in the foreground.
#[derive(Debug, Clone)]
pub struct DaemonCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl DaemonCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-invoke the running executable with `args`.
    pub fn current_exe(args: impl IntoIterator<Item = impl Into<OsString>>) -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| {
            SchedulerError::ProcessControl(format!("cannot locate own executable: {e}"))
        })?;
        Ok(Self::new(program, args))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: i32 },
    AlreadyRunning { pid: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: i32 },
    /// Did not exit within the grace period and was SIGKILLed.
    Killed { pid: i32 },
}

/// Controls the scheduler daemon of one project.
#[derive(Debug, Clone)]
pub struct DaemonSupervisor {
    project_dir: PathBuf,
    paths: SchedulerPaths,
    config: SchedulerConfig,
    command: Option<DaemonCommand>,
}

impl DaemonSupervisor {
    pub fn new(project_dir: &Path, config: SchedulerConfig) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            paths: SchedulerPaths::for_project(project_dir),
            config,
            command: None,
        }
    }

    /// Set how [`DaemonSupervisor::start`] launches the background process.
    pub fn with_command(mut self, command: DaemonCommand) -> Self {
        self.command = Some(command);
        self
    }

    pub fn paths(&self) -> &SchedulerPaths {
        &self.paths
    }

    pub fn status_store(&self) -> StatusStore {
        StatusStore::new(&self.paths.status_file)
    }

    /// Whether a live daemon owns this project. Clears stale PID records.
    pub fn is_running(&self) -> bool {
        lock::probe(&self.paths.pid_file).is_running()
    }

    pub fn liveness(&self) -> Liveness {
        lock::probe(&self.paths.pid_file)
    }

    /// Launch the daemon detached from this process and wait until it holds
    /// the lock. A no-op when one is already running.
    pub async fn start(&self) -> Result<StartOutcome> {
        if let Liveness::Running(pid) = self.liveness() {
            info!(?pid, "scheduler already running");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }
        let command = self.command.as_ref().ok_or_else(|| {
            SchedulerError::ProcessControl("no daemon command configured".to_string())
        })?;
        self.paths.ensure()?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Safety: setsid is async-signal-safe and touches no parent state.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        let mut child = cmd.spawn().map_err(|e| {
            SchedulerError::ProcessControl(format!(
                "failed to launch {}: {e}",
                command.program.display()
            ))
        })?;
        let child_pid = child.id() as i32;
        // Reap the child if it exits while we are still alive.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.start_timeout_secs.max(1));
        while tokio::time::Instant::now() < deadline {
            if let Liveness::Running(pid) = self.liveness() {
                let pid = pid.unwrap_or(child_pid);
                info!(pid, "scheduler started");
                return Ok(StartOutcome::Started { pid });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(SchedulerError::ProcessControl(format!(
            "daemon (pid {child_pid}) did not come up within {}s",
            self.config.start_timeout_secs
        )))
    }

    /// Stop the daemon: SIGTERM, a grace period, then SIGKILL. Idempotent.
    ///
    /// The PID record is removed once its lock is free. A record whose lock
    /// is still held is left alone so no second daemon can start beside the
    /// holder.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let outcome = self.stop_inner().await?;
        // A SIGKILLed process drops its lock only once the kernel reaps its
        // descriptors.
        let attempts = match outcome {
            StopOutcome::Killed { .. } => KILL_RELEASE_POLLS,
            _ => 1,
        };
        for attempt in 1..=attempts {
            if lock::reclaim_if_free(&self.paths.pid_file) {
                return Ok(outcome);
            }
            if attempt < attempts {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
        warn!(path = %self.paths.pid_file.display(), "pid file still locked, leaving it in place");
        Ok(outcome)
    }

    async fn stop_inner(&self) -> Result<StopOutcome> {
        let pid = match self.liveness() {
            Liveness::NotRunning | Liveness::Stale(_) => {
                info!("scheduler not running");
                return Ok(StopOutcome::NotRunning);
            }
            Liveness::Running(Some(pid)) => pid,
            Liveness::Running(None) => {
                return Err(SchedulerError::ProcessControl(
                    "daemon holds the lock but its pid is unknown".to_string(),
                ))
            }
        };

        lock::send_signal(pid, libc::SIGTERM)?;
        info!(pid, "sent SIGTERM to scheduler");

        for _ in 0..self.config.stop_timeout_secs.max(1) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if !self.is_running() {
                info!(pid, "scheduler stopped");
                return Ok(StopOutcome::Stopped { pid });
            }
        }

        warn!(pid, "scheduler ignored SIGTERM, sending SIGKILL");
        lock::send_signal(pid, libc::SIGKILL)?;
        // A killed daemon cannot record its own exit.
        if let Err(e) = self.status_store().mark_stopped(Local::now().naive_local()) {
            warn!("failed to record stopped status: {e}");
        }
        Ok(StopOutcome::Killed { pid })
    }

    pub async fn restart(&self) -> Result<StartOutcome> {
        self.stop().await?;
        self.start().await
    }

    /// Daemon body: take the lock, run the loop until SIGTERM or SIGINT.
    pub async fn run_daemon(&self, runtime: Arc<dyn ContainerRuntime>) -> Result<()> {
        let (tx, rx) = watch::channel(false);
        spawn_signal_listener(tx)?;
        self.run_until(runtime, rx).await
    }

    /// Daemon body with an explicit shutdown channel.
    ///
    /// Returns `Ok(())` without doing anything when another daemon already
    /// owns the project.
    pub async fn run_until(
        &self,
        runtime: Arc<dyn ContainerRuntime>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.paths.ensure()?;
        let lock = match ProcessLock::acquire(&self.paths.pid_file) {
            Ok(lock) => lock,
            Err(SchedulerError::AlreadyRunning { pid }) => {
                warn!(pid, "scheduler already running, exiting");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let status = self.status_store();
        if let Err(e) = status.mark_running(Local::now().naive_local()) {
            error!("failed to record running status: {e}");
        }
        // Declared after `lock` so it drops first: status is written before
        // the PID record disappears, on every exit path including panics.
        let _stopped = StoppedGuard { status };

        info!(pid = lock.pid(), project = %self.project_dir.display(), "scheduler daemon running");
        let mut engine = SchedulerEngine::new(&self.project_dir, &self.config, runtime);
        if let Err(e) = engine.sync(Local::now().naive_local()) {
            error!("failed to load scheduled jobs: {e}");
        }
        engine.run(shutdown).await;
        info!("scheduler daemon exiting");
        Ok(())
    }
}

struct StoppedGuard {
    status: StatusStore,
}

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        if let Err(e) = self.status.mark_stopped(Local::now().naive_local()) {
            error!("failed to record stopped status: {e}");
        }
    }
}

#[cfg(unix)]
fn spawn_signal_listener(tx: watch::Sender<bool>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = int.recv() => info!("received SIGINT"),
        }
        let _ = tx.send(true);
    });
    Ok(())
}
