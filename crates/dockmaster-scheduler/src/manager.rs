//! Administration facade used by the CLI.
//!
//! Every operation works on the filesystem only; a running daemon notices
//! job changes on its next tick and run-now requests through trigger files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use dockmaster_core::{config::SchedulerConfig, document::write_atomic, RegistryCredentials};
use tracing::{info, warn};

use crate::{
    daemon::{DaemonCommand, DaemonSupervisor, StartOutcome, StopOutcome},
    error::{config_err, Result, SchedulerError},
    logs,
    schedule::Recurrence,
    status::{DaemonState, DaemonStatus, Uptime},
    store::JobStore,
    types::{BackupParams, CleanupParams, Job, JobTask, TaskType},
};

/// Characters that would let a cleanup path escape its `rm -rf` argument.
const FORBIDDEN_PATH_CHARS: &[char] = &[';', '&', '|', '$', '`', '\n', '<', '>', '(', ')'];
const GLOB_CHARS: &[char] = &['*', '?', '['];

/// Daemon state as reported by `status`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Live process check.
    pub running: bool,
    /// Last status document, `None` when it could not be read.
    pub status: Option<DaemonStatus>,
    pub uptime: Option<Uptime>,
}

/// One project's scheduling facade.
pub struct SchedulerManager {
    project_dir: PathBuf,
    store: JobStore,
    supervisor: DaemonSupervisor,
}

impl SchedulerManager {
    pub fn new(project_dir: &Path, config: SchedulerConfig) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            store: JobStore::for_project(project_dir),
            supervisor: DaemonSupervisor::new(project_dir, config),
        }
    }

    /// How `start` launches the daemon process.
    pub fn with_daemon_command(mut self, command: DaemonCommand) -> Self {
        self.supervisor = self.supervisor.with_command(command);
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn supervisor(&self) -> &DaemonSupervisor {
        &self.supervisor
    }

    /// Create or replace the project's backup job.
    ///
    /// With `auto_push` set and registry settings incomplete the job is still
    /// created; each run will fail until the settings are provided.
    pub fn schedule_backup(
        &self,
        recurrence: Recurrence,
        image_name: Option<String>,
        cleanup: bool,
        auto_push: bool,
    ) -> Result<Job> {
        if auto_push {
            let doc = self.store.document().read()?;
            let credentials = RegistryCredentials::from_document(&doc);
            if !credentials.is_complete() {
                warn!(
                    missing = %credentials.missing().join(", "),
                    password_env = %credentials.password_env,
                    "auto-push enabled but registry settings are incomplete"
                );
            }
        }
        let task = JobTask::Backup(BackupParams {
            cleanup,
            auto_push,
            image_name: image_name.filter(|s| !s.trim().is_empty()),
        });
        self.schedule(task, recurrence)
    }

    /// Create or replace the project's cleanup job. No paths means the
    /// default set.
    pub fn schedule_cleanup(&self, recurrence: Recurrence, paths: Vec<String>) -> Result<Job> {
        let params = if paths.is_empty() {
            CleanupParams::default()
        } else {
            for path in &paths {
                validate_cleanup_path(path)?;
            }
            CleanupParams { paths }
        };
        self.schedule(JobTask::Cleanup(params), recurrence)
    }

    fn schedule(&self, task: JobTask, recurrence: Recurrence) -> Result<Job> {
        let container = self.store.document().container_name()?;
        self.store
            .create_or_replace(task, recurrence, &container, now())
    }

    pub fn list_jobs(&self) -> Result<BTreeMap<TaskType, Job>> {
        self.store.list()
    }

    pub fn get_job(&self, task_type: TaskType) -> Result<Option<Job>> {
        self.store.get(task_type)
    }

    /// Remove the job of `task_type`; `false` when none existed.
    pub fn remove_job(&self, task_type: TaskType) -> Result<bool> {
        self.store.remove(task_type)
    }

    pub async fn start(&self) -> Result<StartOutcome> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) -> Result<StopOutcome> {
        self.supervisor.stop().await
    }

    pub async fn restart(&self) -> Result<StartOutcome> {
        self.supervisor.restart().await
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Status document plus a live process check. A document claiming
    /// `running` for a dead daemon is reported with `running: false`.
    pub fn get_status(&self) -> StatusReport {
        let running = self.supervisor.is_running();
        let status = self.supervisor.status_store().load_or_unknown();
        let uptime = match &status {
            Some(s) if running && s.status == DaemonState::Running => s.uptime(now()),
            _ => None,
        };
        StatusReport {
            running,
            status,
            uptime,
        }
    }

    /// Tail of a task log, or of the daemon log when `task_type` is `None`.
    pub fn get_logs(&self, task_type: Option<TaskType>, lines: usize) -> Result<Option<String>> {
        Ok(logs::tail(self.supervisor.paths(), task_type, lines)?)
    }

    /// Ask the running daemon to execute `job_id` on its next tick.
    pub fn run_now(&self, task_type: TaskType, job_id: &str) -> Result<()> {
        if !self.supervisor.is_running() {
            return Err(SchedulerError::ProcessControl(
                "scheduler is not running".to_string(),
            ));
        }
        match self.store.get(task_type)? {
            Some(job) if job.id == job_id => {}
            _ => {
                return Err(SchedulerError::JobNotFound {
                    id: job_id.to_string(),
                })
            }
        }
        let trigger = self.supervisor.paths().trigger_file(task_type);
        write_atomic(&trigger, job_id.as_bytes())?;
        info!(task = %task_type, job_id, "run-now requested");
        Ok(())
    }
}

fn validate_cleanup_path(path: &str) -> Result<()> {
    let trimmed = path.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Err(config_err(format!("cleanup path must be absolute: {path}")));
    };
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    let segments: Vec<&str> = rest.split('/').collect();
    // `/`, `/*`, `/?*` and friends all reach the root.
    if rest.is_empty() || (segments.len() == 1 && segments[0].contains(GLOB_CHARS)) {
        return Err(config_err(format!("refusing to clean the root filesystem: {path}")));
    }
    if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
        return Err(config_err(format!("cleanup path must be normalised: {path}")));
    }
    if trimmed.contains(FORBIDDEN_PATH_CHARS) || trimmed.contains(char::is_whitespace) {
        return Err(config_err(format!("cleanup path contains shell metacharacters: {path}")));
    }
    Ok(())
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
