use std::path::{Path, PathBuf};

use crate::types::TaskType;

/// Prefix of the rotated daemon log (`scheduler.<date>.log`).
pub const DAEMON_LOG_PREFIX: &str = "scheduler";
/// Prefix of the rotated per-task log (`latest.<date>.log`).
pub const LATEST_LOG_PREFIX: &str = "latest";
pub const LOG_SUFFIX: &str = "log";

/// Filesystem layout shared by the daemon and the CLI.
///
/// ```text
/// <project>/logs/scheduler/
///   scheduler.pid            PID + advisory lock
///   scheduler.status         DaemonStatus JSON
///   scheduler.<date>.log     daemon log (rotated)
///   tasks/<task>/latest.<date>.log
///   tasks/<task>/<YYYYmmdd_HHMMSS>.log
///   triggers/<task>          pending run-now requests
/// ```
#[derive(Debug, Clone)]
pub struct SchedulerPaths {
    pub root: PathBuf,
    pub pid_file: PathBuf,
    pub status_file: PathBuf,
    pub tasks_dir: PathBuf,
    pub triggers_dir: PathBuf,
}

impl SchedulerPaths {
    pub fn for_project(project_dir: &Path) -> Self {
        let root = project_dir.join("logs").join("scheduler");
        Self {
            pid_file: root.join("scheduler.pid"),
            status_file: root.join("scheduler.status"),
            tasks_dir: root.join("tasks"),
            triggers_dir: root.join("triggers"),
            root,
        }
    }

    pub fn task_dir(&self, task_type: TaskType) -> PathBuf {
        self.tasks_dir.join(task_type.as_str())
    }

    pub fn trigger_file(&self, task_type: TaskType) -> PathBuf {
        self.triggers_dir.join(task_type.as_str())
    }

    /// Create every directory of the layout.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.triggers_dir)?;
        for task_type in TaskType::ALL {
            std::fs::create_dir_all(self.task_dir(task_type))?;
        }
        Ok(())
    }
}
