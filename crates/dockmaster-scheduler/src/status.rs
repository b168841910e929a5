//! Daemon-wide status document (`logs/scheduler/scheduler.status`).
//!
//! Written only by the daemon (and by `stop` when it has to force-kill),
//! read by any CLI process. Updates merge into the existing document: absent
//! keys are added, present ones overwritten field by field.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use dockmaster_core::document::write_atomic;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{Result, SchedulerError},
    types::{timestamp, RunStatus, TaskType},
};

/// Daemon lifecycle as last recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    #[default]
    Stopped,
    Running,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Running => "running",
        })
    }
}

/// Per-task slice of the status document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default, with = "timestamp::option")]
    pub last_run: Option<NaiveDateTime>,
    #[serde(default, with = "timestamp::option")]
    pub next_run: Option<NaiveDateTime>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Field-wise patch for a [`TaskStatus`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskStatusUpdate {
    pub last_run: Option<NaiveDateTime>,
    pub next_run: Option<Option<NaiveDateTime>>,
    pub status: Option<RunStatus>,
    pub last_error: Option<Option<String>>,
}

impl TaskStatusUpdate {
    /// Patch recording a finished run. A success clears `last_error`.
    pub fn finished(at: NaiveDateTime, status: RunStatus, error: Option<String>) -> Self {
        Self {
            last_run: Some(at),
            next_run: None,
            status: Some(status),
            last_error: Some(error),
        }
    }

    pub fn next_run(next: Option<NaiveDateTime>) -> Self {
        Self {
            next_run: Some(next),
            ..Self::default()
        }
    }

    fn apply(self, target: &mut TaskStatus) {
        if let Some(v) = self.last_run {
            target.last_run = Some(v);
        }
        if let Some(v) = self.next_run {
            target.next_run = v;
        }
        if let Some(v) = self.status {
            target.status = Some(v);
        }
        if let Some(v) = self.last_error {
            target.last_error = v;
        }
    }
}

/// Whole status document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    #[serde(default)]
    pub status: DaemonState,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<NaiveDateTime>,
    /// Keyed by task type name; unknown keys are preserved.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskStatus>,
}

/// Time since the daemon's recorded start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uptime {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
}

impl std::fmt::Display for Uptime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}d {}h {}m", self.days, self.hours, self.minutes)
    }
}

impl DaemonStatus {
    pub fn task(&self, task_type: TaskType) -> Option<&TaskStatus> {
        self.tasks.get(task_type.as_str())
    }

    /// Uptime when the daemon is recorded as running.
    pub fn uptime(&self, now: NaiveDateTime) -> Option<Uptime> {
        if self.status != DaemonState::Running {
            return None;
        }
        let secs = (now - self.start_time?).num_seconds().max(0);
        Some(Uptime {
            days: secs / 86_400,
            hours: (secs % 86_400) / 3_600,
            minutes: (secs % 3_600) / 60,
        })
    }
}

/// Reader/writer for the status file.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document; a missing file reads as a fresh `stopped` status.
    pub fn load(&self) -> Result<DaemonStatus> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                SchedulerError::Persistence(format!(
                    "unreadable status file {}: {e}",
                    self.path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DaemonStatus::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Like [`StatusStore::load`] but never fails; an unreadable document
    /// is reported as `None` ("unknown").
    pub fn load_or_unknown(&self) -> Option<DaemonStatus> {
        match self.load() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("scheduler status unknown: {e}");
                None
            }
        }
    }

    pub fn mark_running(&self, at: NaiveDateTime) -> Result<()> {
        self.modify(|s| {
            s.status = DaemonState::Running;
            s.start_time = Some(at);
        })
    }

    pub fn mark_stopped(&self, at: NaiveDateTime) -> Result<()> {
        self.modify(|s| {
            s.status = DaemonState::Stopped;
            s.stop_time = Some(at);
        })
    }

    pub fn update_task(&self, task_type: TaskType, update: TaskStatusUpdate) -> Result<()> {
        self.modify(|s| {
            update.apply(s.tasks.entry(task_type.as_str().to_string()).or_default());
        })
    }

    fn modify(&self, f: impl FnOnce(&mut DaemonStatus)) -> Result<()> {
        // A corrupt document is replaced rather than blocking every update.
        let mut status = self.load().unwrap_or_else(|e| {
            warn!("resetting status file: {e}");
            DaemonStatus::default()
        });
        f(&mut status);
        let text = serde_json::to_string_pretty(&status)?;
        write_atomic(&self.path, text.as_bytes())?;
        Ok(())
    }
}
