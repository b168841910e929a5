//! Per-task execution logs.
//!
//! Every run writes to two places under `tasks/<task>/`: the rotating
//! `latest.<date>.log` shared by all runs (kept for a bounded number of
//! rotations), and a dedicated `<YYYYmmdd_HHMMSS>.log` for that run alone
//! (pruned by age). Lines are mirrored into the daemon's own tracing output.
//!
//! The rotated file names carry tracing-appender's UTC date; run file names
//! and the timestamps inside every line are local time.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Local, NaiveDateTime};
use tracing::{debug, error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;

use crate::{
    paths::{SchedulerPaths, DAEMON_LOG_PREFIX, LATEST_LOG_PREFIX, LOG_SUFFIX},
    types::{TaskType, TIMESTAMP_FORMAT},
};

const RUN_LOG_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Owns the rotating per-task appenders of one daemon.
pub struct LogSink {
    paths: SchedulerPaths,
    latest_retention: usize,
    run_retention_days: i64,
    latest: HashMap<TaskType, RollingFileAppender>,
}

impl LogSink {
    pub fn new(paths: SchedulerPaths, latest_retention: usize, run_retention_days: i64) -> Self {
        Self {
            paths,
            latest_retention: latest_retention.max(1),
            run_retention_days,
            latest: HashMap::new(),
        }
    }

    /// Open the log of a run starting at `started`.
    ///
    /// Never fails: a destination that cannot be opened is reported once and
    /// skipped, so logging problems never abort a job.
    pub fn open_run(&mut self, task_type: TaskType, started: NaiveDateTime) -> RunLog<'_> {
        let dir = self.paths.task_dir(task_type);
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(task = %task_type, "cannot create task log dir {}: {e}", dir.display());
        }
        prune_run_logs(&dir, started - Duration::days(self.run_retention_days));

        let run_path = dir.join(format!("{}.{LOG_SUFFIX}", started.format(RUN_LOG_FORMAT)));
        let run = match OpenOptions::new().create(true).append(true).open(&run_path) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(task = %task_type, "cannot open run log {}: {e}", run_path.display());
                None
            }
        };

        if !self.latest.contains_key(&task_type) {
            match RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LATEST_LOG_PREFIX)
                .filename_suffix(LOG_SUFFIX)
                .max_log_files(self.latest_retention)
                .build(&dir)
            {
                Ok(appender) => {
                    self.latest.insert(task_type, appender);
                }
                Err(e) => warn!(task = %task_type, "cannot open latest log: {e}"),
            }
        }

        RunLog {
            task_type,
            latest: self.latest.get(&task_type),
            run,
        }
    }
}

/// Writer for a single run. Each line goes to both task logs and to tracing.
pub struct RunLog<'a> {
    task_type: TaskType,
    latest: Option<&'a RollingFileAppender>,
    run: Option<File>,
}

impl RunLog<'_> {
    pub fn info(&mut self, msg: impl AsRef<str>) {
        self.line(LogLevel::Info, msg.as_ref());
    }

    pub fn warn(&mut self, msg: impl AsRef<str>) {
        self.line(LogLevel::Warn, msg.as_ref());
    }

    pub fn error(&mut self, msg: impl AsRef<str>) {
        self.line(LogLevel::Error, msg.as_ref());
    }

    pub fn line(&mut self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Info => info!(task = %self.task_type, "{msg}"),
            LogLevel::Warn => warn!(task = %self.task_type, "{msg}"),
            LogLevel::Error => error!(task = %self.task_type, "{msg}"),
        }

        let text = format!(
            "{} | {:<5} | {msg}\n",
            Local::now().format(TIMESTAMP_FORMAT),
            level.as_str()
        );
        if let Some(appender) = self.latest {
            if let Err(e) = appender.make_writer().write_all(text.as_bytes()) {
                debug!(task = %self.task_type, "latest log write failed: {e}");
            }
        }
        if let Some(file) = self.run.as_mut() {
            if let Err(e) = file.write_all(text.as_bytes()) {
                debug!(task = %self.task_type, "run log write failed: {e}");
            }
        }
    }
}

/// Remove per-run logs whose start time is before `cutoff`.
fn prune_run_logs(dir: &Path, cutoff: NaiveDateTime) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(started) = run_log_start(&path) else {
            continue;
        };
        if started < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "pruned old run log"),
                Err(e) => warn!(path = %path.display(), "failed to prune run log: {e}"),
            }
        }
    }
}

fn run_log_start(path: &Path) -> Option<NaiveDateTime> {
    if path.extension()?.to_str()? != LOG_SUFFIX {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    NaiveDateTime::parse_from_str(stem, RUN_LOG_FORMAT).ok()
}

/// Newest file in `dir` named `<prefix>.*.log`.
pub fn newest_rotated(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let lead = format!("{prefix}.");
    let tail = format!(".{LOG_SUFFIX}");
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            (name.starts_with(&lead) && name.ends_with(&tail)).then_some(name)
        })
        // the date suffix sorts lexically
        .max()
        .map(|name| dir.join(name))
}

/// The log file currently written for `task_type`, or the daemon log when
/// `task_type` is `None`.
pub fn current_log(paths: &SchedulerPaths, task_type: Option<TaskType>) -> Option<PathBuf> {
    match task_type {
        Some(t) => newest_rotated(&paths.task_dir(t), LATEST_LOG_PREFIX),
        None => newest_rotated(&paths.root, DAEMON_LOG_PREFIX),
    }
}

/// Last `lines` lines of [`current_log`]. `Ok(None)` if no log exists yet.
pub fn tail(
    paths: &SchedulerPaths,
    task_type: Option<TaskType>,
    lines: usize,
) -> io::Result<Option<String>> {
    let Some(file) = current_log(paths, task_type) else {
        return Ok(None);
    };
    let text = fs::read_to_string(file)?;
    Ok(Some(last_lines(&text, lines)))
}

fn last_lines(text: &str, n: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(n);
    let mut out = all[start..].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}
