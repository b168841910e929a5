//! Human-readable rendering of jobs and daemon status.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDateTime;
use dockmaster_scheduler::{
    types::format_timestamp, DaemonState, Job, JobTask, RunStatus, StatusReport, TaskType,
};

fn when(ts: Option<NaiveDateTime>) -> String {
    ts.map(format_timestamp).unwrap_or_else(|| "-".to_string())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

/// One block per job.
pub fn jobs(jobs: &BTreeMap<TaskType, Job>) -> String {
    if jobs.is_empty() {
        return "No scheduled jobs.\n".to_string();
    }
    let mut out = String::new();
    for (task_type, job) in jobs {
        let _ = writeln!(out, "{task_type} ({})", job.id);
        let _ = writeln!(out, "  schedule:  {}", job.recurrence);
        let _ = writeln!(out, "  container: {}", job.container_name);
        match &job.task {
            JobTask::Backup(p) => {
                let image = p.image_name.as_deref().unwrap_or("<container>:<timestamp>");
                let _ = writeln!(out, "  image:     {image}");
                let _ = writeln!(
                    out,
                    "  cleanup:   {}   auto-push: {}",
                    yes_no(p.cleanup),
                    yes_no(p.auto_push)
                );
            }
            JobTask::Cleanup(p) => {
                let _ = writeln!(out, "  paths:     {}", p.paths.join(", "));
            }
        }
        let last = job.history.last();
        let _ = writeln!(
            out,
            "  last run:  {}{}",
            when(job.last_run),
            last.map(|h| format!(" ({})", h.status)).unwrap_or_default()
        );
        if let Some(error) = last
            .filter(|h| h.status == RunStatus::Failed)
            .and_then(|h| h.error.as_deref())
        {
            let _ = writeln!(out, "  error:     {error}");
        }
        let _ = writeln!(out, "  next run:  {}", when(job.next_run));
    }
    out
}

/// Daemon state followed by the per-task view of the status file.
pub fn status(report: &StatusReport, jobs: &BTreeMap<TaskType, Job>) -> String {
    let mut out = String::new();
    let state = match (&report.status, report.running) {
        (_, true) => "running",
        (Some(s), false) if s.status == DaemonState::Running => "not running (stale status)",
        (Some(_), false) => "stopped",
        (None, false) => "unknown",
    };
    let _ = write!(out, "Scheduler: {state}");
    if let Some(uptime) = report.uptime {
        let _ = write!(out, ", up {uptime}");
    }
    out.push('\n');
    if let Some(s) = &report.status {
        if let Some(start) = s.start_time {
            let _ = writeln!(out, "  started:   {}", format_timestamp(start));
        }
        if let (false, Some(stop)) = (report.running, s.stop_time) {
            let _ = writeln!(out, "  stopped:   {}", format_timestamp(stop));
        }
    }

    for task_type in TaskType::ALL {
        let task = report.status.as_ref().and_then(|s| s.task(task_type));
        let job = jobs.get(&task_type);
        if task.is_none() && job.is_none() {
            continue;
        }
        let _ = writeln!(out, "{task_type}:");
        match job {
            Some(job) => {
                let _ = writeln!(out, "  schedule:  {}", job.recurrence);
            }
            None => {
                let _ = writeln!(out, "  schedule:  (not scheduled)");
            }
        }
        if let Some(task) = task {
            let _ = writeln!(
                out,
                "  last run:  {}{}",
                when(task.last_run),
                task.status.map(|s| format!(" ({s})")).unwrap_or_default()
            );
            if let Some(error) = &task.last_error {
                let _ = writeln!(out, "  error:     {error}");
            }
        }
        let next = job
            .and_then(|j| j.next_run)
            .or_else(|| task.and_then(|t| t.next_run));
        let _ = writeln!(out, "  next run:  {}", when(next));
    }
    out
}
