//! `dockmaster schedule …` handlers.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail};
use dockmaster_core::DockmasterConfig;
use dockmaster_scheduler::{
    logs, paths::SchedulerPaths, DaemonCommand, Job, Recurrence, SchedulerManager, StartOutcome,
    StopOutcome, TaskType,
};
use serde_json::{json, Value};

use crate::{format, AfterArgs, ScheduleCommand, WhenArgs};

pub struct Context {
    manager: SchedulerManager,
}

impl Context {
    pub fn new(
        project_dir: &Path,
        config: DockmasterConfig,
        daemon_args: Vec<OsString>,
    ) -> anyhow::Result<Self> {
        let command = DaemonCommand::current_exe(daemon_args)?;
        Ok(Self {
            manager: SchedulerManager::new(project_dir, config.scheduler)
                .with_daemon_command(command),
        })
    }

    fn paths(&self) -> &SchedulerPaths {
        self.manager.supervisor().paths()
    }
}

pub async fn run(cmd: ScheduleCommand, ctx: &Context) -> anyhow::Result<()> {
    let manager = &ctx.manager;
    match cmd {
        ScheduleCommand::Backup(args) => {
            let job = manager.schedule_backup(
                recurrence(&args.when)?,
                args.image_name,
                args.cleanup,
                args.auto_push,
            )?;
            report_scheduled(&job);
            after_schedule(ctx, &job, &args.after).await
        }
        ScheduleCommand::Cleanup(args) => {
            let job = manager.schedule_cleanup(recurrence(&args.when)?, args.paths)?;
            report_scheduled(&job);
            after_schedule(ctx, &job, &args.after).await
        }
        ScheduleCommand::List => {
            print!("{}", format::jobs(&manager.list_jobs()?));
            Ok(())
        }
        ScheduleCommand::Remove { task } => {
            if manager.remove_job(task)? {
                println!("Removed {task} job.");
            } else {
                println!("No {task} job scheduled.");
            }
            Ok(())
        }
        ScheduleCommand::Start => {
            report_start(manager.start().await?);
            Ok(())
        }
        ScheduleCommand::Stop => {
            match manager.stop().await? {
                StopOutcome::NotRunning => println!("Scheduler is not running."),
                StopOutcome::Stopped { pid } => println!("Scheduler stopped (pid {pid})."),
                StopOutcome::Killed { pid } => {
                    println!("Scheduler did not exit in time and was killed (pid {pid}).")
                }
            }
            Ok(())
        }
        ScheduleCommand::Restart => {
            report_start(manager.restart().await?);
            Ok(())
        }
        ScheduleCommand::Status => {
            let report = manager.get_status();
            let jobs = manager.list_jobs()?;
            print!("{}", format::status(&report, &jobs));
            Ok(())
        }
        ScheduleCommand::Logs {
            task,
            lines,
            follow,
        } => {
            match manager.get_logs(task, lines)? {
                Some(text) => print!("{text}"),
                None if !follow => println!("No log file yet."),
                None => {}
            }
            if follow {
                follow_log(ctx.paths(), task).await?;
            }
            Ok(())
        }
        ScheduleCommand::Run { task } => {
            let job = manager
                .get_job(task)?
                .ok_or_else(|| anyhow!("no {task} job scheduled"))?;
            manager.run_now(task, &job.id)?;
            println!("Requested immediate {task} run ({}).", job.id);
            Ok(())
        }
    }
}

/// Build the recurrence from CLI flags; the JSON form goes through the same
/// validation as stored documents.
fn recurrence(when: &WhenArgs) -> anyhow::Result<Recurrence> {
    let value = if let Some(spec) = &when.spec {
        serde_json::from_str::<Value>(spec).map_err(|e| anyhow!("invalid --spec JSON: {e}"))?
    } else if let Some(minute) = when.hourly {
        json!({"type": "hourly", "minute": minute})
    } else if let Some(weekday) = &when.weekly {
        let mut spec = json!({"type": "weekly", "weekday": weekday});
        if let Some(time) = &when.time {
            spec["time"] = json!(time);
        }
        spec
    } else if let Some(day) = when.monthly {
        let mut spec = json!({"type": "monthly", "day": day});
        if let Some(time) = &when.time {
            spec["time"] = json!(time);
        }
        spec
    } else {
        match &when.time {
            Some(time) => json!(time),
            None => bail!("a time (HH:MM), --weekly, --monthly, --hourly or --spec is required"),
        }
    };
    Ok(Recurrence::from_value(&value)?)
}

fn report_scheduled(job: &Job) {
    println!(
        "Scheduled {} job {} ({}), next run {}.",
        job.task_type(),
        job.id,
        job.recurrence,
        job.next_run
            .map(dockmaster_scheduler::types::format_timestamp)
            .unwrap_or_else(|| "-".to_string())
    );
}

fn report_start(outcome: StartOutcome) {
    match outcome {
        StartOutcome::Started { pid } => println!("Scheduler started (pid {pid})."),
        StartOutcome::AlreadyRunning { pid: Some(pid) } => {
            println!("Scheduler already running (pid {pid}).")
        }
        StartOutcome::AlreadyRunning { pid: None } => println!("Scheduler already running."),
    }
}

/// Make sure a daemon will pick the job up, and optionally fire it once.
async fn after_schedule(ctx: &Context, job: &Job, after: &AfterArgs) -> anyhow::Result<()> {
    if after.no_start {
        if !ctx.manager.is_running() {
            println!("Scheduler is not running; start it with `dockmaster schedule start`.");
        }
        return Ok(());
    }
    if let StartOutcome::Started { pid } = ctx.manager.start().await? {
        println!("Scheduler started (pid {pid}).");
    }
    if after.run_now {
        ctx.manager.run_now(job.task_type(), &job.id)?;
        println!("Requested immediate {} run.", job.task_type());
    }
    Ok(())
}

/// Print whatever is appended to the current log until Ctrl-C. Switches to
/// the new file when the log rotates.
async fn follow_log(paths: &SchedulerPaths, task: Option<TaskType>) -> anyhow::Result<()> {
    let mut current: Option<PathBuf> = logs::current_log(paths, task);
    let mut offset = current
        .as_ref()
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let latest = logs::current_log(paths, task);
        if latest != current {
            current = latest;
            offset = 0;
        }
        let Some(path) = &current else {
            continue;
        };
        let Ok(bytes) = std::fs::read(path) else {
            continue;
        };
        let len = bytes.len() as u64;
        if len < offset {
            // truncated underneath us
            offset = 0;
        }
        if len > offset {
            let mut out = std::io::stdout().lock();
            out.write_all(&bytes[offset as usize..])?;
            out.flush()?;
            offset = len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};

    fn when(time: Option<&str>) -> WhenArgs {
        WhenArgs {
            time: time.map(str::to_string),
            weekly: None,
            monthly: None,
            hourly: None,
            spec: None,
        }
    }

    #[test]
    fn bare_time_is_daily() {
        assert_eq!(
            recurrence(&when(Some("03:30"))).unwrap(),
            Recurrence::Daily {
                time: NaiveTime::from_hms_opt(3, 30, 0).unwrap()
            }
        );
    }

    #[test]
    fn weekly_and_monthly_flags() {
        let mut args = when(Some("22:00"));
        args.weekly = Some("fri".into());
        assert_eq!(
            recurrence(&args).unwrap(),
            Recurrence::Weekly {
                weekday: Weekday::Fri,
                time: NaiveTime::from_hms_opt(22, 0, 0).unwrap()
            }
        );

        let mut args = when(None);
        args.monthly = Some(15);
        assert_eq!(
            recurrence(&args).unwrap(),
            Recurrence::Monthly {
                day: 15,
                time: NaiveTime::MIN
            }
        );
    }

    #[test]
    fn json_spec_and_hourly() {
        let mut args = when(None);
        args.spec = Some(r#"{"type":"hourly","minute":45}"#.into());
        assert_eq!(recurrence(&args).unwrap(), Recurrence::Hourly { minute: 45 });

        let mut args = when(None);
        args.hourly = Some(75);
        assert!(recurrence(&args).is_err());
    }

    #[test]
    fn missing_time_is_an_error() {
        assert!(recurrence(&when(None)).is_err());
        assert!(recurrence(&when(Some("25:00"))).is_err());
    }
}
