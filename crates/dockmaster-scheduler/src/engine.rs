use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{Local, NaiveDateTime};
use dockmaster_core::{config::SchedulerConfig, ContainerRuntime, RegistryCredentials};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    logs::LogSink,
    paths::SchedulerPaths,
    status::{StatusStore, TaskStatusUpdate},
    store::JobStore,
    tasks::{run_task, TaskContext},
    types::{HistoryEntry, Job, RunStatus, TaskType},
};

/// A job in the live table together with its next evaluation instant.
///
/// For monthly jobs the checkpoint recurs daily and the job only runs on
/// checkpoints that fall on its day of the month.
#[derive(Debug, Clone)]
struct Entry {
    job: Job,
    checkpoint: NaiveDateTime,
}

/// The daemon's execution loop: keeps an in-memory table in step with the
/// project document and runs whatever is due, one job at a time.
pub struct SchedulerEngine {
    store: JobStore,
    status: StatusStore,
    logs: LogSink,
    runtime: Arc<dyn ContainerRuntime>,
    triggers_dir: PathBuf,
    history_limit: usize,
    tick_interval: Duration,
    table: BTreeMap<TaskType, Entry>,
    seen_modified: Option<SystemTime>,
    loaded: bool,
}

impl SchedulerEngine {
    pub fn new(
        project_dir: &Path,
        config: &SchedulerConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let paths = SchedulerPaths::for_project(project_dir);
        Self {
            store: JobStore::for_project(project_dir),
            status: StatusStore::new(&paths.status_file),
            triggers_dir: paths.triggers_dir.clone(),
            logs: LogSink::new(
                paths,
                config.latest_log_retention,
                config.history_log_retention_days,
            ),
            runtime,
            history_limit: config.history_limit.max(1),
            tick_interval: Duration::from_secs(config.tick_interval_secs.max(1)),
            table: BTreeMap::new(),
            seen_modified: None,
            loaded: false,
        }
    }

    /// Jobs currently in the live table.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.table.values().map(|e| &e.job)
    }

    /// Next evaluation instant of `task_type`'s job.
    pub fn checkpoint(&self, task_type: TaskType) -> Option<NaiveDateTime> {
        self.table.get(&task_type).map(|e| e.checkpoint)
    }

    /// Reconcile the live table with the persisted jobs.
    ///
    /// Entries are matched by job id: unchanged ids keep their checkpoint,
    /// ids no longer persisted are dropped, and new ids start from their
    /// persisted `next_run` unless it has already passed. Occurrences missed
    /// while no daemon was running are not caught up.
    pub fn sync(&mut self, now: NaiveDateTime) -> Result<()> {
        self.seen_modified = self.store.modified();
        let persisted = self.store.list()?;
        self.loaded = true;

        let stale: Vec<TaskType> = self
            .table
            .iter()
            .filter(|(t, e)| persisted.get(t).map(|j| &j.id) != Some(&e.job.id))
            .map(|(t, _)| *t)
            .collect();
        for task_type in stale {
            if let Some(old) = self.table.remove(&task_type) {
                info!(task = %task_type, job_id = %old.job.id, "job unscheduled");
                if !persisted.contains_key(&task_type) {
                    self.publish_next_run(task_type, None);
                }
            }
        }

        for (task_type, job) in persisted {
            match self.table.get_mut(&task_type) {
                Some(entry) => entry.job = job,
                None => {
                    let checkpoint = job
                        .next_run
                        .filter(|next| *next >= now)
                        .unwrap_or_else(|| job.recurrence.next_run(now));
                    let next_fire = job.recurrence.next_fire(now);
                    info!(
                        task = %task_type,
                        job_id = %job.id,
                        schedule = %job.recurrence,
                        next_run = ?next_fire,
                        "job scheduled"
                    );
                    self.table.insert(task_type, Entry { job, checkpoint });
                    self.publish_next_run(task_type, next_fire);
                }
            }
        }
        Ok(())
    }

    /// One pass of the loop at wall-clock `now`. Returns the number of job
    /// executions performed. Errors never escape: they are logged and, for
    /// job bodies, recorded in the job's history.
    pub async fn tick_at(&mut self, now: NaiveDateTime) -> usize {
        if !self.loaded || self.store.modified() != self.seen_modified {
            if let Err(e) = self.sync(now) {
                error!("failed to reload scheduled jobs: {e}");
            }
        }

        let mut executed = self.run_triggers(now).await;

        let due: Vec<TaskType> = self
            .table
            .iter()
            .filter(|(_, e)| e.checkpoint <= now)
            .map(|(t, _)| *t)
            .collect();

        for task_type in due {
            let Some(entry) = self.table.get_mut(&task_type) else {
                continue;
            };
            let fires = entry.job.recurrence.fires_on(entry.checkpoint);
            entry.checkpoint = entry.job.recurrence.next_run(now);
            if !fires {
                debug!(task = %task_type, "checkpoint outside firing day, skipped");
                continue;
            }
            self.execute(task_type, now).await;
            executed += 1;
        }
        executed
    }

    /// Main event loop. Ticks until `shutdown` broadcasts `true`; a job in
    /// flight always finishes before the loop observes the request.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(jobs = self.table.len(), "scheduler engine started");

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_at(Local::now().naive_local()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler engine shutting down");
    }

    /// Execute pending run-now requests. Each trigger file is named after a
    /// task type and holds the id of the job to run.
    async fn run_triggers(&mut self, now: NaiveDateTime) -> usize {
        let entries = match fs::read_dir(&self.triggers_dir) {
            Ok(e) => e,
            Err(_) => return 0,
        };
        let mut requests = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let job_id = fs::read_to_string(&path).unwrap_or_default();
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), "failed to consume run-now trigger: {e}");
                continue;
            }
            match name.parse::<TaskType>() {
                Ok(task_type) => requests.push((task_type, job_id.trim().to_string())),
                Err(_) => warn!(trigger = %name, "ignoring unknown run-now trigger"),
            }
        }

        let mut executed = 0;
        for (task_type, job_id) in requests {
            if !self.holds(task_type, &job_id) {
                // the request may be for a job created since the last sync
                if let Err(e) = self.sync(now) {
                    error!("failed to reload scheduled jobs: {e}");
                }
            }
            if self.holds(task_type, &job_id) {
                info!(task = %task_type, job_id = %job_id, "run-now requested");
                self.execute(task_type, now).await;
                executed += 1;
            } else {
                warn!(task = %task_type, job_id = %job_id, "run-now for unknown job ignored");
            }
        }
        executed
    }

    fn holds(&self, task_type: TaskType, job_id: &str) -> bool {
        self.table
            .get(&task_type)
            .is_some_and(|e| e.job.id == job_id)
    }

    /// Run the table's job of `task_type` once and record the outcome.
    async fn execute(&mut self, task_type: TaskType, now: NaiveDateTime) {
        let Some(job) = self.table.get(&task_type).map(|e| e.job.clone()) else {
            return;
        };
        let next_fire = job.recurrence.next_fire(now);
        let credentials = match self.store.document().read() {
            Ok(doc) => RegistryCredentials::from_document(&doc),
            Err(e) => {
                warn!("project document unreadable, registry settings unavailable: {e}");
                RegistryCredentials::from_document(&Value::Null)
            }
        };

        let started = Instant::now();
        let result = {
            let mut log = self.logs.open_run(task_type, now);
            log.info(format!("job {} started", job.id));
            let ctx = TaskContext {
                runtime: self.runtime.as_ref(),
                credentials,
                started: now,
            };
            let result = run_task(&job, &ctx, &mut log).await;
            let secs = started.elapsed().as_secs_f64();
            match &result {
                Ok(()) => log.info(format!("job {} succeeded in {secs:.1}s", job.id)),
                Err(e) => log.error(format!("job {} failed after {secs:.1}s: {e}", job.id)),
            }
            result
        };

        let (status, error) = match result {
            Ok(()) => (RunStatus::Success, None),
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
        };
        let entry = HistoryEntry {
            timestamp: now,
            status,
            error: error.clone(),
        };

        match self
            .store
            .record_run(task_type, &job.id, entry, next_fire, self.history_limit)
        {
            Ok(true) => {}
            Ok(false) => {
                info!(task = %task_type, job_id = %job.id, "job changed while running, result dropped");
                return;
            }
            Err(e) => error!(task = %task_type, job_id = %job.id, "failed to record run: {e}"),
        }

        let mut update = TaskStatusUpdate::finished(now, status, error);
        update.next_run = Some(next_fire);
        if let Err(e) = self.status.update_task(task_type, update) {
            error!(task = %task_type, "failed to update status: {e}");
        }
    }

    fn publish_next_run(&self, task_type: TaskType, next: Option<NaiveDateTime>) {
        if let Err(e) = self
            .status
            .update_task(task_type, TaskStatusUpdate::next_run(next))
        {
            warn!(task = %task_type, "failed to update status: {e}");
        }
    }
}
