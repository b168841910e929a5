//! Job persistence in the project document's `schedule` section.
//!
//! Layout: `schedule.<task_type> = { cron, job_id, container_name, <params>,
//! last_run?, next_run?, history }`.
//!
//! The administration facade owns job existence, `cron` and parameters; the
//! daemon owns `last_run`, `next_run` and `history`. There is no channel to a
//! running daemon: it notices document changes on its next tick and
//! reconciles its in-memory table by `job_id`, which is how replacing or
//! removing a job also cancels the old schedule entry.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use chrono::NaiveDateTime;
use dockmaster_core::ProjectDocument;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{
    error::{Result, SchedulerError},
    schedule::Recurrence,
    types::{HistoryEntry, Job, JobTask, StoredJob, TaskType},
};

/// Reserved top-level key in the project document.
pub const SCHEDULE_SECTION: &str = "schedule";

/// CRUD over persisted job definitions.
#[derive(Debug, Clone)]
pub struct JobStore {
    doc: ProjectDocument,
}

impl JobStore {
    pub fn new(doc: ProjectDocument) -> Self {
        Self { doc }
    }

    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(ProjectDocument::for_project(project_dir))
    }

    pub fn document(&self) -> &ProjectDocument {
        &self.doc
    }

    /// Persist a new job for `task`'s type, replacing any existing one.
    ///
    /// The replacement gets a new id and an empty history.
    pub fn create_or_replace(
        &self,
        task: JobTask,
        recurrence: Recurrence,
        container_name: &str,
        now: NaiveDateTime,
    ) -> Result<Job> {
        let task_type = task.task_type();
        let mut job = Job::new(task, recurrence, container_name);
        job.next_run = recurrence.next_fire(now);
        let record = serde_json::to_value(job.to_stored()?)?;

        let replaced = self.doc.update(|root| {
            let section = schedule_section_mut(root);
            section
                .insert(task_type.as_str().to_string(), record)
                .and_then(|old| old.get("job_id").and_then(Value::as_str).map(str::to_string))
        })?;

        match replaced {
            Some(old_id) => {
                info!(task = %task_type, old_job_id = %old_id, job_id = %job.id, "job replaced")
            }
            None => info!(task = %task_type, job_id = %job.id, "job created"),
        }
        Ok(job)
    }

    /// The active job of `task_type`, if any.
    pub fn get(&self, task_type: TaskType) -> Result<Option<Job>> {
        let section = self.doc.section(SCHEDULE_SECTION)?;
        match section.as_ref().and_then(|s| s.get(task_type.as_str())) {
            Some(raw) => Ok(Some(parse_job(task_type, raw.clone())?)),
            None => Ok(None),
        }
    }

    /// All active jobs keyed by task type.
    ///
    /// Entries that fail to parse (hand-edited or from an incompatible
    /// version) are skipped with a warning rather than failing the listing.
    pub fn list(&self) -> Result<BTreeMap<TaskType, Job>> {
        let section = match self.doc.section(SCHEDULE_SECTION)? {
            Some(Value::Object(map)) => map,
            _ => return Ok(BTreeMap::new()),
        };

        let jobs = section
            .into_iter()
            .filter_map(|(key, raw)| {
                let task_type: TaskType = match key.parse() {
                    Ok(t) => t,
                    Err(_) => {
                        warn!(key = %key, "ignoring unknown schedule entry");
                        return None;
                    }
                };
                match parse_job(task_type, raw) {
                    Ok(job) => Some((task_type, job)),
                    Err(e) => {
                        warn!(task = %task_type, "ignoring unreadable schedule entry: {e}");
                        None
                    }
                }
            })
            .collect();
        Ok(jobs)
    }

    /// Delete the job of `task_type`. Returns `false` when there was none.
    pub fn remove(&self, task_type: TaskType) -> Result<bool> {
        if self.get(task_type)?.is_none() {
            return Ok(false);
        }
        let removed = self.doc.update(|root| {
            schedule_section_mut(root)
                .remove(task_type.as_str())
                .is_some()
        })?;
        if removed {
            info!(task = %task_type, "job removed");
        }
        Ok(removed)
    }

    /// Record one execution against the job, if `job_id` is still the active
    /// job of its type. Returns `false` when the job was replaced or removed
    /// in the meantime; the result is then dropped.
    pub fn record_run(
        &self,
        task_type: TaskType,
        job_id: &str,
        entry: HistoryEntry,
        next_run: Option<NaiveDateTime>,
        history_limit: usize,
    ) -> Result<bool> {
        self.modify_if_current(task_type, job_id, |job| {
            job.last_run = Some(entry.timestamp);
            job.next_run = next_run;
            job.push_history(entry, history_limit);
        })
    }

    /// Modification time of the backing document.
    pub fn modified(&self) -> Option<SystemTime> {
        self.doc.modified()
    }

    fn modify_if_current(
        &self,
        task_type: TaskType,
        job_id: &str,
        f: impl FnOnce(&mut Job),
    ) -> Result<bool> {
        let mut job = match self.get(task_type)? {
            Some(job) if job.id == job_id => job,
            _ => return Ok(false),
        };
        f(&mut job);
        let record = serde_json::to_value(job.to_stored()?)?;

        // Re-check under the document lock: a replace between `get` and here,
        // from this process or another, must not be overwritten.
        let written = self.doc.update(|root| {
            let section = schedule_section_mut(root);
            let still_current = section
                .get(task_type.as_str())
                .and_then(|v| v.get("job_id"))
                .and_then(Value::as_str)
                == Some(job_id);
            if still_current {
                section.insert(task_type.as_str().to_string(), record);
            }
            still_current
        })?;
        Ok(written)
    }
}

fn parse_job(task_type: TaskType, raw: Value) -> Result<Job> {
    let stored: StoredJob = serde_json::from_value(raw).map_err(|e| {
        SchedulerError::Persistence(format!("invalid {task_type} schedule entry: {e}"))
    })?;
    Job::from_stored(task_type, stored)
}

fn schedule_section_mut(root: &mut Map<String, Value>) -> &mut Map<String, Value> {
    let entry = root
        .entry(SCHEDULE_SECTION.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(map) => map,
        _ => unreachable!("schedule section was just normalised to an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CleanupParams, RunStatus};
    use chrono::NaiveTime;
    use serde_json::json;

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2025-03-10 12:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn daily(h: u32, m: u32) -> Recurrence {
        Recurrence::Daily {
            time: NaiveTime::from_hms_opt(h, m, 0).unwrap(),
        }
    }

    fn cleanup(paths: &[&str]) -> JobTask {
        JobTask::Cleanup(CleanupParams {
            paths: paths.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn create_then_get_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::for_project(dir.path());

        let job = store
            .create_or_replace(cleanup(&["/data/*"]), daily(3, 30), "web", now())
            .unwrap();
        assert!(job.id.starts_with("cleanup_"));
        assert_eq!(
            job.next_run,
            Some(NaiveDateTime::parse_from_str("2025-03-11 03:30:00", "%Y-%m-%d %H:%M:%S").unwrap())
        );

        let fetched = store.get(TaskType::Cleanup).unwrap().unwrap();
        assert_eq!(fetched, job);
        assert!(store.get(TaskType::Backup).unwrap().is_none());

        let all = store.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[&TaskType::Cleanup].id, job.id);
    }

    #[test]
    fn replacing_a_job_leaves_exactly_one_with_a_new_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::for_project(dir.path());

        let first = store
            .create_or_replace(cleanup(&["/tmp/*"]), daily(1, 0), "web", now())
            .unwrap();
        store
            .record_run(
                TaskType::Cleanup,
                &first.id,
                HistoryEntry {
                    timestamp: now(),
                    status: RunStatus::Success,
                    error: None,
                },
                None,
                30,
            )
            .unwrap();

        let second = store
            .create_or_replace(cleanup(&["/tmp/*"]), daily(2, 0), "web", now())
            .unwrap();
        assert_ne!(first.id, second.id);

        let all = store.list().unwrap();
        assert_eq!(all.len(), 1);
        let active = &all[&TaskType::Cleanup];
        assert_eq!(active.id, second.id);
        // history is not carried over to the replacement
        assert!(active.history.is_empty());
    }

    #[test]
    fn remove_reports_whether_anything_was_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::for_project(dir.path());
        assert!(!store.remove(TaskType::Backup).unwrap());

        store
            .create_or_replace(cleanup(&[]), daily(1, 0), "web", now())
            .unwrap();
        assert!(store.remove(TaskType::Cleanup).unwrap());
        assert!(!store.remove(TaskType::Cleanup).unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn record_run_ignores_stale_job_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::for_project(dir.path());
        let job = store
            .create_or_replace(cleanup(&[]), daily(1, 0), "web", now())
            .unwrap();

        let entry = HistoryEntry {
            timestamp: now(),
            status: RunStatus::Failed,
            error: Some("boom".into()),
        };
        assert!(!store
            .record_run(TaskType::Cleanup, "cleanup_deadbeef", entry.clone(), None, 30)
            .unwrap());
        assert!(store
            .record_run(TaskType::Cleanup, &job.id, entry.clone(), None, 30)
            .unwrap());

        let stored = store.get(TaskType::Cleanup).unwrap().unwrap();
        assert_eq!(stored.history, vec![entry]);
        assert_eq!(stored.last_run, Some(now()));
        assert_eq!(stored.next_run, None);
    }

    #[test]
    fn unrelated_document_sections_survive() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::for_project(dir.path());
        store
            .document()
            .write(&json!({"project": {"name": "web"}, "schedule": {"bogus": {}}}))
            .unwrap();

        store
            .create_or_replace(cleanup(&[]), daily(1, 0), "web", now())
            .unwrap();
        let doc = store.document().read().unwrap();
        assert_eq!(doc["project"]["name"], "web");
        // unknown entries are skipped by list() but left in place
        assert!(doc["schedule"].get("bogus").is_some());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn replace_racing_record_run_is_never_reverted() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::for_project(dir.path());
        let backup = store
            .create_or_replace(JobTask::Backup(Default::default()), daily(3, 0), "web", now())
            .unwrap();

        let recorder = {
            let store = JobStore::for_project(dir.path());
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let entry = HistoryEntry {
                        timestamp: now(),
                        status: RunStatus::Success,
                        error: None,
                    };
                    assert!(store
                        .record_run(TaskType::Backup, &backup.id, entry, None, 30)
                        .unwrap());
                }
            })
        };

        for _ in 0..100 {
            let created = store
                .create_or_replace(cleanup(&["/data/*"]), daily(4, 0), "web", now())
                .unwrap();
            assert_eq!(store.get(TaskType::Cleanup).unwrap().unwrap().id, created.id);
        }
        recorder.join().unwrap();

        assert_eq!(store.get(TaskType::Backup).unwrap().unwrap().history.len(), 30);
    }
}
