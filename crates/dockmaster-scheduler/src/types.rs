use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{config_err, Result, SchedulerError};
use crate::schedule::Recurrence;

/// Paths cleaned when a cleanup job is created without explicit paths.
pub const DEFAULT_CLEANUP_PATHS: [&str; 2] = ["/tmp/*", "/var/cache/*"];

/// Timestamp format used in every persisted document.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The kinds of maintenance job a project can schedule. At most one job of
/// each kind is active per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Backup,
    Cleanup,
}

impl TaskType {
    pub const ALL: [TaskType; 2] = [TaskType::Backup, TaskType::Cleanup];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Backup => "backup",
            TaskType::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "backup" => Ok(TaskType::Backup),
            "cleanup" => Ok(TaskType::Cleanup),
            other => Err(config_err(format!("unsupported task type: {other}"))),
        }
    }
}

/// Parameters of a backup job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupParams {
    /// Clean the container before committing it.
    #[serde(default)]
    pub cleanup: bool,
    /// Push the committed image to the configured registry.
    #[serde(default)]
    pub auto_push: bool,
    /// `repo:tag` or `repo` override for the committed image.
    #[serde(default)]
    pub image_name: Option<String>,
}

/// Parameters of a cleanup job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupParams {
    /// Globs removed inside the container.
    #[serde(default = "default_cleanup_paths")]
    pub paths: Vec<String>,
}

impl Default for CleanupParams {
    fn default() -> Self {
        Self {
            paths: default_cleanup_paths(),
        }
    }
}

fn default_cleanup_paths() -> Vec<String> {
    DEFAULT_CLEANUP_PATHS.iter().map(|s| s.to_string()).collect()
}

/// What a job does when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTask {
    Backup(BackupParams),
    Cleanup(CleanupParams),
}

impl JobTask {
    pub fn task_type(&self) -> TaskType {
        match self {
            JobTask::Backup(_) => TaskType::Backup,
            JobTask::Cleanup(_) => TaskType::Cleanup,
        }
    }

    /// Task parameters as the flat JSON object stored beside the job.
    pub fn params_value(&self) -> Result<Map<String, Value>> {
        let value = match self {
            JobTask::Backup(p) => serde_json::to_value(p)?,
            JobTask::Cleanup(p) => serde_json::to_value(p)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(SchedulerError::Persistence(
                "task parameters must serialize to an object".to_string(),
            )),
        }
    }

    fn from_params(task_type: TaskType, params: Map<String, Value>) -> Result<Self> {
        let value = Value::Object(params);
        Ok(match task_type {
            TaskType::Backup => JobTask::Backup(serde_json::from_value(value)?),
            TaskType::Cleanup => JobTask::Cleanup(serde_json::from_value(value)?),
        })
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        })
    }
}

/// One entry of a job's bounded run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(with = "timestamp")]
    pub timestamp: NaiveDateTime,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A recurring maintenance job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// `{task_type}_{8 hex chars}`, fixed for the job's lifetime.
    pub id: String,
    pub container_name: String,
    pub recurrence: Recurrence,
    pub task: JobTask,
    pub last_run: Option<NaiveDateTime>,
    pub next_run: Option<NaiveDateTime>,
    /// Newest entries last.
    pub history: Vec<HistoryEntry>,
}

impl Job {
    /// Fresh job with a newly generated id and empty history.
    pub fn new(task: JobTask, recurrence: Recurrence, container_name: impl Into<String>) -> Self {
        Self {
            id: generate_job_id(task.task_type()),
            container_name: container_name.into(),
            recurrence,
            task,
            last_run: None,
            next_run: None,
            history: Vec::new(),
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.task.task_type()
    }

    /// Append a history entry, dropping the oldest beyond `limit`.
    pub fn push_history(&mut self, entry: HistoryEntry, limit: usize) {
        self.history.push(entry);
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }

    pub fn to_stored(&self) -> Result<StoredJob> {
        Ok(StoredJob {
            cron: self.recurrence,
            job_id: self.id.clone(),
            container_name: self.container_name.clone(),
            last_run: self.last_run,
            next_run: self.next_run,
            history: self.history.clone(),
            params: self.task.params_value()?,
        })
    }

    pub fn from_stored(task_type: TaskType, stored: StoredJob) -> Result<Self> {
        Ok(Self {
            id: stored.job_id,
            container_name: stored.container_name,
            recurrence: stored.cron,
            task: JobTask::from_params(task_type, stored.params)?,
            last_run: stored.last_run,
            next_run: stored.next_run,
            history: stored.history,
        })
    }
}

/// On-disk layout of `schedule.<task_type>` in the project document.
///
/// Task parameters are flattened beside the bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredJob {
    pub cron: Recurrence,
    pub job_id: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub last_run: Option<NaiveDateTime>,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub next_run: Option<NaiveDateTime>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// `{task_type}_{first 8 hex chars of a UUIDv4}`.
pub fn generate_job_id(task_type: TaskType) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}_{}", task_type, &hex[..8])
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Serde adapters for `YYYY-MM-DD HH:MM:SS` local timestamps.
pub mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            ts: &Option<NaiveDateTime>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<NaiveDateTime>, D::Error> {
            let raw: Option<String> = Option::deserialize(d)?;
            raw.map(|r| NaiveDateTime::parse_from_str(&r, TIMESTAMP_FORMAT))
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use serde_json::json;

    fn entry(n: u32) -> HistoryEntry {
        HistoryEntry {
            timestamp: NaiveDateTime::parse_from_str(
                &format!("2025-01-01 00:{n:02}:00"),
                TIMESTAMP_FORMAT,
            )
            .unwrap(),
            status: RunStatus::Success,
            error: None,
        }
    }

    #[test]
    fn job_id_format() {
        let id = generate_job_id(TaskType::Backup);
        let (prefix, hex) = id.split_once('_').unwrap();
        assert_eq!(prefix, "backup");
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_job_id(TaskType::Backup));
    }

    #[test]
    fn task_type_parse() {
        assert_eq!("cleanup".parse::<TaskType>().unwrap(), TaskType::Cleanup);
        let err = "rebuild".parse::<TaskType>().unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
    }

    #[test]
    fn history_keeps_newest_entries() {
        let mut job = Job::new(
            JobTask::Cleanup(CleanupParams::default()),
            Recurrence::Hourly { minute: 0 },
            "web",
        );
        for n in 0..35 {
            job.push_history(entry(n), 30);
        }
        assert_eq!(job.history.len(), 30);
        assert_eq!(job.history.first(), Some(&entry(5)));
        assert_eq!(job.history.last(), Some(&entry(34)));
    }

    #[test]
    fn stored_layout_flattens_params() {
        let job = Job::new(
            JobTask::Backup(BackupParams {
                cleanup: true,
                auto_push: false,
                image_name: Some("web:nightly".into()),
            }),
            Recurrence::Daily {
                time: NaiveTime::from_hms_opt(3, 30, 0).unwrap(),
            },
            "web",
        );
        let value = serde_json::to_value(job.to_stored().unwrap()).unwrap();
        assert_eq!(value["cron"], json!({"type": "daily", "time": "03:30"}));
        assert_eq!(value["container_name"], "web");
        assert_eq!(value["cleanup"], true);
        assert_eq!(value["image_name"], "web:nightly");
        assert!(value.get("last_run").is_none());

        let stored: StoredJob = serde_json::from_value(value).unwrap();
        let back = Job::from_stored(TaskType::Backup, stored).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn legacy_record_with_string_cron_loads() {
        let value = json!({
            "cron": "02:00",
            "job_id": "cleanup_1a2b3c4d",
            "container_name": "web",
            "paths": ["/data/*"]
        });
        let stored: StoredJob = serde_json::from_value(value).unwrap();
        let job = Job::from_stored(TaskType::Cleanup, stored).unwrap();
        assert_eq!(
            job.task,
            JobTask::Cleanup(CleanupParams {
                paths: vec!["/data/*".into()]
            })
        );
        assert_eq!(
            job.recurrence,
            Recurrence::Daily {
                time: NaiveTime::from_hms_opt(2, 0, 0).unwrap()
            }
        );
    }
}
