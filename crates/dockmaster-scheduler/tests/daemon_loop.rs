//! End-to-end behaviour of the execution loop against a stub container
//! runtime, driven with simulated wall-clock instants.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime};
use dockmaster_core::{
    config::SchedulerConfig, ContainerRuntime, ImageRef, RegistryCredentials, RuntimeError,
};
use dockmaster_scheduler::{
    status::StatusStore, store::JobStore, BackupParams, CleanupParams, DaemonState,
    DaemonSupervisor, JobTask, Recurrence, RunStatus, SchedulerEngine, SchedulerManager,
    TaskType,
};
use serde_json::json;
use tokio::sync::watch;

#[derive(Default)]
struct StubRuntime {
    fail_commit: bool,
    fail_exec: bool,
    stopped: bool,
    calls: Mutex<Vec<String>>,
}

impl StubRuntime {
    fn failing() -> Self {
        Self {
            fail_commit: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn container_status(&self, _container: &str) -> Result<Option<String>, RuntimeError> {
        let state = if self.stopped { "exited" } else { "running" };
        Ok(Some(state.into()))
    }

    async fn wait_for_status(&self, _container: &str, _expected: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn exec(&self, container: &str, command: &str) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("exec {container} {command}"));
        if self.fail_exec {
            return Err(RuntimeError::CommandFailed {
                command: "docker exec".into(),
                code: 1,
                stderr: "OCI runtime exec failed".into(),
            });
        }
        Ok(())
    }

    async fn commit(&self, container: &str, image: &ImageRef) -> Result<(), RuntimeError> {
        if self.fail_commit {
            return Err(RuntimeError::CommandFailed {
                command: "docker commit".into(),
                code: 1,
                stderr: "Error response from daemon: No such container".into(),
            });
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("commit {container} {image}"));
        Ok(())
    }

    async fn push(
        &self,
        image: &ImageRef,
        _credentials: &RegistryCredentials,
    ) -> Result<String, RuntimeError> {
        self.calls.lock().unwrap().push(format!("push {image}"));
        Ok(format!("registry.example.com/team/{image}"))
    }
}

fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn hhmm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn engine(dir: &Path, runtime: Arc<dyn ContainerRuntime>) -> SchedulerEngine {
    SchedulerEngine::new(dir, &SchedulerConfig::default(), runtime)
}

#[tokio::test]
async fn hourly_cleanup_runs_once_at_the_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::for_project(dir.path());
    let job = store
        .create_or_replace(
            JobTask::Cleanup(CleanupParams {
                paths: vec!["/data/cache/*".into()],
            }),
            Recurrence::Hourly { minute: 0 },
            "web",
            at("2025-03-10 10:30:00"),
        )
        .unwrap();

    let runtime = Arc::new(StubRuntime::default());
    let mut engine = engine(dir.path(), runtime.clone());
    engine.sync(at("2025-03-10 10:30:00")).unwrap();

    assert_eq!(engine.tick_at(at("2025-03-10 10:59:59")).await, 0);
    assert_eq!(engine.tick_at(at("2025-03-10 11:00:00")).await, 1);
    assert_eq!(engine.tick_at(at("2025-03-10 11:00:01")).await, 0);

    let stored = store.get(TaskType::Cleanup).unwrap().unwrap();
    assert_eq!(stored.id, job.id);
    assert_eq!(stored.history.len(), 1);
    assert_eq!(stored.history[0].status, RunStatus::Success);
    assert_eq!(stored.history[0].timestamp, at("2025-03-10 11:00:00"));
    assert_eq!(stored.last_run, Some(at("2025-03-10 11:00:00")));
    assert_eq!(stored.next_run, Some(at("2025-03-10 12:00:00")));
    assert_eq!(runtime.calls(), vec!["exec web rm -rf /data/cache/*"]);

    let status = StatusStore::new(dir.path().join("logs/scheduler/scheduler.status"))
        .load()
        .unwrap();
    let task = status.task(TaskType::Cleanup).unwrap();
    assert_eq!(task.status, Some(RunStatus::Success));
    assert_eq!(task.next_run, Some(at("2025-03-10 12:00:00")));
}

#[tokio::test]
async fn failing_backup_keeps_a_bounded_failure_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::for_project(dir.path());
    store
        .create_or_replace(
            JobTask::Backup(BackupParams::default()),
            Recurrence::Hourly { minute: 15 },
            "web",
            at("2025-03-10 00:00:00"),
        )
        .unwrap();

    let mut engine = engine(dir.path(), Arc::new(StubRuntime::failing()));
    engine.sync(at("2025-03-10 00:00:00")).unwrap();

    let mut now = at("2025-03-10 00:15:00");
    for _ in 0..35 {
        assert_eq!(engine.tick_at(now).await, 1);
        now += chrono::Duration::hours(1);
    }

    let job = store.get(TaskType::Backup).unwrap().unwrap();
    assert_eq!(job.history.len(), 30);
    assert!(job.history.iter().all(|h| h.status == RunStatus::Failed));
    assert!(job.history.iter().all(|h| h.error.is_some()));
    // newest last, oldest five dropped
    assert_eq!(job.history[0].timestamp, at("2025-03-10 05:15:00"));
    assert_eq!(job.history[29].timestamp, at("2025-03-11 10:15:00"));

    let status = StatusStore::new(dir.path().join("logs/scheduler/scheduler.status"))
        .load()
        .unwrap();
    let task = status.task(TaskType::Backup).unwrap();
    assert_eq!(task.status, Some(RunStatus::Failed));
    assert!(task.last_error.as_deref().unwrap_or_default().contains("No such container"));
}

#[tokio::test]
async fn auto_push_with_complete_registry_pushes_the_commit() {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::for_project(dir.path());
    store
        .document()
        .write(&json!({
            "image": {"registry": {
                "url": "registry.example.com",
                "username": "team",
                "password": "secret"
            }}
        }))
        .unwrap();
    store
        .create_or_replace(
            JobTask::Backup(BackupParams {
                cleanup: true,
                auto_push: true,
                image_name: Some("web-backup:nightly".into()),
            }),
            Recurrence::Daily { time: hhmm(3, 0) },
            "web",
            at("2025-03-10 00:00:00"),
        )
        .unwrap();

    let runtime = Arc::new(StubRuntime::default());
    let mut engine = engine(dir.path(), runtime.clone());
    engine.sync(at("2025-03-10 00:00:00")).unwrap();
    assert_eq!(engine.tick_at(at("2025-03-10 03:00:00")).await, 1);

    assert_eq!(
        runtime.calls(),
        vec![
            "exec web rm -rf /tmp/*",
            "exec web rm -rf /var/cache/*",
            "commit web web-backup:nightly",
            "push web-backup:nightly",
        ]
    );
    let job = store.get(TaskType::Backup).unwrap().unwrap();
    assert_eq!(job.history[0].status, RunStatus::Success);
}

#[tokio::test]
async fn auto_push_without_registry_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::for_project(dir.path());
    store
        .create_or_replace(
            JobTask::Backup(BackupParams {
                cleanup: false,
                auto_push: true,
                image_name: None,
            }),
            Recurrence::Daily { time: hhmm(3, 0) },
            "web",
            at("2025-03-10 00:00:00"),
        )
        .unwrap();

    let runtime = Arc::new(StubRuntime::default());
    let mut engine = engine(dir.path(), runtime.clone());
    engine.sync(at("2025-03-10 00:00:00")).unwrap();
    engine.tick_at(at("2025-03-10 03:00:00")).await;

    let job = store.get(TaskType::Backup).unwrap().unwrap();
    assert_eq!(job.history[0].status, RunStatus::Failed);
    assert!(job.history[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("image.registry.url"));
    // the commit itself still happened; only the push was refused
    assert_eq!(runtime.calls(), vec!["commit web web:20250310_030000"]);
}

fn backup_with_cleanup(dir: &Path) -> JobStore {
    let store = JobStore::for_project(dir);
    store
        .create_or_replace(
            JobTask::Backup(BackupParams {
                cleanup: true,
                auto_push: false,
                image_name: None,
            }),
            Recurrence::Daily { time: hhmm(3, 0) },
            "web",
            at("2025-03-10 00:00:00"),
        )
        .unwrap();
    store
}

#[tokio::test]
async fn failed_pre_backup_cleanup_still_commits() {
    let dir = tempfile::tempdir().unwrap();
    let store = backup_with_cleanup(dir.path());

    let runtime = Arc::new(StubRuntime {
        fail_exec: true,
        ..StubRuntime::default()
    });
    let mut engine = engine(dir.path(), runtime.clone());
    engine.sync(at("2025-03-10 00:00:00")).unwrap();
    assert_eq!(engine.tick_at(at("2025-03-10 03:00:00")).await, 1);

    assert_eq!(
        runtime.calls(),
        vec![
            "exec web rm -rf /tmp/*",
            "exec web rm -rf /var/cache/*",
            "commit web web:20250310_030000",
        ]
    );
    let job = store.get(TaskType::Backup).unwrap().unwrap();
    assert_eq!(job.history[0].status, RunStatus::Success);
}

#[tokio::test]
async fn stopped_container_is_backed_up_without_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let store = backup_with_cleanup(dir.path());

    let runtime = Arc::new(StubRuntime {
        stopped: true,
        ..StubRuntime::default()
    });
    let mut engine = engine(dir.path(), runtime.clone());
    engine.sync(at("2025-03-10 00:00:00")).unwrap();
    assert_eq!(engine.tick_at(at("2025-03-10 03:00:00")).await, 1);

    assert_eq!(runtime.calls(), vec!["commit web web:20250310_030000"]);
    let job = store.get(TaskType::Backup).unwrap().unwrap();
    assert_eq!(job.history[0].status, RunStatus::Success);
}

#[tokio::test]
async fn job_replaced_between_ticks_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::for_project(dir.path());
    store
        .create_or_replace(
            JobTask::Cleanup(CleanupParams::default()),
            Recurrence::Daily { time: hhmm(3, 0) },
            "web",
            at("2025-03-10 00:00:00"),
        )
        .unwrap();

    let runtime = Arc::new(StubRuntime::default());
    let mut engine = engine(dir.path(), runtime.clone());
    engine.sync(at("2025-03-10 00:00:00")).unwrap();

    // make sure the rewrite lands with a different mtime
    std::thread::sleep(Duration::from_millis(20));
    let replacement = store
        .create_or_replace(
            JobTask::Cleanup(CleanupParams::default()),
            Recurrence::Daily { time: hhmm(1, 0) },
            "web",
            at("2025-03-10 00:00:00"),
        )
        .unwrap();

    assert_eq!(engine.tick_at(at("2025-03-10 01:00:00")).await, 1);
    assert_eq!(engine.tick_at(at("2025-03-10 03:00:00")).await, 0);
    let job = store.get(TaskType::Cleanup).unwrap().unwrap();
    assert_eq!(job.id, replacement.id);
    assert_eq!(job.history.len(), 1);
}

#[tokio::test]
async fn run_now_trigger_executes_outside_the_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::for_project(dir.path());
    let job = store
        .create_or_replace(
            JobTask::Cleanup(CleanupParams::default()),
            Recurrence::Daily { time: hhmm(3, 0) },
            "web",
            at("2025-03-10 12:00:00"),
        )
        .unwrap();

    let mut engine = engine(dir.path(), Arc::new(StubRuntime::default()));
    engine.sync(at("2025-03-10 12:00:00")).unwrap();

    let trigger = dir.path().join("logs/scheduler/triggers/cleanup");
    std::fs::create_dir_all(trigger.parent().unwrap()).unwrap();
    std::fs::write(&trigger, &job.id).unwrap();

    assert_eq!(engine.tick_at(at("2025-03-10 12:00:05")).await, 1);
    assert!(!trigger.exists());
    // schedule unaffected
    assert_eq!(
        engine.checkpoint(TaskType::Cleanup),
        Some(at("2025-03-11 03:00:00"))
    );

    // a trigger for a stale id is consumed and ignored
    std::fs::write(&trigger, "cleanup_00000000").unwrap();
    assert_eq!(engine.tick_at(at("2025-03-10 12:00:06")).await, 0);
    assert!(!trigger.exists());
    assert_eq!(store.get(TaskType::Cleanup).unwrap().unwrap().history.len(), 1);
}

#[tokio::test]
async fn schedule_cleanup_round_trips_through_the_document() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SchedulerManager::new(dir.path(), SchedulerConfig::default());
    let recurrence = Recurrence::from_value(&json!("03:30")).unwrap();
    manager
        .schedule_cleanup(recurrence, vec!["/data/*".into()])
        .unwrap();

    let jobs = manager.list_jobs().unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[&TaskType::Cleanup];
    assert_eq!(job.recurrence, Recurrence::Daily { time: hhmm(3, 30) });
    assert_eq!(
        job.task,
        JobTask::Cleanup(CleanupParams {
            paths: vec!["/data/*".into()]
        })
    );
    assert!(job.history.is_empty());
}

#[tokio::test]
async fn daemon_body_holds_the_lock_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = DaemonSupervisor::new(dir.path(), SchedulerConfig::default());
    let (tx, rx) = watch::channel(false);

    let daemon = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor
                .run_until(Arc::new(StubRuntime::default()), rx)
                .await
        })
    };

    let mut up = false;
    for _ in 0..50 {
        if supervisor.is_running() {
            up = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(up, "daemon never took the lock");
    assert_eq!(
        supervisor.status_store().load().unwrap().status,
        DaemonState::Running
    );

    // a second daemon for the same project exits immediately
    let (_tx2, rx2) = watch::channel(false);
    supervisor
        .run_until(Arc::new(StubRuntime::default()), rx2)
        .await
        .unwrap();

    tx.send(true).unwrap();
    daemon.await.unwrap().unwrap();

    assert!(!supervisor.is_running());
    assert!(!supervisor.paths().pid_file.exists());
    let status = supervisor.status_store().load().unwrap();
    assert_eq!(status.status, DaemonState::Stopped);
    assert!(status.stop_time.is_some());
}
