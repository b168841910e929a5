//! `dockmaster-scheduler` — recurring backup and cleanup jobs for a
//! container project, executed by a single background daemon.
//!
//! # Overview
//!
//! Jobs live in the project document's `schedule` section (see
//! [`store::JobStore`]). The CLI edits them through
//! [`manager::SchedulerManager`]; the daemon ([`daemon::DaemonSupervisor`])
//! runs a [`engine::SchedulerEngine`] that ticks once per second, reloads the
//! table when the document changes and executes due jobs serially. The two
//! sides share nothing but files under `logs/scheduler/`.
//!
//! # Recurrence
//!
//! | Variant   | Fires                                       |
//! |-----------|---------------------------------------------|
//! | `daily`   | every day at HH:MM                          |
//! | `weekly`  | on one weekday at HH:MM                     |
//! | `monthly` | on one day of the month at HH:MM            |
//! | `hourly`  | every hour at a fixed minute                |
//!
//! All times are local wall-clock.

pub mod daemon;
pub mod engine;
pub mod error;
pub mod lock;
pub mod logs;
pub mod manager;
pub mod paths;
pub mod schedule;
pub mod status;
pub mod store;
pub mod tasks;
pub mod types;

pub use daemon::{DaemonCommand, DaemonSupervisor, StartOutcome, StopOutcome};
pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use manager::{SchedulerManager, StatusReport};
pub use schedule::Recurrence;
pub use status::{DaemonState, DaemonStatus, TaskStatus};
pub use types::{BackupParams, CleanupParams, HistoryEntry, Job, JobTask, RunStatus, TaskType};
