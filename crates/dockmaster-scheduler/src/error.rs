use dockmaster_core::CoreError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid recurrence spec, unsupported task type or malformed time string.
    /// Raised synchronously to the administrating caller; no job is created.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The daemon could not be started, signalled or observed.
    #[error("Process control error: {0}")]
    ProcessControl(String),

    /// A job body failed. Always caught at the loop boundary and recorded.
    #[error("{task} job failed: {reason}")]
    JobExecution { task: String, reason: String },

    /// Reading or writing the job document, status file or logs failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// No job with the given ID exists.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// Another live process holds the daemon lock.
    #[error("Scheduler daemon already running (pid {pid})")]
    AlreadyRunning { pid: i32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CoreError> for SchedulerError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Config(msg) => SchedulerError::Configuration(msg),
            other => SchedulerError::Persistence(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

pub(crate) fn config_err(msg: impl Into<String>) -> SchedulerError {
    SchedulerError::Configuration(msg.into())
}
