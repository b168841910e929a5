//! The container runtime as seen by the scheduler: a handful of opaque
//! operations that job bodies invoke. The concrete implementation lives in
//! `dockmaster-docker`; tests substitute stubs.

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::RegistryCredentials;

/// Failures reported by a container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime binary could not be spawned.
    #[error("failed to spawn runtime command: {0}")]
    Spawn(String),

    /// The runtime ran but reported failure.
    #[error("`{command}` exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The operation exceeded its time budget.
    #[error("runtime operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The named container or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The container reached a state it will not recover from on its own.
    #[error("container {container} is {status}")]
    UnexpectedStatus { container: String, status: String },

    /// Credentials or settings needed for the operation are missing.
    #[error("incomplete registry configuration: missing {0}")]
    Registry(String),
}

/// A fully qualified image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Container operations needed by scheduled job bodies.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Current status string (`running`, `exited`, …) or `None` when the
    /// container does not exist.
    async fn container_status(&self, container: &str) -> Result<Option<String>, RuntimeError>;

    /// Poll until `container` reports `expected` or the runtime's startup
    /// budget elapses.
    async fn wait_for_status(&self, container: &str, expected: &str) -> Result<(), RuntimeError>;

    /// Run `command` through `sh -c` inside the container.
    async fn exec(&self, container: &str, command: &str) -> Result<(), RuntimeError>;

    /// Commit the container's filesystem to `image`.
    async fn commit(&self, container: &str, image: &ImageRef) -> Result<(), RuntimeError>;

    /// Push `image` to the registry described by `credentials`; returns the
    /// remote reference that was pushed.
    async fn push(
        &self,
        image: &ImageRef,
        credentials: &RegistryCredentials,
    ) -> Result<String, RuntimeError>;
}
