//! `dockmaster-core` — pieces shared by every dockmaster crate: tool settings,
//! the project document, registry credentials and the container runtime
//! interface consumed by scheduled jobs.

pub mod config;
pub mod document;
pub mod error;
pub mod registry;
pub mod runtime;

pub use config::DockmasterConfig;
pub use document::ProjectDocument;
pub use error::{CoreError, Result};
pub use registry::RegistryCredentials;
pub use runtime::{ContainerRuntime, ImageRef, RuntimeError};
