//! dockmaster-docker — the container runtime used by scheduled jobs, backed
//! by the `docker` command-line client.
//!
//! Every operation is a single `docker` invocation (or a short sequence for
//! registry pushes) raced against a timeout; a child that overruns is
//! SIGKILLed.
//!
//! ```rust,no_run
//! use dockmaster_core::{config::DockerConfig, ContainerRuntime};
//! use dockmaster_docker::DockerCli;
//!
//! #[tokio::main]
//! async fn main() {
//!     let docker = DockerCli::new(&DockerConfig::default());
//!     let status = docker.container_status("web").await.unwrap();
//!     println!("{status:?}");
//! }
//! ```

pub mod cli;
pub mod truncate;

pub use cli::DockerCli;
