use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use dockmaster_core::{
    config::DockerConfig, ContainerRuntime, ImageRef, RegistryCredentials, RuntimeError,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::truncate::{summarize, DEFAULT_MAX_CHARS};

/// Container statuses a container does not leave without intervention.
const TERMINAL_STATUSES: [&str; 2] = ["exited", "dead"];

/// [`ContainerRuntime`] implemented by shelling out to `docker`.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    command_timeout: Duration,
    startup_timeout: Duration,
    poll_interval: Duration,
}

impl DockerCli {
    pub fn new(config: &DockerConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs.max(1)),
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run `docker <args>` and fail on a non-zero exit. Returns trimmed stdout.
    async fn run(&self, args: &[String], stdin: Option<&str>) -> Result<String, RuntimeError> {
        let output = self.output(args, stdin).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        Err(RuntimeError::CommandFailed {
            command: self.describe(args),
            code: output.status.code().unwrap_or(-1),
            stderr: summarize(&output.stderr, DEFAULT_MAX_CHARS),
        })
    }

    /// Spawn `docker <args>` and race it against the command timeout.
    async fn output(&self, args: &[String], stdin: Option<&str>) -> Result<Output, RuntimeError> {
        debug!(command = %self.describe(args), "docker");

        let mut child = AsyncCommand::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("{}: {e}", self.binary)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| RuntimeError::Spawn(format!("writing stdin: {e}")))?;
            // dropping the pipe closes it so the child sees EOF
        }

        // `wait_with_output` consumes the child, so it runs on its own task
        // and the PID is kept for the SIGKILL on timeout.
        let pid = child.id();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(child.wait_with_output().await);
        });

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(RuntimeError::Spawn(format!("waiting for docker: {e}"))),
            Ok(Err(_)) => Err(RuntimeError::Spawn("docker wait task panicked".to_string())),
            Err(_elapsed) => {
                if let Some(raw_pid) = pid {
                    // Safety: raw_pid is our direct child, still running.
                    #[cfg(unix)]
                    unsafe {
                        libc::kill(raw_pid as libc::pid_t, libc::SIGKILL);
                    }
                }
                warn!(command = %self.describe(args), "docker command timed out, killed");
                Err(RuntimeError::Timeout {
                    ms: self.command_timeout.as_millis() as u64,
                })
            }
        }
    }

    fn describe(&self, args: &[String]) -> String {
        // never echo a password; login reads it from stdin anyway
        format!("{} {}", self.binary, args.first().map(String::as_str).unwrap_or(""))
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn container_status(&self, container: &str) -> Result<Option<String>, RuntimeError> {
        match self.run(&inspect_status_args(container), None).await {
            Ok(status) => Ok(Some(status)),
            Err(RuntimeError::CommandFailed { stderr, .. }) if stderr.contains("No such") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_status(&self, container: &str, expected: &str) -> Result<(), RuntimeError> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            match self.container_status(container).await? {
                Some(status) if status == expected => return Ok(()),
                Some(status) if TERMINAL_STATUSES.contains(&status.as_str()) => {
                    return Err(RuntimeError::UnexpectedStatus {
                        container: container.to_string(),
                        status,
                    })
                }
                Some(status) => debug!(container, %status, expected, "waiting for container"),
                None => return Err(RuntimeError::NotFound(container.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RuntimeError::Timeout {
                    ms: self.startup_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn exec(&self, container: &str, command: &str) -> Result<(), RuntimeError> {
        self.run(&exec_args(container, command), None).await?;
        Ok(())
    }

    async fn commit(&self, container: &str, image: &ImageRef) -> Result<(), RuntimeError> {
        self.run(&commit_args(container, image), None).await?;
        info!(container, image = %image, "container committed");
        Ok(())
    }

    async fn push(
        &self,
        image: &ImageRef,
        credentials: &RegistryCredentials,
    ) -> Result<String, RuntimeError> {
        let (Some(url), Some(username), Some(password)) = (
            credentials.url.as_deref(),
            credentials.username.as_deref(),
            credentials.password.as_deref(),
        ) else {
            return Err(RuntimeError::Registry(credentials.missing().join(", ")));
        };

        self.run(&login_args(url, username), Some(password)).await?;
        let remote = remote_ref(image, url, credentials.namespace.as_deref());
        self.run(&["tag".into(), image.to_string(), remote.clone()], None)
            .await?;
        self.run(&["push".into(), remote.clone()], None).await?;
        info!(image = %image, %remote, "image pushed");
        Ok(remote)
    }
}

fn inspect_status_args(container: &str) -> Vec<String> {
    vec![
        "inspect".into(),
        "--format".into(),
        "{{.State.Status}}".into(),
        container.into(),
    ]
}

fn exec_args(container: &str, command: &str) -> Vec<String> {
    vec![
        "exec".into(),
        container.into(),
        "sh".into(),
        "-c".into(),
        command.into(),
    ]
}

fn commit_args(container: &str, image: &ImageRef) -> Vec<String> {
    vec!["commit".into(), container.into(), image.to_string()]
}

fn login_args(url: &str, username: &str) -> Vec<String> {
    vec![
        "login".into(),
        registry_host(url).into(),
        "--username".into(),
        username.into(),
        "--password-stdin".into(),
    ]
}

/// `host[/namespace]/name:tag`, where `name` is the last path segment of the
/// local repository.
fn remote_ref(image: &ImageRef, url: &str, namespace: Option<&str>) -> String {
    let name = image
        .repository
        .rsplit('/')
        .next()
        .unwrap_or(&image.repository);
    let host = registry_host(url);
    match namespace.map(|n| n.trim_matches('/')).filter(|n| !n.is_empty()) {
        Some(ns) => format!("{host}/{ns}/{name}:{}", image.tag),
        None => format!("{host}/{name}:{}", image.tag),
    }
}

fn registry_host(url: &str) -> &str {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
}
