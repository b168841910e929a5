//! Job bodies: what a backup or cleanup actually does to the container.

use chrono::NaiveDateTime;
use dockmaster_core::{ContainerRuntime, ImageRef, RegistryCredentials, RuntimeError};

use crate::{
    error::{Result, SchedulerError},
    logs::RunLog,
    types::{BackupParams, CleanupParams, Job, JobTask, DEFAULT_CLEANUP_PATHS},
};

const BACKUP_TAG_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Inputs a job body needs besides its own parameters.
pub struct TaskContext<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    /// Resolved from the project document at run time.
    pub credentials: RegistryCredentials,
    pub started: NaiveDateTime,
}

/// Execute `job` once. Every failure comes back as an error for the caller
/// to record; nothing here retries.
pub async fn run_task(job: &Job, ctx: &TaskContext<'_>, log: &mut RunLog<'_>) -> Result<()> {
    match &job.task {
        JobTask::Backup(params) => backup(&job.container_name, params, ctx, log).await,
        JobTask::Cleanup(params) => cleanup(&job.container_name, params, ctx, log).await,
    }
}

async fn backup(
    container: &str,
    params: &BackupParams,
    ctx: &TaskContext<'_>,
    log: &mut RunLog<'_>,
) -> Result<()> {
    log.info(format!("backup of {container} started"));
    // Any state can be committed; only a missing container stops the backup.
    let state = ctx
        .runtime
        .container_status(container)
        .await
        .map_err(|e| failed("backup", e))?
        .ok_or_else(|| failed("backup", RuntimeError::NotFound(container.to_string())))?;

    if params.cleanup {
        if state == "running" {
            let paths: Vec<String> =
                DEFAULT_CLEANUP_PATHS.iter().map(|s| s.to_string()).collect();
            if let Err(reason) = remove_paths(container, &paths, ctx, log).await {
                log.warn(format!("{reason}, saving the image anyway"));
            }
        } else {
            log.warn(format!("{container} is {state}, skipping pre-backup cleanup"));
        }
    }

    let image = backup_image(params.image_name.as_deref(), container, ctx.started);
    log.info(format!("committing {container} to {image}"));
    ctx.runtime
        .commit(container, &image)
        .await
        .map_err(|e| failed("backup", e))?;
    log.info(format!("image {image} created"));

    if params.auto_push {
        if !ctx.credentials.is_complete() {
            let missing = ctx.credentials.missing().join(", ");
            return Err(failed("backup", RuntimeError::Registry(missing)));
        }
        let remote = ctx
            .runtime
            .push(&image, &ctx.credentials)
            .await
            .map_err(|e| failed("backup", e))?;
        log.info(format!("pushed {remote}"));
    }
    Ok(())
}

async fn cleanup(
    container: &str,
    params: &CleanupParams,
    ctx: &TaskContext<'_>,
    log: &mut RunLog<'_>,
) -> Result<()> {
    log.info(format!("cleanup of {container} started"));
    ctx.runtime
        .wait_for_status(container, "running")
        .await
        .map_err(|e| failed("cleanup", e))?;
    remove_paths(container, &params.paths, ctx, log)
        .await
        .map_err(|reason| SchedulerError::JobExecution {
            task: "cleanup".into(),
            reason,
        })
}

/// `rm -rf` every path, continuing past failures; the error lists the paths
/// that could not be removed.
async fn remove_paths(
    container: &str,
    paths: &[String],
    ctx: &TaskContext<'_>,
    log: &mut RunLog<'_>,
) -> std::result::Result<(), String> {
    let mut failed_paths = Vec::new();
    for path in paths {
        match ctx.runtime.exec(container, &format!("rm -rf {path}")).await {
            Ok(()) => log.info(format!("removed {path}")),
            Err(e) => {
                log.error(format!("failed to remove {path}: {e}"));
                failed_paths.push(path.as_str());
            }
        }
    }
    if failed_paths.is_empty() {
        Ok(())
    } else {
        Err(format!("failed to remove {}", failed_paths.join(", ")))
    }
}

/// Image reference for a backup.
///
/// `override_name` is `repo:tag` or a bare `repo`; otherwise the container
/// name is the repository. The tag defaults to the run's start time.
pub fn backup_image(override_name: Option<&str>, container: &str, started: NaiveDateTime) -> ImageRef {
    let default_tag = started.format(BACKUP_TAG_FORMAT).to_string();
    match override_name.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => match name.rsplit_once(':') {
            // a colon inside the registry host (host:port/repo) is not a tag
            Some((repo, tag)) if !tag.contains('/') && !repo.is_empty() && !tag.is_empty() => {
                ImageRef::new(repo, tag)
            }
            _ => ImageRef::new(name, default_tag),
        },
        None => ImageRef::new(container, default_tag),
    }
}

fn failed(task: &str, e: RuntimeError) -> SchedulerError {
    SchedulerError::JobExecution {
        task: task.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TIMESTAMP_FORMAT;

    fn started() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2025-03-10 03:00:05", TIMESTAMP_FORMAT).unwrap()
    }

    #[test]
    fn default_image_uses_container_and_timestamp() {
        assert_eq!(
            backup_image(None, "web", started()),
            ImageRef::new("web", "20250310_030005")
        );
    }

    #[test]
    fn override_with_and_without_tag() {
        assert_eq!(
            backup_image(Some("archive/web:nightly"), "web", started()),
            ImageRef::new("archive/web", "nightly")
        );
        assert_eq!(
            backup_image(Some("archive/web"), "web", started()),
            ImageRef::new("archive/web", "20250310_030005")
        );
        assert_eq!(
            backup_image(Some("localhost:5000/web"), "web", started()),
            ImageRef::new("localhost:5000/web", "20250310_030005")
        );
        assert_eq!(
            backup_image(Some("  "), "web", started()),
            ImageRef::new("web", "20250310_030005")
        );
    }
}
