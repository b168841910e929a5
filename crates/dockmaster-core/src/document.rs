//! The project document: `<project_dir>/config.json`.
//!
//! Several processes read this file concurrently (the CLI and the scheduler
//! daemon), so every write replaces it atomically: the new content is written
//! to a sibling temp file, flushed, then renamed over the original. Readers see
//! either the old or the new document, never a truncated one. Writers
//! serialise on an exclusive flock of the sibling `config.json.lock`, held
//! from the read to the rename, so concurrent updates never drop each other.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{CoreError, Result};

/// File name of the project document inside a project directory.
pub const DOCUMENT_FILE: &str = "config.json";

/// Suffix of the writer lock next to the document.
const LOCK_SUFFIX: &str = "lock";

/// Read/write surface over the project's JSON document.
#[derive(Debug, Clone)]
pub struct ProjectDocument {
    path: PathBuf,
}

impl ProjectDocument {
    /// Document for the project rooted at `project_dir`.
    pub fn for_project(project_dir: &Path) -> Self {
        Self {
            path: project_dir.join(DOCUMENT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole document. A missing file reads as an empty object.
    pub fn read(&self) -> Result<Value> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(Value::Object(Map::new())),
            Ok(text) => serde_json::from_str(&text).map_err(|e| CoreError::Document {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Map::new())),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the document with `value`.
    pub fn write(&self, value: &Value) -> Result<()> {
        let _lock = self.lock()?;
        self.write_unlocked(value)
    }

    /// Read-modify-write. `f` receives the document as a JSON object.
    ///
    /// A document whose root is not an object is rejected rather than
    /// overwritten, so a hand-edited file is never silently destroyed.
    pub fn update<T>(&self, f: impl FnOnce(&mut Map<String, Value>) -> T) -> Result<T> {
        let _lock = self.lock()?;
        let mut doc = self.read()?;
        let obj = doc.as_object_mut().ok_or_else(|| CoreError::Document {
            path: self.path.display().to_string(),
            reason: "root is not a JSON object".to_string(),
        })?;
        let out = f(obj);
        self.write_unlocked(&doc)?;
        Ok(out)
    }

    fn write_unlocked(&self, value: &Value) -> Result<()> {
        let text = serde_json::to_string_pretty(value)?;
        write_atomic(&self.path, text.as_bytes())
    }

    /// Block until this process is the only writer. Released when the
    /// returned file is dropped.
    fn lock(&self) -> Result<File> {
        let mut name = self.path.clone().into_os_string();
        name.push(".");
        name.push(LOCK_SUFFIX);
        let lock_path = PathBuf::from(name);
        if let Some(dir) = lock_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    /// Fetch one top-level section, if present.
    pub fn section(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read()?.get(key).cloned())
    }

    /// Last modification time, `None` when the file does not exist.
    pub fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    /// Name of the container managed by this project.
    ///
    /// Resolution order: `container.name`, `project.name`, then the project
    /// directory's own name.
    pub fn container_name(&self) -> Result<String> {
        let doc = self.read()?;
        let pick = |section: &str| {
            doc.get(section)
                .and_then(|s| s.get("name"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        if let Some(name) = pick("container").or_else(|| pick("project")) {
            return Ok(name);
        }
        self.path
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| CoreError::Config("cannot infer container name".to_string()))
    }
}

/// Write `bytes` to `path` via temp-file-then-rename.
///
/// The temp file lives in the same directory so the rename never crosses a
/// filesystem boundary.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let tmp = dir.join(format!(".{file_name}.{}.tmp", std::process::id()));

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    debug!(path = %path.display(), bytes = bytes.len(), "atomic write complete");
    Ok(())
}
