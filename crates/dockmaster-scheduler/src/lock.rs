//! Singleton enforcement for the scheduler daemon.
//!
//! The PID file doubles as an advisory `flock` held for the daemon's whole
//! lifetime. The kernel drops the lock when the process dies, however it
//! dies, so a left-over file with no lock holder is always safe to reclaim.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};

/// Result of probing the PID record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// No PID record exists.
    NotRunning,
    /// A live daemon holds the record. The PID is unknown only while a
    /// starting daemon has taken the lock but not yet written its PID.
    Running(Option<i32>),
    /// The record was left behind by a dead process and has been removed.
    Stale(Option<i32>),
}

impl Liveness {
    pub fn is_running(&self) -> bool {
        matches!(self, Liveness::Running(_))
    }
}

/// Outcome of a signal-0 probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalProbe {
    Alive,
    /// ESRCH: no such process.
    Dead,
    /// EPERM: the process exists but belongs to someone else, or the pid was
    /// recycled by another user's process.
    Denied,
}

/// Exclusive ownership of the daemon PID file. Released on drop.
#[derive(Debug)]
pub struct ProcessLock {
    file: File,
    path: PathBuf,
    pid: i32,
}

impl ProcessLock {
    /// Take the lock and record this process's PID, or fail with
    /// [`SchedulerError::AlreadyRunning`] when a live daemon holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // A dying holder may unlink the file between our open and our flock;
        // retry until the locked inode is the one at `path`.
        for _ in 0..3 {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;

            if let Err(e) = file.try_lock_exclusive() {
                if e.kind() == io::ErrorKind::WouldBlock || is_lock_contended(&e) {
                    let pid = read_pid(path).ok().flatten().unwrap_or(0);
                    return Err(SchedulerError::AlreadyRunning { pid });
                }
                return Err(e.into());
            }

            if !same_file(&file, path) {
                debug!(path = %path.display(), "pid file replaced while locking, retrying");
                continue;
            }

            let pid = std::process::id() as i32;
            let mut file = file;
            file.set_len(0)?;
            writeln!(file, "{pid}")?;
            file.sync_all()?;
            info!(pid, path = %path.display(), "scheduler lock acquired");
            return Ok(Self {
                file,
                path: path.to_path_buf(),
                pid,
            });
        }
        Err(SchedulerError::ProcessControl(format!(
            "could not lock {}",
            path.display()
        )))
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        // Unlink while still holding the lock so no other process can lock
        // this inode and then lose its file.
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to remove pid file: {e}");
            }
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// Read the PID recorded at `path`. `Ok(None)` when the file exists but holds
/// no valid PID.
pub fn read_pid(path: &Path) -> io::Result<Option<i32>> {
    let mut text = String::new();
    File::open(path)?.read_to_string(&mut text)?;
    Ok(text.trim().parse::<i32>().ok().filter(|pid| *pid > 0))
}

/// Check for a process without signalling it.
#[cfg(unix)]
pub fn signal_probe(pid: i32) -> SignalProbe {
    // Safety: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return SignalProbe::Alive;
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::EPERM) => SignalProbe::Denied,
        _ => SignalProbe::Dead,
    }
}

/// Send `signal` to `pid`. A process that is already gone is not an error.
#[cfg(unix)]
pub fn send_signal(pid: i32, signal: libc::c_int) -> Result<()> {
    // Safety: plain kill(2); the pid comes from our own PID file.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(SchedulerError::ProcessControl(format!(
        "failed to signal pid {pid}: {err}"
    )))
}

/// Determine whether a daemon owns `path`, clearing stale records.
///
/// Policy:
/// - no file: not running
/// - signal 0 succeeds: running
/// - ESRCH, or no readable PID: stale unless the lock is still held
/// - EPERM: the lock decides (held: running, free: stale)
pub fn probe(path: &Path) -> Liveness {
    let pid = match read_pid(path) {
        Ok(pid) => pid,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Liveness::NotRunning,
        Err(e) => {
            // Unreadable (likely another user's file): assume it is live.
            debug!(path = %path.display(), "pid file unreadable: {e}");
            return Liveness::Running(None);
        }
    };

    match pid.map(signal_probe) {
        Some(SignalProbe::Alive) => Liveness::Running(pid),
        Some(SignalProbe::Dead) | Some(SignalProbe::Denied) | None => {
            if reclaim_if_free(path) {
                info!(path = %path.display(), ?pid, "removed stale scheduler pid file");
                Liveness::Stale(pid)
            } else {
                Liveness::Running(pid)
            }
        }
    }
}

/// Remove `path` if nobody holds its lock. Returns `true` when the record is
/// gone afterwards.
pub fn reclaim_if_free(path: &Path) -> bool {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
        Err(_) => return false,
    };
    if file.try_lock_exclusive().is_err() {
        return false;
    }
    let removed = match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => e.kind() == io::ErrorKind::NotFound,
    };
    let _ = FileExt::unlock(&file);
    removed
}

fn is_lock_contended(e: &io::Error) -> bool {
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}
