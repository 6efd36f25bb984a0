//! Single-writer lock for log files.
//!
//! A writable log at `notes.jsonl` is claimed by creating `notes.jsonl.lock`
//! exclusively and writing the owner's PID into it. Only the owner may
//! truncate or append. A claim left by a process that no longer exists is
//! taken over; a live owner is waited on for a bounded number of attempts.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// How long to wait for a live writer to release a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetry {
    pub attempts: u32,
    pub wait: Duration,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            attempts: 20,
            wait: Duration::from_millis(50),
        }
    }
}

impl LockRetry {
    /// Fail at once if the log is already claimed.
    pub const NONE: LockRetry = LockRetry {
        attempts: 0,
        wait: Duration::ZERO,
    };
}

/// Exclusive write access to one log. The claim is released on drop.
#[derive(Debug)]
pub struct WriterLock {
    lock_path: PathBuf,
}

enum Claim {
    Taken(WriterLock),
    HeldBy(Option<u32>),
}

impl WriterLock {
    /// Claim `log_path` for writing.
    pub fn acquire(log_path: &Path, retry: LockRetry) -> Result<Self> {
        let lock_path = lock_path_for(log_path);
        let mut holder = None;
        for attempt in 0..=retry.attempts {
            match claim(&lock_path)? {
                Claim::Taken(lock) => return Ok(lock),
                Claim::HeldBy(Some(pid)) if !is_process_alive(pid) => {
                    tracing::warn!(log = %log_path.display(), pid, "taking over log left by dead writer");
                    // Only remove the claim we judged stale; another process may have replaced it.
                    if holder_pid(&lock_path) == Some(pid) {
                        let _ = fs::remove_file(&lock_path);
                    }
                }
                Claim::HeldBy(pid) => {
                    holder = pid;
                    if attempt < retry.attempts {
                        thread::sleep(retry.wait);
                    }
                }
            }
        }
        match holder {
            Some(pid) => anyhow::bail!(
                "Log {} is already open for writing by process {pid}",
                log_path.display()
            ),
            None => anyhow::bail!("Log {} is already open for writing", log_path.display()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn claim(lock_path: &Path) -> Result<Claim> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(lock_path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Ok(Claim::HeldBy(holder_pid(lock_path)))
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to create lock file: {}", lock_path.display()))
        }
    };
    // The lock owns the file from here, so a failed write does not leave it behind.
    let lock = WriterLock {
        lock_path: lock_path.to_path_buf(),
    };
    writeln!(file, "{}", std::process::id())
        .with_context(|| format!("Failed to write PID to lock file: {}", lock_path.display()))?;
    Ok(Claim::Taken(lock))
}

/// Lock file path guarding `log_path`.
pub fn lock_path_for(log_path: &Path) -> PathBuf {
    let mut name = log_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    log_path.with_file_name(name)
}

/// PID of the process currently writing `log_path`, if any claim exists.
pub fn writer_of(log_path: &Path) -> Option<u32> {
    holder_pid(&lock_path_for(log_path))
}

/// Whether `log_path` is claimed by a process that no longer exists.
pub fn is_stale(log_path: &Path) -> bool {
    writer_of(log_path).is_some_and(|pid| !is_process_alive(pid))
}

fn holder_pid(lock_path: &Path) -> Option<u32> {
    fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // kill(pid, 0) probes for existence without delivering a signal
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}
