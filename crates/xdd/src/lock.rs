//! Artifact-root lock: at most one writer per artifact directory.
//!
//! The lock is a regular file `<root>/.lock`. Mutual exclusion comes from an
//! OS advisory exclusive lock on the open descriptor; the JSON metadata
//! record inside the file (holder pid, hostname, interface, acquisition time)
//! is diagnostic input for stale-holder detection, not the source of truth.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;

use crate::Reporter;

pub const LOCK_FILE: &str = ".lock";

/// Grace period before a busy lock file with unreadable metadata may be
/// assessed for staleness. A concurrent acquirer holds the advisory lock
/// briefly before its metadata write lands; within this window the file is
/// treated as live.
pub const METADATA_GRACE: Duration = Duration::from_secs(1);

/// Which surface is holding the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockInterface {
    Cli,
    Web,
}

impl std::fmt::Display for LockInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockInterface::Cli => f.write_str("cli"),
            LockInterface::Web => f.write_str("web"),
        }
    }
}

/// Metadata record stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder.
    pub pid: u32,
    /// Hostname where the lock was acquired.
    pub hostname: String,
    /// Surface that acquired the lock.
    pub interface: LockInterface,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// Tunables for stale-holder detection.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// A holder older than this is stale regardless of liveness.
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "artifact root is locked by pid {pid} on {hostname} via {interface} (held for {age_secs}s)"
    )]
    Held {
        pid: u32,
        hostname: String,
        interface: LockInterface,
        age_secs: i64,
    },
    #[error("lock file {} is busy and its holder metadata is not readable yet", path.display())]
    Busy { path: PathBuf },
    #[error("failed to {action} {}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(action: &'static str, path: &Path, source: std::io::Error) -> LockError {
    LockError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Lock file path for an artifact root.
pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

/// Read the lock metadata record, if the file exists and parses.
pub fn read_lock_info(root: &Path) -> Result<Option<LockInfo>, LockError> {
    let path = lock_path(root);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err("read lock file", &path, e)),
    };
    Ok(serde_json::from_str(&content).ok())
}

/// Unconditionally delete the lock file. Operator escape hatch, distinct from
/// normal release; its use is always logged.
pub fn force_release(root: &Path, reporter: &mut dyn Reporter) -> Result<(), LockError> {
    let path = lock_path(root);
    match read_lock_info(root)? {
        Some(info) => reporter.warn(&format!(
            "force-releasing lock held by pid {} on {} via {} since {}",
            info.pid, info.hostname, info.interface, info.acquired_at
        )),
        None => reporter.warn(&format!("force-releasing lock file {}", path.display())),
    }
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err("remove lock file", &path, e)),
    }
}

fn process_exists(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    sys.process(target).is_some()
}

enum Assessment {
    /// Holder is dead or too old; the file may be removed.
    Stale(Option<LockInfo>),
    /// A live, fresh holder.
    Live(LockInfo),
    /// Metadata not readable and the file is too young to judge.
    Unreadable,
}

/// Handle for a held artifact-root lock. Released on drop (best effort), or
/// explicitly via [`RootLock::release`].
#[derive(Debug)]
pub struct RootLock {
    path: PathBuf,
    file: Option<File>,
}

impl RootLock {
    /// Acquire the lock for `root`, creating the directory if needed.
    ///
    /// On contention the holder metadata is assessed: a dead or expired
    /// holder is taken over (the file is removed and the full protocol is
    /// re-run exactly once); a live fresh holder yields [`LockError::Held`].
    pub fn acquire(
        root: &Path,
        interface: LockInterface,
        opts: &LockOptions,
        reporter: &mut dyn Reporter,
    ) -> Result<Self, LockError> {
        fs::create_dir_all(root).map_err(|e| io_err("create artifact root", root, e))?;
        let path = lock_path(root);

        let mut stole = false;
        loop {
            if let Some(lock) = Self::try_acquire(&path, interface)? {
                return Ok(lock);
            }

            match assess(&path, opts)? {
                Assessment::Stale(info) => {
                    if stole {
                        // Someone else won the race after our takeover; report
                        // whatever identity is visible.
                        return Err(held_error(&path, info));
                    }
                    match &info {
                        Some(i) => reporter.warn(&format!(
                            "taking over stale lock from pid {} on {} (acquired {})",
                            i.pid, i.hostname, i.acquired_at
                        )),
                        None => reporter.warn(&format!(
                            "taking over stale lock {} with unreadable metadata",
                            path.display()
                        )),
                    }
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err("remove stale lock file", &path, e)),
                    }
                    stole = true;
                }
                Assessment::Live(info) => return Err(held_error(&path, Some(info))),
                Assessment::Unreadable => return Err(LockError::Busy { path }),
            }
        }
    }

    /// One shot of the acquisition protocol: open, advisory-lock, then write
    /// the metadata record. Returns `None` when the advisory lock is busy.
    fn try_acquire(path: &Path, interface: LockInterface) -> Result<Option<Self>, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_err("open lock file", path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(io_err("lock lock file", path, e)),
        }

        // The advisory lock is held; the metadata is diagnostics for other
        // processes doing stale detection.
        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            interface,
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&info).expect("lock metadata serializes");
        file.set_len(0)
            .map_err(|e| io_err("truncate lock file", path, e))?;
        write_all_at_start(&file, json.as_bytes())
            .map_err(|e| io_err("write lock file", path, e))?;
        file.sync_all()
            .map_err(|e| io_err("sync lock file", path, e))?;

        Ok(Some(Self {
            path: path.to_path_buf(),
            file: Some(file),
        }))
    }

    /// Release the lock: drop the descriptor (which releases the advisory
    /// lock) and remove the file. Idempotent.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.file.take().is_none() {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("remove lock file", &self.path, e)),
        }
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        // Best effort; an explicit release surfaces errors.
        let _ = self.release();
    }
}

fn write_all_at_start(mut file: &File, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Seek;
    file.rewind()?;
    file.write_all(bytes)
}

fn held_error(path: &Path, info: Option<LockInfo>) -> LockError {
    match info {
        Some(info) => LockError::Held {
            pid: info.pid,
            hostname: info.hostname,
            interface: info.interface,
            age_secs: (Utc::now() - info.acquired_at).num_seconds(),
        },
        None => LockError::Busy {
            path: path.to_path_buf(),
        },
    }
}

/// Stale-detection ladder, run only after the advisory lock was found busy:
/// unreadable metadata gets a grace period keyed off the file mtime, a dead
/// recorded holder on this host is stale, and any holder past `stale_after`
/// is stale.
fn assess(path: &Path, opts: &LockOptions) -> Result<Assessment, LockError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        // Holder vanished between our lock attempt and this read.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Assessment::Stale(None)),
        Err(e) => return Err(io_err("read lock file", path, e)),
    };

    match serde_json::from_str::<LockInfo>(&content) {
        Ok(info) => {
            let local_host = gethostname::gethostname().to_string_lossy().to_string();
            if info.hostname == local_host && !process_exists(info.pid) {
                return Ok(Assessment::Stale(Some(info)));
            }
            let age = Utc::now() - info.acquired_at;
            if age.num_seconds() >= 0 && age.to_std().unwrap_or_default() > opts.stale_after {
                return Ok(Assessment::Stale(Some(info)));
            }
            Ok(Assessment::Live(info))
        }
        Err(_) => {
            let mtime = fs::metadata(path)
                .and_then(|m| m.modified())
                .map_err(|e| io_err("stat lock file", path, e))?;
            let age = SystemTime::now()
                .duration_since(mtime)
                .unwrap_or_default();
            if age < METADATA_GRACE {
                Ok(Assessment::Unreadable)
            } else if age > opts.stale_after {
                Ok(Assessment::Stale(None))
            } else {
                // Malformed but not clearly abandoned; do not steal.
                Ok(Assessment::Unreadable)
            }
        }
    }
}
