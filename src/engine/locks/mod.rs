//! Operation Lock System
//!
//! Prevents conflicting blocklist operations (check, download, delete) from
//! running at the same time. The in-memory slot covers one process; an
//! optional lock file under the data directory extends that to every
//! process working on the same directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use uuid::Uuid;

/// Operations serialized by the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Check,
    Download,
    Redownload,
    Delete,
    Recover,
}

impl OperationKind {
    pub fn description(&self) -> &'static str {
        match self {
            OperationKind::Check => "Checking for a newer blocklist",
            OperationKind::Download => "Downloading blocklist",
            OperationKind::Redownload => "Re-downloading blocklist",
            OperationKind::Delete => "Deleting local blocklist",
            OperationKind::Recover => "Recovering blocklist state",
        }
    }
}

/// Information about the operation holding the lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub id: Uuid,
    pub kind: OperationKind,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub description: String,
}

impl OperationInfo {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            pid: std::process::id(),
            started_at: Utc::now(),
            description: kind.description().to_string(),
        }
    }

    /// Check if the process that took the lock is still running
    pub fn is_process_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return true;
        }

        #[cfg(unix)]
        {
            std::process::Command::new("kill")
                .args(["-0", &self.pid.to_string()])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }

        #[cfg(windows)]
        {
            std::process::Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", self.pid)])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&self.pid.to_string()))
                .unwrap_or(false)
        }

        #[cfg(not(any(unix, windows)))]
        true
    }
}

struct Holder {
    info: OperationInfo,
    task: Option<tokio::task::Id>,
}

/// Operation lock.
///
/// Acquisition never waits: a second caller is refused while an operation
/// is in flight. Clones share the same slot and lock file.
#[derive(Clone, Default)]
pub struct OperationLock {
    slot: Arc<Mutex<Option<Holder>>>,
    lock_file: Option<PathBuf>,
}

impl OperationLock {
    /// A lock scoped to this process
    pub fn new() -> Self {
        Self::default()
    }

    /// A lock shared with every process using `lock_file`
    pub fn with_lock_file(lock_file: &Path) -> Self {
        Self {
            slot: Arc::default(),
            lock_file: Some(lock_file.to_path_buf()),
        }
    }

    pub fn lock_file(&self) -> Option<&Path> {
        self.lock_file.as_deref()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Holder>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to acquire the lock for `kind`
    pub fn try_acquire(&self, kind: OperationKind) -> Result<OperationGuard, LockError> {
        let mut slot = self.slot();
        let task = tokio::task::try_id();

        if let Some(holder) = slot.as_ref() {
            if task.is_some() && holder.task == task {
                // The holder is calling back into the coordinator.
                tracing::error!(
                    held = ?holder.info.kind,
                    requested = ?kind,
                    id = %holder.info.id,
                    "re-entrant blocklist operation"
                );
            }
            return Err(LockError::already_locked(&holder.info));
        }

        let info = OperationInfo::new(kind);
        if let Some(path) = &self.lock_file {
            create_lock_file(path, &info)?;
        }
        *slot = Some(Holder {
            info: info.clone(),
            task,
        });

        Ok(OperationGuard {
            slot: Arc::clone(&self.slot),
            lock_file: self.lock_file.clone(),
            info,
        })
    }

    /// The operation currently holding the lock, in this or another process
    pub fn active(&self) -> Option<OperationInfo> {
        if let Some(holder) = self.slot().as_ref() {
            return Some(holder.info.clone());
        }
        self.lock_file
            .as_deref()
            .and_then(read_lock_file)
            .filter(OperationInfo::is_process_alive)
    }

    pub fn is_locked(&self) -> bool {
        self.active().is_some()
    }
}

fn read_lock_file(path: &Path) -> Option<OperationInfo> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

/// Create the lock file exclusively, reclaiming it once if its owner is gone
fn create_lock_file(path: &Path, info: &OperationInfo) -> Result<(), LockError> {
    let io_error = |e: io::Error| LockError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let content = serde_json::to_string_pretty(info).map_err(|e| LockError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                if let Err(e) = file.write_all(content.as_bytes()) {
                    let _ = fs::remove_file(path);
                    return Err(io_error(e));
                }
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match read_lock_file(path) {
                    Some(existing) if existing.is_process_alive() => {
                        return Err(LockError::already_locked(&existing));
                    }
                    stale => {
                        tracing::warn!(
                            path = %path.display(),
                            pid = stale.map(|info| info.pid),
                            "removing stale blocklist lock file"
                        );
                        match fs::remove_file(path) {
                            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                                return Err(io_error(e))
                            }
                            _ => {}
                        }
                    }
                }
            }
            Err(e) => return Err(io_error(e)),
        }
    }

    // Another process won the race for the reclaimed file
    match read_lock_file(path) {
        Some(existing) => Err(LockError::already_locked(&existing)),
        None => Err(io_error(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "lock file keeps reappearing",
        ))),
    }
}

/// RAII guard that releases the lock on drop.
///
/// Dropping a cancelled future that owns the guard releases the lock too.
pub struct OperationGuard {
    slot: Arc<Mutex<Option<Holder>>>,
    lock_file: Option<PathBuf>,
    info: OperationInfo,
}

impl OperationGuard {
    pub fn info(&self) -> &OperationInfo {
        &self.info
    }

    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn kind(&self) -> OperationKind {
        self.info.kind
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|holder| holder.info.id) != Some(self.info.id) {
            return;
        }
        // File first, so a new holder never finds our file still in place
        if let Some(path) = &self.lock_file {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove lock file");
                }
            }
        }
        *slot = None;
    }
}

/// Lock errors
#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("{kind:?} operation {id} already in progress (PID {pid}): {description}")]
    AlreadyLocked {
        kind: OperationKind,
        id: Uuid,
        pid: u32,
        description: String,
    },

    #[error("lock file {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
}

impl LockError {
    fn already_locked(info: &OperationInfo) -> Self {
        LockError::AlreadyLocked {
            kind: info.kind,
            id: info.id,
            pid: info.pid,
            description: info.description.clone(),
        }
    }
}
