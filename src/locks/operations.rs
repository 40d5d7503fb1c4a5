//! Lock acquisition with stale-holder reclaim.

use super::guard::LockGuard;
use super::metadata::LockMetadata;
use crate::error::{DroverError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Acquire the singleton lock at `lock_path`.
///
/// If the file exists and its holder pid is dead (or the file is unreadable
/// garbage), it is removed and acquisition is retried once. A live holder
/// yields `DroverError::LockError` (exit code 4).
pub fn acquire_instance_lock(lock_path: &Path, action: &str) -> Result<LockGuard> {
    let metadata = LockMetadata::new(action);
    match try_create(lock_path, &metadata)? {
        Some(guard) => Ok(guard),
        None => {
            match LockMetadata::from_file(lock_path) {
                Ok(existing) if !existing.is_stale() => {
                    return Err(DroverError::LockError(format!(
                        "another drover instance is running\nLock: {} (pid {}, owner {}, started {} ago)",
                        lock_path.display(),
                        existing.pid,
                        existing.owner,
                        existing.age_string()
                    )));
                }
                Ok(existing) => {
                    info!(path = %lock_path.display(), pid = existing.pid, "reclaiming stale instance lock");
                }
                Err(e) => {
                    warn!(path = %lock_path.display(), error = %e, "reclaiming unreadable instance lock");
                }
            }

            fs::remove_file(lock_path).map_err(|e| {
                DroverError::LockError(format!(
                    "failed to remove stale lock '{}': {}",
                    lock_path.display(),
                    e
                ))
            })?;

            try_create(lock_path, &metadata)?.ok_or_else(|| {
                DroverError::LockError(format!(
                    "lock '{}' was taken by another process while reclaiming it",
                    lock_path.display()
                ))
            })
        }
    }
}

/// Read the current holder of the lock, if any.
pub fn read_instance_lock(lock_path: &Path) -> Option<LockMetadata> {
    LockMetadata::from_file(lock_path).ok()
}

/// Create the lock file exclusively. `Ok(None)` means it already exists.
fn try_create(lock_path: &Path, metadata: &LockMetadata) -> Result<Option<LockGuard>> {
    if let Some(parent) = lock_path.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|e| {
            DroverError::UserError(format!(
                "failed to create state directory '{}': {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => {
            return Err(DroverError::LockError(format!(
                "failed to acquire lock '{}': {}",
                lock_path.display(),
                e
            )));
        }
    };

    let json = metadata.to_json()?;
    file.write_all(json.as_bytes()).map_err(|e| {
        let _ = fs::remove_file(lock_path);
        DroverError::LockError(format!("failed to write lock metadata: {}", e))
    })?;

    file.sync_all().map_err(|e| {
        let _ = fs::remove_file(lock_path);
        DroverError::LockError(format!("failed to sync lock file: {}", e))
    })?;

    Ok(Some(LockGuard::new(lock_path.to_path_buf())))
}
