//! Advisory file lock over the shared filesystem.
//!
//! Exclusive-create (`O_CREAT | O_EXCL`) is the only primitive the NAS is
//! trusted to provide, so the lock is a marker file whose body records the
//! holder and acquisition time. A holder that crashes leaves the file behind;
//! contenders reclaim it once it is older than `stale_after`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::LockError;

/// Base sleep between contention retries; a random jitter of the same size
/// is added so two contenders do not retry in lockstep.
const RETRY_SLEEP_MS: u64 = 50;

/// Body of the lock marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    timestamp: DateTime<Utc>,
}

/// Held lock. Dropping it removes the marker file; prefer `release()` so
/// removal failures are observable.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Remove the marker file.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Acquire the lock at `path`.
///
/// On contention the holder's `timestamp` is checked: a lock older than
/// `stale_after` is presumed abandoned and removed, and the reclaim attempt
/// does not count against `retries`. Live contention sleeps with jitter and
/// retries up to `retries` times before failing.
pub async fn acquire(
    path: &Path,
    holder: &str,
    stale_after: Duration,
    retries: u32,
) -> Result<LockGuard, LockError> {
    let mut attempts: u32 = 0;
    loop {
        match try_create(path, holder).await? {
            Some(guard) => return Ok(guard),
            None => {
                if let Some(info) = read_holder(path).await
                    && lock_age(path, &info).await >= stale_after
                {
                    tracing::warn!(
                        lock = %path.display(),
                        holder = %info.holder,
                        "reclaiming stale lock"
                    );
                    remove_quietly(path).await;
                    // Reclaim retries the same slot.
                    continue;
                }

                attempts += 1;
                if attempts > retries {
                    let holder = read_holder(path)
                        .await
                        .map(|i| i.holder)
                        .unwrap_or_else(|| "unknown".to_string());
                    return Err(LockError::Contended {
                        path: path.to_path_buf(),
                        holder,
                        attempts,
                    });
                }
                let jitter = rand::thread_rng().gen_range(0..RETRY_SLEEP_MS);
                tokio::time::sleep(Duration::from_millis(RETRY_SLEEP_MS + jitter)).await;
            }
        }
    }
}

/// One exclusive-create attempt. `Ok(None)` means the lock is held.
async fn try_create(path: &Path, holder: &str) -> Result<Option<LockGuard>, LockError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| LockError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(_file) => {
            let info = LockInfo {
                holder: holder.to_string(),
                timestamp: Utc::now(),
            };
            let body = serde_json::to_vec(&info).unwrap_or_default();
            fs::write(path, body).await.map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            Ok(Some(LockGuard {
                path: path.to_path_buf(),
                released: false,
            }))
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(LockError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

async fn read_holder(path: &Path) -> Option<LockInfo> {
    let body = fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&body).ok()
}

/// Age of the lock, from its recorded timestamp when parseable, otherwise
/// from file mtime (covers a holder that crashed mid-write).
async fn lock_age(path: &Path, info: &LockInfo) -> Duration {
    let from_record = Utc::now()
        .signed_duration_since(info.timestamp)
        .to_std()
        .ok();
    if let Some(age) = from_record {
        return age;
    }
    match fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified.elapsed().unwrap_or(Duration::ZERO),
        Err(_) => Duration::MAX,
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        tracing::warn!(lock = %path.display(), error = %e, "failed to remove stale lock");
    }
}
