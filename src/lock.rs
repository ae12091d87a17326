use crate::errors::{EngineError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A holder older than this is presumed crashed even if its pid is alive.
const STALE_AFTER: Duration = Duration::from_secs(30 * 60);
/// Backoff cap and retry budget: ~10 s cumulative.
const MAX_ATTEMPTS: u32 = 200;
const BACKOFF_STEP_MS: u64 = 50;
const BACKOFF_CAP_MS: u64 = 1000;
/// A lock held longer than this is forcibly broken by the self-watchdog.
const WATCHDOG: Duration = Duration::from_secs(5 * 60);

/// On-disk lock payload. This format is shared with the peer runtime —
/// field names and pretty-printing are part of the contract.
#[derive(Serialize, Deserialize)]
struct LockPayload {
    pid: u32,
    #[serde(rename = "createdAt")]
    created_at: String,
}

type WatchdogMap = Arc<Mutex<HashMap<PathBuf, tokio::task::JoinHandle<()>>>>;

/// Process-scoped lock manager. Owns the watchdog table for every lock this
/// process currently holds.
#[derive(Clone, Default)]
pub struct Locks {
    watchdogs: WatchdogMap,
}

/// A successfully acquired lock. Releasing (or dropping) removes the lock
/// file and cancels the watchdog.
pub struct LockGuard {
    lock_path: Option<PathBuf>,
    watchdogs: WatchdogMap,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".lock");
    PathBuf::from(s)
}

pub fn is_locked(path: &Path) -> bool {
    lock_path_for(path).exists()
}

impl Locks {
    pub fn new() -> Self {
        Locks::default()
    }

    /// Acquire the cooperative exclusive lock for `path`.
    ///
    /// Create-exclusive on `<path>.lock`; on conflict a stale holder (old
    /// mtime, dead pid, or garbled payload) is swept and the attempt
    /// retried, a live holder backs us off. Fails with `LockUnavailable`
    /// after the retry budget is exhausted.
    pub async fn acquire(&self, path: &Path) -> Result<LockGuard> {
        self.acquire_with_attempts(path, MAX_ATTEMPTS).await
    }

    async fn acquire_with_attempts(&self, path: &Path, max_attempts: u32) -> Result<LockGuard> {
        let lock_path = lock_path_for(path);
        let mut attempt: u32 = 0;

        while attempt < max_attempts {
            match try_create(&lock_path) {
                Ok(()) => {
                    let handle = spawn_watchdog(lock_path.clone());
                    if let Ok(mut map) = self.watchdogs.lock() {
                        if let Some(old) = map.insert(lock_path.clone(), handle) {
                            old.abort();
                        }
                    }
                    return Ok(LockGuard {
                        lock_path: Some(lock_path),
                        watchdogs: Arc::clone(&self.watchdogs),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if holder_is_stale(&lock_path) {
                        // Races with other sweepers are fine; whoever wins
                        // the subsequent create-exclusive owns the lock.
                        let _ = std::fs::remove_file(&lock_path);
                        attempt += 1;
                        continue;
                    }
                    let backoff =
                        BACKOFF_CAP_MS.min(BACKOFF_STEP_MS * (u64::from(attempt) + 1));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::LockUnavailable(path.to_path_buf()))
    }

    /// Abort the watchdog for a path without touching the lock file.
    /// Used when the watchdog itself already broke the lock.
    fn cancel_watchdog(watchdogs: &WatchdogMap, lock_path: &Path) {
        if let Ok(mut map) = watchdogs.lock() {
            if let Some(handle) = map.remove(lock_path) {
                handle.abort();
            }
        }
    }
}

impl LockGuard {
    /// Cancel the watchdog and remove the lock file, best-effort.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(lock_path) = self.lock_path.take() else {
            return;
        };
        Locks::cancel_watchdog(&self.watchdogs, &lock_path);
        let _ = std::fs::remove_file(&lock_path);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn try_create(lock_path: &Path) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    let payload = LockPayload {
        pid: std::process::id(),
        created_at: Utc::now().to_rfc3339(),
    };
    let body = serde_json::to_string_pretty(&payload).unwrap_or_default();
    file.write_all(body.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn holder_is_stale(lock_path: &Path) -> bool {
    if let Ok(meta) = std::fs::metadata(lock_path) {
        if let Ok(modified) = meta.modified() {
            if let Ok(age) = modified.elapsed() {
                if age > STALE_AFTER {
                    return true;
                }
            }
        }
    }

    let Ok(content) = std::fs::read_to_string(lock_path) else {
        // Vanished between stat and read — treat as sweepable.
        return true;
    };
    match serde_json::from_str::<LockPayload>(&content) {
        Ok(payload) => !pid_alive(payload.pid),
        Err(_) => true,
    }
}

/// Signal-0 existence probe. EPERM means the process exists but belongs to
/// another user, which still counts as alive.
fn pid_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn spawn_watchdog(lock_path: PathBuf) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(WATCHDOG).await;
        eprintln!(
            "[brainsurgeon] lock watchdog: {} held over {}s, breaking it",
            lock_path.display(),
            WATCHDOG.as_secs()
        );
        let _ = std::fs::remove_file(&lock_path);
    })
}
