//! Cross-process mutual exclusion with lock directories
//!
//! `mkdir` is atomic on every filesystem we target, so a lock is simply a
//! directory next to the resource it protects. The directory holds an
//! `owner` record (`pid`, `acquired_at`, `token`).
//!
//! Staleness heuristic (a waiter may forcibly reclaim a lock when either holds):
//! - the recorded `pid` is no longer a live process, or
//! - the lock is older than [`STALE_AFTER`] (measured from `acquired_at`,
//!   or from the directory mtime when the owner record was never written).
//!
//! Reclamation renames the lock to a tombstone first and checks that the
//! tombstone carries the owner that was judged stale; if a new owner slipped
//! in between, the lock is put back and the waiter keeps waiting.
//!
//! Release only removes the directory when the owner record still carries
//! the guard's own token, so a release arriving after a timeout-and-reclaim
//! cycle never destroys the next owner's lock.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::atomic::write_private_atomic;
use super::epoch_secs;
use super::fields::Fields;
use crate::error::{GuardError, Result};

/// Age after which any lock is considered abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// Default bound on how long a waiter blocks before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const BASE_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_millis(500);
const OWNER_FILE: &str = "owner";

/// Who holds a lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockOwner {
    pub pid: u32,
    pub acquired_at: f64,
    pub token: String,
}

impl LockOwner {
    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("pid", self.pid)
            .with("acquired_at", format!("{:.3}", self.acquired_at))
            .with("token", &self.token)
    }

    fn from_fields(fields: &Fields) -> Option<Self> {
        Some(Self {
            pid: fields.parse_field("pid")?,
            acquired_at: fields.parse_field("acquired_at")?,
            token: fields.get("token")?.to_string(),
        })
    }

    /// Read the owner record of a lock directory.
    #[must_use]
    pub fn read(lock_dir: &Path) -> Option<Self> {
        Fields::read(&lock_dir.join(OWNER_FILE))
            .ok()
            .flatten()
            .as_ref()
            .and_then(Self::from_fields)
    }
}

/// Why a lock was judged reclaimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StaleReason {
    OwnerDead,
    TooOld,
}

enum Observation {
    Vanished,
    Held,
    Stale {
        owner: Option<LockOwner>,
        reason: StaleReason,
    },
}

/// Acquire the lock directory at `lock_dir`, waiting up to `timeout`.
///
/// The wait backs off from 50ms, growing with the time already spent
/// waiting and capped at 500ms.
///
/// # Errors
///
/// Returns [`GuardError::LockTimeout`] when the lock could not be taken in
/// time, or an I/O error when the lock directory cannot be created at all
/// (for example a missing parent directory).
pub fn acquire(lock_dir: &Path, timeout: Duration) -> Result<LockGuard> {
    let start = Instant::now();
    let token = format!("{:016x}", rand::random::<u64>());

    loop {
        match std::fs::create_dir(lock_dir) {
            Ok(()) => {
                let owner = LockOwner {
                    pid: std::process::id(),
                    acquired_at: epoch_secs(),
                    token,
                };
                if let Err(e) = write_private_atomic(
                    &lock_dir.join(OWNER_FILE),
                    owner.to_fields().render().as_bytes(),
                ) {
                    let _ = std::fs::remove_dir_all(lock_dir);
                    return Err(e);
                }
                debug!(lock = %lock_dir.display(), waited_ms = start.elapsed().as_millis(), "Lock acquired");
                return Ok(LockGuard {
                    path: lock_dir.to_path_buf(),
                    token: owner.token,
                    released: false,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        match observe(lock_dir) {
            Observation::Vanished => continue,
            Observation::Stale { owner, reason } => {
                if reclaim(lock_dir, owner.as_ref(), reason) {
                    continue;
                }
            }
            Observation::Held => {}
        }

        let waited = start.elapsed();
        if waited >= timeout {
            return Err(GuardError::LockTimeout {
                resource: lock_dir.display().to_string(),
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            });
        }
        std::thread::sleep(backoff_for(waited).min(timeout - waited));
    }
}

/// Backoff grows by one base step per second already waited.
fn backoff_for(waited: Duration) -> Duration {
    let steps = u32::try_from(waited.as_secs()).unwrap_or(u32::MAX).saturating_add(1);
    BASE_BACKOFF.saturating_mul(steps).min(MAX_BACKOFF)
}

fn observe(lock_dir: &Path) -> Observation {
    let owner = LockOwner::read(lock_dir);
    let now = epoch_secs();

    let age = match &owner {
        Some(owner) => {
            if !process_alive(owner.pid) {
                return Observation::Stale {
                    owner: Some(owner.clone()),
                    reason: StaleReason::OwnerDead,
                };
            }
            now - owner.acquired_at
        }
        None => {
            let Ok(metadata) = std::fs::metadata(lock_dir) else {
                return Observation::Vanished;
            };
            metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map_or(0.0, |d| d.as_secs_f64())
        }
    };

    if age > STALE_AFTER.as_secs_f64() {
        Observation::Stale {
            owner,
            reason: StaleReason::TooOld,
        }
    } else {
        Observation::Held
    }
}

/// Forcibly remove a stale lock. Returns `true` when the caller should retry
/// acquisition immediately.
fn reclaim(lock_dir: &Path, judged: Option<&LockOwner>, reason: StaleReason) -> bool {
    let name = lock_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("lock");
    let tombstone = lock_dir.with_file_name(format!(
        ".{name}.stale.{}.{:08x}",
        std::process::id(),
        rand::random::<u32>()
    ));

    if std::fs::rename(lock_dir, &tombstone).is_err() {
        // Somebody else reclaimed or released it first.
        return true;
    }

    let moved = LockOwner::read(&tombstone);
    if moved.as_ref().map(|o| &o.token) != judged.map(|o| &o.token) {
        // A new owner took the lock between inspection and rename.
        if std::fs::rename(&tombstone, lock_dir).is_err() {
            warn!(
                lock = %lock_dir.display(),
                "Displaced a fresh lock during stale reclamation"
            );
            let _ = std::fs::remove_dir_all(&tombstone);
        }
        return false;
    }

    if let Err(e) = std::fs::remove_dir_all(&tombstone) {
        warn!(path = %tombstone.display(), error = %e, "Failed to remove reclaimed lock");
    }
    warn!(
        lock = %lock_dir.display(),
        owner_pid = judged.map(|o| o.pid),
        reason = ?reason,
        "Reclaimed stale lock"
    );
    true
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap probe; rely on the age ceiling alone.
    true
}

/// RAII guard for a held lock directory. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Path of the lock directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing any error instead of logging it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock directory could not be removed.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        match LockOwner::read(&self.path) {
            Some(owner) if owner.token == self.token => match std::fs::remove_dir_all(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            Some(owner) => {
                warn!(
                    lock = %self.path.display(),
                    current_pid = owner.pid,
                    "Lock was reclaimed by another owner, leaving it in place"
                );
                Ok(())
            }
            None => {
                debug!(lock = %self.path.display(), "Lock already released");
                Ok(())
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(lock = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}
