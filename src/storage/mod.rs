//! On-disk primitives shared by the cache, the token bucket and the breaker
//!
//! Every invocation is a separate process, so all shared state lives in small
//! files under private directories. Writers always hold a [`lock`] and
//! replace files with [`atomic::write_private_atomic`].

pub mod atomic;
pub mod fields;
pub mod lock;

pub use atomic::{ensure_private_dir, remove_if_exists, write_private_atomic};
pub use fields::Fields;
pub use lock::{DEFAULT_LOCK_TIMEOUT, LockGuard, LockOwner, STALE_AFTER};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the Unix epoch.
#[must_use]
pub fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
