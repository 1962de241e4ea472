//! Rate limiting using a persisted token bucket
//!
//! Each invocation is a fresh process, so the bucket lives in a small
//! `field:value` file under the state directory. Every check is a
//! lock-protected read-modify-write followed by an atomic rename, so
//! concurrent invocations never lose or double-spend a token.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{GuardError, Result};
use crate::storage::{
    self, Fields, ensure_private_dir, epoch_secs, remove_if_exists, write_private_atomic,
};

const BUCKET_FILE: &str = "rate_limit";
const BUCKET_LOCK: &str = "rate_limit.lock";

/// Token bucket state as stored on disk
#[derive(Debug, Clone, Copy, PartialEq)]
struct TokenBucket {
    tokens: f64,
    last_refill_at: f64,
}

impl TokenBucket {
    fn full(burst_limit: u32, now: f64) -> Self {
        Self {
            tokens: f64::from(burst_limit),
            last_refill_at: now,
        }
    }

    fn from_fields(fields: &Fields) -> Option<Self> {
        let tokens: f64 = fields.parse_field("tokens")?;
        let last_refill_at: f64 = fields.parse_field("last_refill_at")?;
        (tokens.is_finite() && last_refill_at.is_finite()).then_some(Self {
            tokens,
            last_refill_at,
        })
    }

    fn to_fields(self) -> Fields {
        Fields::new()
            .with("tokens", self.tokens)
            .with("last_refill_at", self.last_refill_at)
    }

    /// Accrue `rate_limit / 60` tokens per elapsed second, capped at the
    /// burst size. A clock that moved backwards accrues nothing.
    fn refill(&mut self, now: f64, rate_limit: u32, burst_limit: u32) {
        let elapsed = (now - self.last_refill_at).max(0.0);
        let burst = f64::from(burst_limit);
        self.tokens = (self.tokens + elapsed * f64::from(rate_limit) / 60.0).clamp(0.0, burst);
        self.last_refill_at = now;
    }

    fn try_consume(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Persisted token-bucket admission gate
pub struct RateLimiter {
    state_file: PathBuf,
    lock_dir: PathBuf,
    state_dir: PathBuf,
    rate_limit: u32,
    burst_limit: u32,
    lock_timeout: Duration,
}

impl RateLimiter {
    /// Create a limiter storing its bucket under `state_dir`.
    ///
    /// `rate_limit` is in requests per minute; 0 disables limiting.
    #[must_use]
    pub fn new(state_dir: &Path, rate_limit: u32, burst_limit: u32, lock_timeout: Duration) -> Self {
        Self {
            state_file: state_dir.join(BUCKET_FILE),
            lock_dir: state_dir.join(BUCKET_LOCK),
            state_dir: state_dir.to_path_buf(),
            rate_limit,
            burst_limit,
            lock_timeout,
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.rate_limit > 0
    }

    #[must_use]
    pub const fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    #[must_use]
    pub const fn burst_limit(&self) -> u32 {
        self.burst_limit
    }

    /// Suggested wait after a rejection: one token's refill time.
    #[must_use]
    pub fn retry_after_secs(&self) -> f64 {
        if self.rate_limit == 0 {
            0.0
        } else {
            60.0 / f64::from(self.rate_limit)
        }
    }

    /// Consume one token if available.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::RateLimited`] when the bucket is empty.
    pub fn check(&self) -> Result<()> {
        self.check_at(epoch_secs())
    }

    /// [`check`](Self::check) with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::RateLimited`] when the bucket is empty.
    pub fn check_at(&self, now: f64) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        match self.consume_at(now) {
            Ok(true) => Ok(()),
            Ok(false) => Err(GuardError::RateLimited {
                retry_after_secs: self.retry_after_secs(),
            }),
            // Lock timeout or unreadable state admits the request
            Err(e) => {
                warn!(error = %e, "Rate limiter state unavailable, admitting request");
                Ok(())
            }
        }
    }

    /// Boolean form of [`check`](Self::check).
    #[must_use]
    pub fn admit(&self) -> bool {
        self.check().is_ok()
    }

    /// Boolean form of [`check_at`](Self::check_at).
    #[must_use]
    pub fn admit_at(&self, now: f64) -> bool {
        self.check_at(now).is_ok()
    }

    fn consume_at(&self, now: f64) -> Result<bool> {
        ensure_private_dir(&self.state_dir)?;
        let _guard = storage::lock::acquire(&self.lock_dir, self.lock_timeout)?;

        let mut bucket = self.load(now)?;
        bucket.refill(now, self.rate_limit, self.burst_limit);
        let admitted = bucket.try_consume();
        write_private_atomic(&self.state_file, bucket.to_fields().render().as_bytes())?;

        debug!(admitted, tokens_left = bucket.tokens, "Rate limiter checked");
        Ok(admitted)
    }

    fn load(&self, now: f64) -> Result<TokenBucket> {
        let bucket = Fields::read(&self.state_file)?
            .as_ref()
            .and_then(TokenBucket::from_fields);
        Ok(bucket.unwrap_or_else(|| TokenBucket::full(self.burst_limit, now)))
    }

    /// Tokens currently available, refilled to `now` but not persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file exists but cannot be read.
    pub fn available_tokens_at(&self, now: f64) -> Result<f64> {
        let mut bucket = self.load(now)?;
        bucket.refill(now, self.rate_limit, self.burst_limit);
        Ok(bucket.tokens)
    }

    /// Administrative reset: the next check starts from a full bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or the state file cannot
    /// be removed.
    pub fn reset(&self) -> Result<()> {
        if !self.state_dir.exists() {
            return Ok(());
        }
        let _guard = storage::lock::acquire(&self.lock_dir, self.lock_timeout)?;
        remove_if_exists(&self.state_file)
    }
}
