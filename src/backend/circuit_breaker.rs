//! Per-failure-kind circuit breaker with persisted state
//!
//! Each [`FailureKind`] has its own small state file under the state
//! directory; all of them share one lock so a transition is a single
//! lock-protected read-modify-write.
//!
//! ```text
//! closed --(threshold failures)--> open --(cooldown elapsed)--> half_open
//!   ^                                ^                              |
//!   |                                +-------(probe fails)----------+
//!   +--------------------------(probe succeeds)---------------------+
//! ```
//!
//! While half-open exactly one probe call is admitted. Other processes fail
//! fast until the probe reports back, or until the probe is older than the
//! probe timeout, at which point it is presumed lost and a new probe is
//! admitted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{GuardError, Result};
use crate::storage::{
    self, Fields, ensure_private_dir, epoch_secs, remove_if_exists, write_private_atomic,
};

const BREAKER_LOCK: &str = "breaker.lock";

/// Breaker taxonomy of backend failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimit,
    Backend,
}

impl FailureKind {
    pub const ALL: [Self; 3] = [Self::Timeout, Self::RateLimit, Self::Backend];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Backend => "backend_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerRecord {
    pub kind: FailureKind,
    pub state: BreakerState,
    pub error_count: u32,
    pub last_error_at: Option<f64>,
    pub opened_at: Option<f64>,
    pub probe_started_at: Option<f64>,
}

impl BreakerRecord {
    const fn closed(kind: FailureKind) -> Self {
        Self {
            kind,
            state: BreakerState::Closed,
            error_count: 0,
            last_error_at: None,
            opened_at: None,
            probe_started_at: None,
        }
    }

    fn from_fields(kind: FailureKind, fields: &Fields) -> Self {
        let Some(state) = fields.get("state").and_then(BreakerState::parse) else {
            return Self::closed(kind);
        };
        let record = Self {
            kind,
            state,
            error_count: fields.parse_field("error_count").unwrap_or(0),
            last_error_at: fields.parse_field("last_error_at"),
            opened_at: fields.parse_field("opened_at"),
            probe_started_at: fields.parse_field("probe_started_at"),
        };
        // An open record without `opened_at`, or a half-open one without
        // `probe_started_at`, could never cool down; reset it to closed.
        match (record.state, record.opened_at, record.probe_started_at) {
            (BreakerState::Open, None, _) | (BreakerState::HalfOpen, _, None) => Self::closed(kind),
            _ => record,
        }
    }

    fn to_fields(&self) -> Fields {
        let mut fields = Fields::new()
            .with("state", self.state)
            .with("error_count", self.error_count);
        for (name, value) in [
            ("last_error_at", self.last_error_at),
            ("opened_at", self.opened_at),
            ("probe_started_at", self.probe_started_at),
        ] {
            if let Some(value) = value {
                fields.set(name, value);
            }
        }
        fields
    }
}

/// Thresholds and windows for every breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open a breaker
    pub threshold: u32,
    /// How long an open breaker rejects calls
    pub cooldown: Duration,
    /// How long a half-open probe may stay unanswered
    pub probe_timeout: Duration,
    pub lock_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(30),
            lock_timeout: storage::DEFAULT_LOCK_TIMEOUT,
        }
    }
}

enum Decision {
    Allow,
    Probe(BreakerRecord),
    Block { retry_in_secs: u64 },
}

#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn secs_until(deadline: f64, now: f64) -> u64 {
    (deadline - now).max(0.0).ceil() as u64
}

/// Circuit breakers for every [`FailureKind`]
pub struct CircuitBreaker {
    state_dir: PathBuf,
    lock_dir: PathBuf,
    config: BreakerConfig,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(state_dir: &Path, config: BreakerConfig) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            lock_dir: state_dir.join(BREAKER_LOCK),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn state_file(&self, kind: FailureKind) -> PathBuf {
        self.state_dir.join(format!("breaker_{kind}"))
    }

    fn load(&self, kind: FailureKind) -> Result<BreakerRecord> {
        Ok(Fields::read(&self.state_file(kind))?
            .map_or_else(|| BreakerRecord::closed(kind), |f| BreakerRecord::from_fields(kind, &f)))
    }

    fn save(&self, record: &BreakerRecord) -> Result<()> {
        if record.state == BreakerState::Closed && record.error_count == 0 {
            return remove_if_exists(&self.state_file(record.kind));
        }
        write_private_atomic(
            &self.state_file(record.kind),
            record.to_fields().render().as_bytes(),
        )
    }

    fn lock(&self) -> Result<storage::LockGuard> {
        ensure_private_dir(&self.state_dir)?;
        storage::lock::acquire(&self.lock_dir, self.config.lock_timeout)
    }

    fn decide(&self, mut record: BreakerRecord, now: f64) -> Decision {
        match record.state {
            BreakerState::Closed => Decision::Allow,
            BreakerState::Open => {
                let reopen_at = record.opened_at.unwrap_or(now) + self.config.cooldown.as_secs_f64();
                if now >= reopen_at {
                    record.state = BreakerState::HalfOpen;
                    record.probe_started_at = Some(now);
                    Decision::Probe(record)
                } else {
                    Decision::Block {
                        retry_in_secs: secs_until(reopen_at, now),
                    }
                }
            }
            BreakerState::HalfOpen => {
                let probe_deadline =
                    record.probe_started_at.unwrap_or(now) + self.config.probe_timeout.as_secs_f64();
                if now >= probe_deadline {
                    record.probe_started_at = Some(now);
                    Decision::Probe(record)
                } else {
                    Decision::Block {
                        retry_in_secs: secs_until(probe_deadline, now).max(1),
                    }
                }
            }
        }
    }

    /// Fail fast if the breaker for `kind` is open.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::CircuitOpen`] while the breaker rejects calls.
    pub fn check(&self, kind: FailureKind) -> Result<()> {
        self.check_kinds_at(&[kind], epoch_secs())
    }

    /// Fail fast if any breaker is open. Used before every backend attempt.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::CircuitOpen`] for the first rejecting breaker.
    pub fn check_all(&self) -> Result<()> {
        self.check_all_at(epoch_secs())
    }

    /// [`check_all`](Self::check_all) with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::CircuitOpen`] for the first rejecting breaker.
    pub fn check_all_at(&self, now: f64) -> Result<()> {
        self.check_kinds_at(&FailureKind::ALL, now)
    }

    /// Evaluate several breakers atomically: either every one admits the
    /// call (and any due half-open transitions are recorded) or nothing
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::CircuitOpen`] for the first rejecting breaker.
    pub fn check_kinds_at(&self, kinds: &[FailureKind], now: f64) -> Result<()> {
        let _guard = match self.lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "Circuit breaker state unavailable, admitting call");
                return Ok(());
            }
        };

        let mut probes = Vec::new();
        for &kind in kinds {
            let record = match self.load(kind) {
                Ok(record) => record,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Unreadable breaker state, treating as closed");
                    continue;
                }
            };
            match self.decide(record, now) {
                Decision::Allow => {}
                Decision::Probe(record) => probes.push(record),
                Decision::Block { retry_in_secs } => {
                    return Err(GuardError::CircuitOpen {
                        kind,
                        retry_in_secs,
                    });
                }
            }
        }

        for record in probes {
            info!(kind = %record.kind, "Circuit breaker half-open, admitting probe");
            if let Err(e) = self.save(&record) {
                warn!(kind = %record.kind, error = %e, "Failed to persist half-open state");
            }
        }
        Ok(())
    }

    /// Record a failed attempt and return the resulting state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be locked, read or written.
    pub fn record_failure(&self, kind: FailureKind) -> Result<BreakerState> {
        self.record_failure_at(kind, epoch_secs())
    }

    /// [`record_failure`](Self::record_failure) with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be locked, read or written.
    pub fn record_failure_at(&self, kind: FailureKind, now: f64) -> Result<BreakerState> {
        let _guard = self.lock()?;
        let mut record = self.load(kind)?;

        record.error_count = record.error_count.saturating_add(1);
        record.last_error_at = Some(now);

        match record.state {
            BreakerState::HalfOpen => {
                record.state = BreakerState::Open;
                record.opened_at = Some(now);
                record.probe_started_at = None;
                warn!(kind = %kind, "Probe failed, circuit breaker reopened");
            }
            BreakerState::Closed if record.error_count >= self.config.threshold => {
                record.state = BreakerState::Open;
                record.opened_at = Some(now);
                warn!(
                    kind = %kind,
                    failures = record.error_count,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Circuit breaker opened"
                );
            }
            BreakerState::Closed | BreakerState::Open => {}
        }

        self.save(&record)?;
        Ok(record.state)
    }

    /// Record a successful call: every breaker closes and its counters reset.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be locked or cleared.
    pub fn record_success(&self) -> Result<()> {
        if !self.state_dir.exists() {
            return Ok(());
        }
        let _guard = self.lock()?;
        for kind in FailureKind::ALL {
            let record = self.load(kind)?;
            if record.state != BreakerState::Closed {
                info!(kind = %kind, "Circuit breaker closed");
            }
            if record != BreakerRecord::closed(kind) {
                remove_if_exists(&self.state_file(kind))?;
            }
        }
        Ok(())
    }

    /// Current state of every breaker.
    ///
    /// # Errors
    ///
    /// Returns an error if a state file exists but cannot be read.
    pub fn snapshot(&self) -> Result<Vec<BreakerRecord>> {
        FailureKind::ALL.iter().map(|&kind| self.load(kind)).collect()
    }

    /// Administrative reset: delete all breaker state.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or a file cannot be removed.
    pub fn reset(&self) -> Result<()> {
        if !self.state_dir.exists() {
            return Ok(());
        }
        let _guard = self.lock()?;
        for kind in FailureKind::ALL {
            remove_if_exists(&self.state_file(kind))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: f64 = 1_700_000_000.0;

    fn breaker(dir: &Path) -> CircuitBreaker {
        CircuitBreaker::new(dir, BreakerConfig::default())
    }

    fn open_after_failures(breaker: &CircuitBreaker, kind: FailureKind, now: f64) {
        for _ in 0..5 {
            breaker.record_failure_at(kind, now).unwrap();
        }
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
        assert_eq!(FailureKind::RateLimit.to_string(), "rate_limit");
        assert_eq!(FailureKind::Backend.to_string(), "backend_error");
    }

    #[test]
    fn test_closed_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        assert!(breaker.check_all_at(T0).is_ok());
        assert!(
            breaker
                .snapshot()
                .unwrap()
                .iter()
                .all(|r| r.state == BreakerState::Closed)
        );
    }

    #[test]
    fn test_opens_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        for i in 1..5 {
            assert_eq!(
                breaker.record_failure_at(FailureKind::Timeout, T0).unwrap(),
                BreakerState::Closed,
                "failure {i}"
            );
        }
        assert_eq!(
            breaker.record_failure_at(FailureKind::Timeout, T0).unwrap(),
            BreakerState::Open
        );

        match breaker.check_all_at(T0 + 10.0) {
            Err(GuardError::CircuitOpen {
                kind,
                retry_in_secs,
            }) => {
                assert_eq!(kind, FailureKind::Timeout);
                assert_eq!(retry_in_secs, 290);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_kinds_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        open_after_failures(&breaker, FailureKind::RateLimit, T0);

        assert!(breaker.check_kinds_at(&[FailureKind::Timeout], T0).is_ok());
        assert!(breaker.check_kinds_at(&[FailureKind::RateLimit], T0).is_err());
        // Any open kind blocks the combined check
        assert!(breaker.check_all_at(T0).is_err());
    }

    #[test]
    fn test_mixed_failures_do_not_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        for kind in [FailureKind::Timeout, FailureKind::Backend] {
            for _ in 0..4 {
                breaker.record_failure_at(kind, T0).unwrap();
            }
        }
        assert!(breaker.check_all_at(T0).is_ok());
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        open_after_failures(&breaker, FailureKind::Backend, T0);

        let after_cooldown = T0 + 300.0;
        assert!(breaker.check_all_at(after_cooldown).is_ok());
        let backend = &breaker.snapshot().unwrap()[2];
        assert_eq!(backend.state, BreakerState::HalfOpen);
        assert_eq!(backend.probe_started_at, Some(after_cooldown));

        // A second caller while the probe is in flight fails fast
        assert!(matches!(
            breaker.check_all_at(after_cooldown + 1.0),
            Err(GuardError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_probe_success_closes() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        open_after_failures(&breaker, FailureKind::Backend, T0);
        assert!(breaker.check_all_at(T0 + 300.0).is_ok());

        breaker.record_success().unwrap();
        let snapshot = breaker.snapshot().unwrap();
        assert!(snapshot.iter().all(|r| *r == BreakerRecord::closed(r.kind)));
        assert!(breaker.check_all_at(T0 + 301.0).is_ok());
    }

    #[test]
    fn test_probe_failure_reopens_for_full_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        open_after_failures(&breaker, FailureKind::Backend, T0);
        assert!(breaker.check_all_at(T0 + 300.0).is_ok());

        assert_eq!(
            breaker.record_failure_at(FailureKind::Backend, T0 + 305.0).unwrap(),
            BreakerState::Open
        );
        assert!(breaker.check_all_at(T0 + 310.0).is_err());
        assert!(breaker.check_all_at(T0 + 605.0).is_ok());
    }

    #[test]
    fn test_lost_probe_is_replaced_after_probe_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        open_after_failures(&breaker, FailureKind::Timeout, T0);
        assert!(breaker.check_all_at(T0 + 300.0).is_ok());
        assert!(breaker.check_all_at(T0 + 310.0).is_err());
        assert!(breaker.check_all_at(T0 + 330.0).is_ok());
    }

    #[test]
    fn test_blocked_check_does_not_start_other_probes() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        open_after_failures(&breaker, FailureKind::Timeout, T0);
        open_after_failures(&breaker, FailureKind::Backend, T0 + 100.0);

        // Timeout is due for a probe, Backend is still open
        assert!(breaker.check_all_at(T0 + 300.0).is_err());
        assert_eq!(breaker.snapshot().unwrap()[0].state, BreakerState::Open);
    }

    #[test]
    fn test_success_resets_counters() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        for _ in 0..4 {
            breaker.record_failure_at(FailureKind::Timeout, T0).unwrap();
        }
        breaker.record_success().unwrap();
        assert_eq!(
            breaker.record_failure_at(FailureKind::Timeout, T0).unwrap(),
            BreakerState::Closed
        );
        assert_eq!(breaker.snapshot().unwrap()[0].error_count, 1);
    }

    #[test]
    fn test_state_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        open_after_failures(&breaker(dir.path()), FailureKind::Timeout, T0);
        assert!(breaker(dir.path()).check_all_at(T0 + 1.0).is_err());
    }

    #[test]
    fn test_reset_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        open_after_failures(&breaker, FailureKind::Timeout, T0);
        breaker.reset().unwrap();
        assert!(breaker.check_all_at(T0).is_ok());
    }

    #[test]
    fn test_corrupt_state_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        std::fs::write(dir.path().join("breaker_timeout"), "state:open\n").unwrap();
        assert!(breaker.check_all_at(T0).is_ok());
        std::fs::write(dir.path().join("breaker_timeout"), "garbage").unwrap();
        assert!(breaker.check_all_at(T0).is_ok());
    }

    #[test]
    fn test_untimed_open_records_load_as_closed() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        std::fs::write(
            dir.path().join("breaker_timeout"),
            "state:open\nerror_count:9\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("breaker_backend_error"),
            "state:half_open\nerror_count:5\nopened_at:1700000000\n",
        )
        .unwrap();

        for record in breaker.snapshot().unwrap() {
            assert_eq!(record.state, BreakerState::Closed, "{}", record.kind);
            assert_eq!(record.error_count, 0);
        }
        assert!(breaker.check_all_at(T0).is_ok());
    }

    #[test]
    fn test_state_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = breaker(dir.path());
        breaker.record_failure_at(FailureKind::RateLimit, T0).unwrap();
        let text = std::fs::read_to_string(dir.path().join("breaker_rate_limit")).unwrap();
        assert!(text.contains("state:closed\n"));
        assert!(text.contains("error_count:1\n"));
        assert!(text.contains("last_error_at:1700000000\n"));
        assert!(!text.contains("opened_at"));
    }
}
