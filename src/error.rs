use thiserror::Error;

use crate::backend::FailureKind;
use crate::security::RejectReason;

#[derive(Error, Debug)]
pub enum GuardError {
    // Configuration errors
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid { field: String, reason: String },

    // Input errors
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    // Security errors
    #[error("Command rejected: {reason}")]
    CommandDenied { reason: RejectReason },

    // Storage errors
    #[error("Timed out after {waited_ms}ms waiting for lock on {resource}")]
    LockTimeout { resource: String, waited_ms: u64 },

    #[error("Cache import rejected: {reason}")]
    CacheImport { reason: String },

    // Admission errors
    #[error("Rate limit exceeded, retry in {retry_after_secs:.1}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("Circuit breaker open for {kind} failures, retry in {retry_in_secs}s")]
    CircuitOpen { kind: FailureKind, retry_in_secs: u64 },

    // Backend errors
    #[error("Backend timeout after {seconds}s")]
    BackendTimeout { seconds: u64 },

    #[error("Backend rate limited the request: {reason}")]
    BackendThrottled { reason: String },

    #[error("Backend failed{}: {reason}", .exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    BackendFailed {
        reason: String,
        exit_code: Option<i32>,
    },

    #[error("Backend executable not installed: {program}")]
    BackendNotInstalled { program: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

impl GuardError {
    /// Process exit status for this failure.
    ///
    /// | status | failure |
    /// |--------|---------|
    /// | 2 | invalid input |
    /// | 3 | command rejected by the validator |
    /// | 4 | rate limited |
    /// | 5 | backend timeout |
    /// | 6 | backend error (including backend-side throttling) |
    /// | 7 | backend not installed |
    /// | 8 | circuit breaker open |
    /// | 78 | configuration error |
    /// | 1 | anything else |
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidInput { .. } => 2,
            Self::CommandDenied { .. } => 3,
            Self::RateLimited { .. } => 4,
            Self::BackendTimeout { .. } => 5,
            Self::BackendFailed { .. } | Self::BackendThrottled { .. } => 6,
            Self::BackendNotInstalled { .. } => 7,
            Self::CircuitOpen { .. } => 8,
            Self::ConfigNotFound { .. } | Self::ConfigInvalid { .. } => 78,
            _ => 1,
        }
    }

    /// Breaker bucket this failure is counted in, if any.
    ///
    /// A missing executable is not transient and never trips a breaker.
    #[must_use]
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::BackendTimeout { .. } => Some(FailureKind::Timeout),
            Self::BackendThrottled { .. } => Some(FailureKind::RateLimit),
            Self::BackendFailed { .. } => Some(FailureKind::Backend),
            _ => None,
        }
    }

    /// Whether the retry controller may attempt the call again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.failure_kind().is_some()
    }

    /// Whether this failure is a security decision that must reach the user.
    #[must_use]
    pub const fn is_security_rejection(&self) -> bool {
        matches!(self, Self::CommandDenied { .. })
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;
