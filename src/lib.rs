//! Safety and resilience layer between an LLM that writes shell commands and
//! the user who runs them.
//!
//! A request flows through input sanitization, a lock-protected command
//! cache, a persistent token-bucket rate limiter and per-failure-kind circuit
//! breakers before the backend is called. Whatever comes back is sanitized
//! again and has to pass the [`CommandValidator`] before it is shown.

pub mod backend;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod security;
pub mod storage;

pub use backend::{CircuitBreaker, FailureKind, ProcessBackend, ResilientCaller, RetryConfig};
pub use config::Config;
pub use domain::{
    CommandCache, GenerateCommandRequest, GenerateCommandResponse, GenerateCommandUseCase,
};
pub use error::{GuardError, Result};
pub use ports::CommandBackend;
pub use security::{
    AuditLogger, CommandValidator, RateLimiter, RejectReason, RiskLevel, Sanitizer, risk_level,
};

// Re-exports for fuzzing
#[doc(hidden)]
pub use config::SecurityConfig;
#[doc(hidden)]
pub use domain::ExportedEntry;
