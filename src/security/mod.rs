mod audit;
mod rate_limiter;
mod risk;
pub mod rules;
mod sanitizer;
mod validator;

pub use audit::{AuditEvent, AuditEventType, AuditLogger, AuditWriterTask};
pub use rate_limiter::RateLimiter;
pub use risk::{RiskLevel, risk_level};
pub use sanitizer::{DEFAULT_MAX_INPUT_LENGTH, SHELL_METACHARACTERS, Sanitizer, sanitize_output};
pub use validator::{CommandValidator, RejectReason};
