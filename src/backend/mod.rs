//! Backend invocation and resilience
//!
//! Everything between a sanitized prompt and raw backend text: the external
//! process adapter, retry with backoff, and the persisted circuit breakers
//! that gate every attempt.

mod circuit_breaker;
mod process;
mod resilience;
pub mod retry;

pub use circuit_breaker::{BreakerConfig, BreakerRecord, BreakerState, CircuitBreaker, FailureKind};
pub use process::ProcessBackend;
pub use resilience::{FallbackPolicy, ResilientCaller, ResilientOutcome};
pub use retry::{RetryConfig, with_retry_if};
