//! Breaker-gated, retried backend calls with fallback directives

use std::sync::Arc;

use tracing::{info, warn};

use super::circuit_breaker::{BreakerState, CircuitBreaker};
use super::retry::{RetryConfig, with_retry_if};
use crate::error::{GuardError, Result};
use crate::ports::CommandBackend;

/// What to serve once every retry of a transient failure is spent
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Surface the failure
    #[default]
    None,
    /// Serve the cached entry for this request regardless of its TTL
    Stale,
    /// Serve a fixed response
    Offline(String),
}

/// Where the returned text came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResilientOutcome {
    Generated(String),
    Stale(String),
    Offline(String),
}

impl ResilientOutcome {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Generated(t) | Self::Stale(t) | Self::Offline(t) => t,
        }
    }

    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        !matches!(self, Self::Generated(_))
    }
}

/// Wraps a [`CommandBackend`] with circuit breakers and retry.
pub struct ResilientCaller {
    backend: Arc<dyn CommandBackend>,
    breaker: CircuitBreaker,
    retry: RetryConfig,
}

impl ResilientCaller {
    #[must_use]
    pub fn new(backend: Arc<dyn CommandBackend>, breaker: CircuitBreaker, retry: RetryConfig) -> Self {
        Self {
            backend,
            breaker,
            retry,
        }
    }

    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn attempt(&self, prompt: &str) -> Result<String> {
        self.breaker.check_all()?;

        match self.backend.generate(prompt).await {
            Ok(text) => {
                if let Err(e) = self.breaker.record_success() {
                    warn!(error = %e, "Failed to record backend success");
                }
                Ok(text)
            }
            Err(e) => {
                if let Some(kind) = e.failure_kind() {
                    match self.breaker.record_failure(kind) {
                        Ok(BreakerState::Open) => {
                            warn!(kind = %kind, "Backend failures opened the circuit breaker");
                        }
                        Ok(_) => {}
                        Err(record_err) => {
                            warn!(error = %record_err, "Failed to record backend failure");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Call the backend, retrying transient failures with backoff.
    ///
    /// Every attempt first consults all circuit breakers; an open breaker
    /// ends the call immediately with [`GuardError::CircuitOpen`].
    ///
    /// # Errors
    ///
    /// Returns the last backend error after retries are exhausted, or the
    /// first non-retryable error.
    pub async fn call_with_resilience(&self, prompt: &str) -> Result<String> {
        with_retry_if(
            &self.retry,
            self.backend.name(),
            || self.attempt(prompt),
            GuardError::is_retryable,
        )
        .await
    }

    /// [`call_with_resilience`](Self::call_with_resilience), applying
    /// `policy` when a transient failure survives every retry.
    ///
    /// `stale` is only consulted for [`FallbackPolicy::Stale`].
    ///
    /// # Errors
    ///
    /// Returns the backend error when no fallback applies.
    pub async fn call_with_fallback<F>(
        &self,
        prompt: &str,
        policy: &FallbackPolicy,
        stale: F,
    ) -> Result<ResilientOutcome>
    where
        F: FnOnce() -> Option<String>,
    {
        let err = match self.call_with_resilience(prompt).await {
            Ok(text) => return Ok(ResilientOutcome::Generated(text)),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        match policy {
            FallbackPolicy::None => Err(err),
            FallbackPolicy::Stale => match stale() {
                Some(text) => {
                    info!(error = %err, "Backend unavailable, serving stale cache entry");
                    Ok(ResilientOutcome::Stale(text))
                }
                None => Err(err),
            },
            FallbackPolicy::Offline(text) => {
                info!(error = %err, "Backend unavailable, serving offline response");
                Ok(ResilientOutcome::Offline(text.clone()))
            }
        }
    }
}
