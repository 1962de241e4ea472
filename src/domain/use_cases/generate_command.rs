//! Generate Command Use Case
//!
//! Sequences one request end to end:
//!
//! sanitize input → cache lookup → rate limit → breaker-gated backend call
//! with retry → sanitize output → validate → cache store → return
//!
//! Cached commands are validated again under the current policy, so an
//! entry stored in normal mode is never served to a restricted caller.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{CircuitBreaker, FallbackPolicy, ResilientCaller, ResilientOutcome};
use crate::config::{BackendConfig, Config};
use crate::domain::{CacheLookup, CommandCache};
use crate::error::{GuardError, Result};
use crate::ports::CommandBackend;
use crate::security::{
    AuditEvent, AuditLogger, CommandValidator, RateLimiter, RiskLevel, Sanitizer, risk_level,
    sanitize_output,
};

/// Request for generating a command
#[derive(Debug, Clone)]
pub struct GenerateCommandRequest {
    pub request: String,
    /// Apply the read-only allowlist (also forced by `security.safe_mode`)
    pub restricted: bool,
    /// Read from and write to the command cache
    pub use_cache: bool,
}

impl GenerateCommandRequest {
    #[must_use]
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            restricted: false,
            use_cache: true,
        }
    }
}

/// Where a returned command came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Cache,
    Backend,
    StaleCache,
    Offline,
}

impl CommandSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Backend => "backend",
            Self::StaleCache => "stale_cache",
            Self::Offline => "offline",
        }
    }
}

/// A vetted command ready to show the user
#[derive(Debug, Clone, Serialize)]
pub struct GenerateCommandResponse {
    pub command: String,
    pub risk: RiskLevel,
    pub source: CommandSource,
}

impl GenerateCommandResponse {
    #[must_use]
    pub const fn warning(&self) -> Option<&'static str> {
        self.risk.warning()
    }
}

/// Use case turning a natural-language request into a vetted command
pub struct GenerateCommandUseCase {
    sanitizer: Sanitizer,
    validator: Arc<CommandValidator>,
    cache: Option<CommandCache>,
    cache_ttl: u64,
    rate_limiter: RateLimiter,
    caller: ResilientCaller,
    fallback: FallbackPolicy,
    backend_config: BackendConfig,
    safe_mode: bool,
    audit_logger: Arc<AuditLogger>,
}

impl GenerateCommandUseCase {
    /// Wire every component from `config` around `backend`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the security rules cannot be compiled.
    pub fn from_config(
        config: &Config,
        backend: Arc<dyn CommandBackend>,
        audit_logger: Arc<AuditLogger>,
    ) -> Result<Self> {
        let limits = &config.limits;
        Ok(Self {
            sanitizer: Sanitizer::new(config.security.max_input_length),
            validator: Arc::new(CommandValidator::new(&config.security)?),
            cache: config
                .cache
                .enabled
                .then(|| CommandCache::new(&config.cache.dir, limits.lock_timeout())),
            cache_ttl: config.cache.ttl_seconds,
            rate_limiter: RateLimiter::new(
                &config.state_dir,
                limits.rate_limit,
                limits.burst_limit,
                limits.lock_timeout(),
            ),
            caller: ResilientCaller::new(
                backend,
                CircuitBreaker::new(&config.state_dir, limits.breaker_config()),
                limits.retry_config(),
            ),
            fallback: config.cache.fallback_policy(),
            backend_config: config.backend.clone(),
            safe_mode: config.security.safe_mode,
            audit_logger,
        })
    }

    #[must_use]
    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    /// Look up a cached command, checking a fresh hit against the current
    /// policy. Returns the servable hit and, when the stale fallback is
    /// configured, an expired payload to fall back on.
    fn cached(&self, key: &str, restricted: bool) -> (Option<String>, Option<String>) {
        let Some(cache) = &self.cache else {
            return (None, None);
        };
        let lookup = if self.fallback == FallbackPolicy::Stale {
            cache.lookup(key)
        } else {
            cache.get(key).map(|hit| hit.map_or(CacheLookup::Miss, CacheLookup::Fresh))
        };

        match lookup {
            Ok(CacheLookup::Fresh(command)) => match self.validator.check(&command, restricted) {
                Ok(()) => (Some(command), None),
                Err(reason) => {
                    debug!(reason = %reason, "Cached command fails current policy, ignoring");
                    (None, None)
                }
            },
            Ok(CacheLookup::Expired(command)) => (None, Some(command)),
            Ok(CacheLookup::Miss) => (None, None),
            Err(e) => {
                warn!(error = %e, "Cache unavailable, generating live");
                (None, None)
            }
        }
    }

    /// Run the full pipeline for one request.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if nothing is left of the request after sanitization
    /// - `RateLimited` if the token bucket is empty
    /// - `CircuitOpen` or a backend error if generation fails and no
    ///   fallback applies
    /// - `CommandDenied` if the candidate command fails validation
    pub async fn execute(&self, request: &GenerateCommandRequest) -> Result<GenerateCommandResponse> {
        let sanitized = self.sanitizer.sanitize_input(&request.request);
        if sanitized.is_empty() {
            return Err(GuardError::InvalidInput {
                reason: "request is empty".to_string(),
            });
        }
        let restricted = request.restricted || self.safe_mode;
        let key = CommandCache::key_for(&sanitized);

        let (hit, stale) = if request.use_cache {
            self.cached(&key, restricted)
        } else {
            (None, None)
        };
        if let Some(command) = hit {
            self.audit_logger
                .log(AuditEvent::cache_hit(&sanitized, &command));
            return Ok(GenerateCommandResponse {
                risk: risk_level(&command),
                command,
                source: CommandSource::Cache,
            });
        }

        if let Err(e) = self.rate_limiter.check() {
            self.audit_logger
                .log(AuditEvent::failed(&sanitized, &e.to_string()));
            return Err(e);
        }

        let prompt = self.backend_config.render_prompt(&sanitized);
        let outcome = self
            .caller
            .call_with_fallback(&prompt, &self.fallback, || stale)
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.audit_logger
                    .log(AuditEvent::failed(&sanitized, &e.to_string()));
                return Err(e);
            }
        };

        let source = match &outcome {
            ResilientOutcome::Generated(_) => CommandSource::Backend,
            ResilientOutcome::Stale(_) => CommandSource::StaleCache,
            ResilientOutcome::Offline(_) => CommandSource::Offline,
        };
        let command = sanitize_output(outcome.text());

        if let Err(reason) = self.validator.check(&command, restricted) {
            warn!(reason = %reason, source = source.as_str(), "Generated command rejected");
            self.audit_logger.log(AuditEvent::denied(
                &sanitized,
                &command,
                &reason.to_string(),
            ));
            return Err(GuardError::CommandDenied { reason });
        }

        if source == CommandSource::Backend
            && request.use_cache
            && self.cache_ttl > 0
            && let Some(cache) = &self.cache
            && let Err(e) = cache.put(&key, &command, self.cache_ttl)
        {
            warn!(error = %e, "Failed to cache generated command");
        }

        info!(source = source.as_str(), "Command generated");
        self.audit_logger
            .log(AuditEvent::generated(&sanitized, &command, source.as_str()));

        Ok(GenerateCommandResponse {
            risk: risk_level(&command),
            command,
            source,
        })
    }
}
