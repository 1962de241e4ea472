use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::{BreakerConfig, FallbackPolicy, RetryConfig};

const APP_DIR: &str = "nlsh-guard";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    /// Directory holding the token bucket and circuit breaker state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            security: SecurityConfig::default(),
            limits: LimitsConfig::default(),
            cache: CacheConfig::default(),
            backend: BackendConfig::default(),
            state_dir: default_state_dir(),
            audit: AuditConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Restrict every generated command to the read-only allowlist
    #[serde(default)]
    pub safe_mode: bool,

    /// Maximum request length in characters after sanitization
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,

    /// Maximum accepted command length (at most 1000)
    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,

    /// Additional forbidden substrings, matched case-insensitively
    #[serde(default)]
    pub extra_forbidden: Vec<String>,

    /// Additional dangerous-command regexes
    #[serde(default)]
    pub extra_dangerous_patterns: Vec<String>,

    /// Additional variables that `export`/`unset` may touch
    #[serde(default)]
    pub extra_safe_env_vars: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            safe_mode: false,
            max_input_length: default_max_input_length(),
            max_command_length: default_max_command_length(),
            extra_forbidden: Vec::new(),
            extra_dangerous_patterns: Vec::new(),
            extra_safe_env_vars: Vec::new(),
        }
    }
}

const fn default_max_input_length() -> usize {
    crate::security::DEFAULT_MAX_INPUT_LENGTH
}

const fn default_max_command_length() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Hard timeout for one backend invocation
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Sustained backend calls per minute (0 = disabled)
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Token bucket capacity
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Consecutive failures of one kind that open its circuit breaker
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_seconds: u64,

    /// How long to wait for any on-disk lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            rate_limit: default_rate_limit(),
            burst_limit: default_burst_limit(),
            retry_attempts: default_retry_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_seconds: default_breaker_cooldown(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl LimitsConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Create a `RetryConfig` from these limits settings
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_attempts,
            initial_delay_ms: self.retry_initial_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            ..Default::default()
        }
    }

    /// Breaker settings; a half-open probe is presumed lost once it has
    /// outlived the backend timeout.
    #[must_use]
    pub const fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.breaker_threshold,
            cooldown: Duration::from_secs(self.breaker_cooldown_seconds),
            probe_timeout: self.timeout(),
            lock_timeout: self.lock_timeout(),
        }
    }
}

const fn default_timeout() -> u64 {
    30
}

const fn default_rate_limit() -> u32 {
    10
}

const fn default_burst_limit() -> u32 {
    5
}

const fn default_retry_attempts() -> u32 {
    3
}

const fn default_retry_initial_delay_ms() -> u64 {
    1000
}

const fn default_retry_max_delay_ms() -> u64 {
    30_000
}

const fn default_breaker_threshold() -> u32 {
    5
}

const fn default_breaker_cooldown() -> u64 {
    300
}

const fn default_lock_timeout_ms() -> u64 {
    5000
}

/// What to serve when the backend stays unavailable after every retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    #[default]
    None,
    /// Serve the cached command for the request even if it has expired
    Stale,
    /// Serve `offline_response`
    Offline,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Entry lifetime (0 disables serving from the cache)
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,

    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub fallback: FallbackMode,

    #[serde(default = "default_offline_response")]
    pub offline_response: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_seconds: default_cache_ttl(),
            dir: default_cache_dir(),
            fallback: FallbackMode::default(),
            offline_response: default_offline_response(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn fallback_policy(&self) -> FallbackPolicy {
        match self.fallback {
            FallbackMode::None => FallbackPolicy::None,
            FallbackMode::Stale => FallbackPolicy::Stale,
            FallbackMode::Offline => FallbackPolicy::Offline(self.offline_response.clone()),
        }
    }
}

const fn default_cache_enabled() -> bool {
    true
}

const fn default_cache_ttl() -> u64 {
    3600
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("commands")
}

fn default_offline_response() -> String {
    "echo 'command generation is currently unavailable'".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Executable that turns a prompt on stdin into text on stdout
    #[serde(default = "default_backend_program")]
    pub program: String,

    #[serde(default = "default_backend_args")]
    pub args: Vec<String>,

    /// Prompt sent to the backend; `{request}` is replaced by the sanitized
    /// request
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: default_backend_program(),
            args: default_backend_args(),
            prompt_template: default_prompt_template(),
        }
    }
}

impl BackendConfig {
    pub const REQUEST_PLACEHOLDER: &'static str = "{request}";

    #[must_use]
    pub fn render_prompt(&self, request: &str) -> String {
        self.prompt_template
            .replace(Self::REQUEST_PLACEHOLDER, request)
    }
}

fn default_backend_program() -> String {
    "ollama".to_string()
}

fn default_backend_args() -> Vec<String> {
    vec!["run".to_string(), "llama3".to_string()]
}

fn default_prompt_template() -> String {
    "Translate the following request into one POSIX shell command. \
     Reply with the command only, without explanation or formatting. \
     Request: {request}"
        .to_string()
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("state")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,

    #[serde(default = "default_audit_path")]
    pub path: PathBuf,

    #[serde(default = "default_audit_max_size")]
    pub max_size_mb: u64,

    #[serde(default = "default_audit_retain")]
    pub retain_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            path: default_audit_path(),
            max_size_mb: default_audit_max_size(),
            retain_days: default_audit_retain(),
        }
    }
}

const fn default_audit_enabled() -> bool {
    true
}

fn default_audit_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("audit.log")
}

const fn default_audit_max_size() -> u64 {
    10
}

const fn default_audit_retain() -> u32 {
    30
}
