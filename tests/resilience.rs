//! End-to-end tests for the generation pipeline under backend failures
//!
//! A scripted in-process backend stands in for the LLM so retries, circuit
//! breakers, fallbacks and the rate limiter can be driven deterministically.
//! Tokio time is paused, so retry backoff costs nothing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use nlsh_guard::config::{Config, FallbackMode};
use nlsh_guard::domain::{
    CommandCache, CommandSource, GenerateCommandRequest, GenerateCommandUseCase,
};
use nlsh_guard::error::{GuardError, Result};
use nlsh_guard::ports::CommandBackend;
use nlsh_guard::security::AuditLogger;
use nlsh_guard::storage::epoch_secs;

#[derive(Clone, Copy)]
enum Step {
    Timeout,
    Throttled,
    NotInstalled,
}

struct FlakyBackend {
    steps: Mutex<VecDeque<Step>>,
    output: String,
    calls: AtomicU32,
}

impl FlakyBackend {
    fn new(output: &str, steps: &[Step]) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.iter().copied().collect()),
            output: output.to_string(),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandBackend for FlakyBackend {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            None => Ok(self.output.clone()),
            Some(Step::Timeout) => Err(GuardError::BackendTimeout { seconds: 30 }),
            Some(Step::Throttled) => Err(GuardError::BackendThrottled {
                reason: "429 Too Many Requests".to_string(),
            }),
            Some(Step::NotInstalled) => Err(GuardError::BackendNotInstalled {
                program: "llm".to_string(),
            }),
        }
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.state_dir = dir.path().join("state");
    config.cache.dir = dir.path().join("cache");
    config.audit.enabled = false;
    config
}

fn use_case(config: &Config, backend: &Arc<FlakyBackend>) -> GenerateCommandUseCase {
    GenerateCommandUseCase::from_config(
        config,
        Arc::clone(backend) as Arc<dyn CommandBackend>,
        Arc::new(AuditLogger::disabled()),
    )
    .unwrap()
}

// ============== Retry ==============

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let backend = FlakyBackend::new("df -h", &[Step::Timeout, Step::Throttled]);

    let response = use_case(&config, &backend)
        .execute(&GenerateCommandRequest::new("disk usage"))
        .await
        .unwrap();
    assert_eq!(response.command, "df -h");
    assert_eq!(response.source, CommandSource::Backend);
    assert_eq!(backend.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_missing_backend_fails_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let backend = FlakyBackend::new("ls", &[Step::NotInstalled]);

    let err = use_case(&config, &backend)
        .execute(&GenerateCommandRequest::new("list"))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 7);
    assert_eq!(backend.calls(), 1);
}

// ============== Circuit Breaker ==============

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let backend = FlakyBackend::new("ls", &[Step::Timeout; 10]);
    let uc = use_case(&config, &backend);

    let first = uc
        .execute(&GenerateCommandRequest::new("first"))
        .await
        .unwrap_err();
    assert_eq!(first.exit_code(), 5);
    assert_eq!(backend.calls(), 3);

    let second = uc
        .execute(&GenerateCommandRequest::new("second"))
        .await
        .unwrap_err();
    assert!(matches!(second, GuardError::CircuitOpen { .. }));
    assert_eq!(backend.calls(), 5);

    // A fresh process sees the same open breaker and never calls out
    let other = FlakyBackend::new("ls", &[]);
    let err = use_case(&config, &other)
        .execute(&GenerateCommandRequest::new("third"))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 8);
    assert_eq!(other.calls(), 0);
}

// ============== Fallbacks ==============

#[tokio::test(start_paused = true)]
async fn test_offline_fallback_is_validated_and_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.cache.fallback = FallbackMode::Offline;
    config.cache.offline_response = "echo 'backend offline'".to_string();
    let backend = FlakyBackend::new("ls", &[Step::Timeout; 3]);

    let response = use_case(&config, &backend)
        .execute(&GenerateCommandRequest::new("anything"))
        .await
        .unwrap();
    assert_eq!(response.command, "echo 'backend offline'");
    assert_eq!(response.source, CommandSource::Offline);

    let cache = CommandCache::new(&config.cache.dir, config.limits.lock_timeout());
    assert_eq!(cache.stats().unwrap().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dangerous_offline_response_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.cache.fallback = FallbackMode::Offline;
    config.cache.offline_response = "rm -rf /".to_string();
    let backend = FlakyBackend::new("ls", &[Step::Timeout; 3]);

    let err = use_case(&config, &backend)
        .execute(&GenerateCommandRequest::new("anything"))
        .await
        .unwrap_err();
    assert!(err.is_security_rejection());
}

#[tokio::test(start_paused = true)]
async fn test_stale_fallback_serves_expired_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.cache.fallback = FallbackMode::Stale;
    let cache = CommandCache::new(&config.cache.dir, config.limits.lock_timeout());
    let key = CommandCache::key_for("list files");
    cache
        .put_at(&key, "ls -la", 60, epoch_secs() - 3600.0)
        .unwrap();

    let backend = FlakyBackend::new("ls", &[Step::Timeout; 3]);
    let response = use_case(&config, &backend)
        .execute(&GenerateCommandRequest::new("list files"))
        .await
        .unwrap();
    assert_eq!(response.command, "ls -la");
    assert_eq!(response.source, CommandSource::StaleCache);
    assert_eq!(backend.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_expired_entry_ignored_without_stale_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let cache = CommandCache::new(&config.cache.dir, config.limits.lock_timeout());
    let key = CommandCache::key_for("list files");
    cache
        .put_at(&key, "ls -la", 60, epoch_secs() - 3600.0)
        .unwrap();

    let backend = FlakyBackend::new("ls -1", &[]);
    let response = use_case(&config, &backend)
        .execute(&GenerateCommandRequest::new("list files"))
        .await
        .unwrap();
    assert_eq!(response.command, "ls -1");
    assert_eq!(response.source, CommandSource::Backend);
}

// ============== Rate Limiter ==============

#[tokio::test]
async fn test_rate_limit_spans_use_case_instances() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.limits.rate_limit = 1;
    config.limits.burst_limit = 2;
    let backend = FlakyBackend::new("pwd", &[]);

    for request in ["one", "two"] {
        use_case(&config, &backend)
            .execute(&GenerateCommandRequest::new(request))
            .await
            .unwrap();
    }
    let err = use_case(&config, &backend)
        .execute(&GenerateCommandRequest::new("three"))
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::RateLimited { .. }));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_cache_hits_bypass_rate_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.limits.rate_limit = 1;
    config.limits.burst_limit = 1;
    let backend = FlakyBackend::new("uptime", &[]);
    let uc = use_case(&config, &backend);

    for _ in 0..5 {
        let response = uc
            .execute(&GenerateCommandRequest::new("how long has it been up"))
            .await
            .unwrap();
        assert_eq!(response.command, "uptime");
    }
    assert_eq!(backend.calls(), 1);
}
