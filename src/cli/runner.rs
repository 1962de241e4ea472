//! CLI runner functions
//!
//! Each function writes its result to `out` so the commands can be tested
//! without a terminal. Warnings meant for the user go to stderr.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{CircuitBreaker, ProcessBackend};
use crate::config::Config;
use crate::domain::{CommandCache, GenerateCommandRequest, GenerateCommandUseCase};
use crate::error::{GuardError, Result};
use crate::ports::CommandBackend;
use crate::security::{AuditLogger, CommandValidator, RateLimiter, risk_level};
use crate::storage::epoch_secs;

fn cache(config: &Config) -> CommandCache {
    CommandCache::new(&config.cache.dir, config.limits.lock_timeout())
}

fn rate_limiter(config: &Config) -> RateLimiter {
    RateLimiter::new(
        &config.state_dir,
        config.limits.rate_limit,
        config.limits.burst_limit,
        config.limits.lock_timeout(),
    )
}

fn breaker(config: &Config) -> CircuitBreaker {
    CircuitBreaker::new(&config.state_dir, config.limits.breaker_config())
}

/// Generate, vet and print a command for `request`
///
/// # Errors
///
/// Returns an error if:
/// - The request is empty after sanitization
/// - The rate limit is exhausted or a circuit breaker is open
/// - The backend fails and no fallback applies
/// - The generated command is rejected by the validator
pub async fn run_generate(
    config: &Config,
    request: &str,
    restricted: bool,
    use_cache: bool,
    out: &mut impl Write,
) -> Result<()> {
    let backend: Arc<dyn CommandBackend> = Arc::new(ProcessBackend::from_config(
        &config.backend,
        config.limits.timeout(),
    ));
    run_generate_with(config, backend, request, restricted, use_cache, out).await
}

async fn run_generate_with(
    config: &Config,
    backend: Arc<dyn CommandBackend>,
    request: &str,
    restricted: bool,
    use_cache: bool,
    out: &mut impl Write,
) -> Result<()> {
    let (audit_logger, audit_task) = AuditLogger::new(&config.audit).unwrap_or_else(|e| {
        warn!(error = %e, "Audit log unavailable, continuing without it");
        (AuditLogger::disabled(), None)
    });
    let audit_handle = audit_task.map(|task| tokio::spawn(task.run()));
    let audit_logger = Arc::new(audit_logger);

    let use_case = GenerateCommandUseCase::from_config(config, backend, Arc::clone(&audit_logger))?;
    let mut req = GenerateCommandRequest::new(request);
    req.restricted = restricted;
    req.use_cache = use_cache;
    let result = use_case.execute(&req).await;

    // The writer task ends once the last sender is gone
    drop(use_case);
    drop(audit_logger);
    if let Some(handle) = audit_handle
        && let Err(e) = handle.await
    {
        warn!(error = %e, "Audit writer task failed");
    }

    let response = result?;
    debug!(source = response.source.as_str(), risk = %response.risk, "Command ready");
    writeln!(out, "{}", response.command)?;
    if let Some(warning) = response.warning() {
        eprintln!("[{}] {warning}", response.risk);
    }
    Ok(())
}

/// Check `command` and print `accepted` or the rejection code
///
/// # Errors
///
/// Returns `CommandDenied` if the command is rejected.
pub fn run_validate(
    config: &Config,
    command: &str,
    restricted: bool,
    out: &mut impl Write,
) -> Result<()> {
    let validator = CommandValidator::new(&config.security)?;
    let restricted = restricted || config.security.safe_mode;
    match validator.check(command, restricted) {
        Ok(()) => {
            writeln!(out, "accepted")?;
            Ok(())
        }
        Err(reason) => {
            writeln!(out, "rejected: {}", reason.code())?;
            Err(GuardError::CommandDenied { reason })
        }
    }
}

/// Print the risk level of `command`
///
/// # Errors
///
/// Returns an error if writing to `out` fails.
pub fn run_risk(command: &str, out: &mut impl Write) -> Result<()> {
    writeln!(out, "{}", risk_level(command))?;
    Ok(())
}

/// Remove cache entries, optionally only those older than `older_than` seconds
///
/// # Errors
///
/// Returns an error if the cache directory cannot be read or cleaned.
pub fn run_cache_clear(config: &Config, older_than: Option<u64>, out: &mut impl Write) -> Result<()> {
    let cache = cache(config);
    let removed = match older_than {
        Some(secs) => cache.clear_older_than(secs)?,
        None => cache.clear_all()?,
    };
    writeln!(out, "Removed {removed} cache entries")?;
    Ok(())
}

/// Print cache entry count and payload size
///
/// # Errors
///
/// Returns an error if the cache directory cannot be read.
pub fn run_cache_stats(config: &Config, out: &mut impl Write) -> Result<()> {
    let stats = cache(config).stats()?;
    writeln!(out, "Directory: {}", config.cache.dir.display())?;
    writeln!(out, "Entries: {}", stats.entries)?;
    writeln!(out, "Payload bytes: {}", stats.payload_bytes)?;
    Ok(())
}

/// Print one cache entry in the export format
///
/// # Errors
///
/// Returns `InvalidInput` for a malformed key or a key with no intact entry.
pub fn run_cache_export(config: &Config, key: &str, out: &mut impl Write) -> Result<()> {
    let blob = cache(config)
        .export(key)?
        .ok_or_else(|| GuardError::InvalidInput {
            reason: format!("no cache entry for key {key}"),
        })?;
    out.write_all(blob.as_bytes())?;
    Ok(())
}

/// Import an exported entry from `file`
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold a valid
/// export.
pub fn run_cache_import(config: &Config, file: &Path, out: &mut impl Write) -> Result<()> {
    let blob = std::fs::read_to_string(file)?;
    let key = cache(config).import(&blob)?;
    writeln!(out, "Imported {key}")?;
    Ok(())
}

/// Reset the rate limiter and/or the circuit breakers (both if neither flag
/// is set)
///
/// # Errors
///
/// Returns an error if the state lock cannot be taken or a file cannot be
/// removed.
pub fn run_reset(
    config: &Config,
    rate_limit: bool,
    breaker_flag: bool,
    out: &mut impl Write,
) -> Result<()> {
    let both = !rate_limit && !breaker_flag;
    if rate_limit || both {
        rate_limiter(config).reset()?;
        writeln!(out, "Rate limiter reset")?;
    }
    if breaker_flag || both {
        breaker(config).reset()?;
        writeln!(out, "Circuit breakers reset")?;
    }
    Ok(())
}

/// Show the effective configuration and live limiter/breaker state
///
/// # Errors
///
/// Returns an error if limiter or breaker state exists but cannot be read.
pub fn run_status(config: &Config, out: &mut impl Write) -> Result<()> {
    writeln!(out, "nlsh-guard Status")?;
    writeln!(out, "=================\n")?;

    writeln!(out, "Security:")?;
    writeln!(out, "  Safe mode: {}", config.security.safe_mode)?;
    writeln!(out, "  Max input length: {}", config.security.max_input_length)?;
    writeln!(out, "  Max command length: {}", config.security.max_command_length)?;
    if !config.security.extra_forbidden.is_empty() {
        writeln!(out, "  Extra forbidden: {}", config.security.extra_forbidden.join(", "))?;
    }
    if !config.security.extra_dangerous_patterns.is_empty() {
        writeln!(out, "  Extra patterns:")?;
        for pattern in &config.security.extra_dangerous_patterns {
            writeln!(out, "    - {pattern}")?;
        }
    }

    writeln!(out, "\nBackend:")?;
    writeln!(
        out,
        "  Command: {} {}",
        config.backend.program,
        config.backend.args.join(" ")
    )?;
    writeln!(out, "  Timeout: {}s", config.limits.timeout_seconds)?;
    writeln!(
        out,
        "  Retry: {} attempts, {}ms initial delay",
        config.limits.retry_attempts, config.limits.retry_initial_delay_ms
    )?;

    writeln!(out, "\nCache:")?;
    writeln!(out, "  Enabled: {}", config.cache.enabled)?;
    writeln!(out, "  Directory: {}", config.cache.dir.display())?;
    writeln!(out, "  TTL: {}s", config.cache.ttl_seconds)?;
    writeln!(out, "  Fallback: {:?}", config.cache.fallback)?;

    writeln!(out, "\nRate limiter:")?;
    let limiter = rate_limiter(config);
    if limiter.is_enabled() {
        let tokens = limiter.available_tokens_at(epoch_secs())?;
        writeln!(
            out,
            "  {tokens:.2}/{} tokens, {}/min",
            config.limits.burst_limit, config.limits.rate_limit
        )?;
    } else {
        writeln!(out, "  disabled")?;
    }

    writeln!(out, "\nCircuit breakers:")?;
    for record in breaker(config).snapshot()? {
        writeln!(
            out,
            "  {:<12} {:<10} errors={}",
            record.kind.as_str(),
            record.state.as_str(),
            record.error_count
        )?;
    }

    writeln!(out, "\nState directory: {}", config.state_dir.display())?;
    writeln!(
        out,
        "Audit: {}",
        if config.audit.enabled {
            config.audit.path.display().to_string()
        } else {
            "disabled".to_string()
        }
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FailureKind;
    use crate::ports::mock::ScriptedBackend;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.state_dir = dir.path().join("state");
        config.cache.dir = dir.path().join("cache");
        config.audit.enabled = false;
        config
    }

    fn output(buf: Vec<u8>) -> String {
        String::from_utf8(buf).unwrap()
    }

    // ============== run_generate Tests ==============

    #[tokio::test]
    async fn test_generate_prints_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let backend = Arc::new(ScriptedBackend::new("ls -la"));
        let mut out = Vec::new();

        run_generate_with(&config, backend, "list files", false, true, &mut out)
            .await
            .unwrap();
        assert_eq!(output(out), "ls -la\n");
    }

    #[tokio::test]
    async fn test_generate_rejects_dangerous_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let backend = Arc::new(ScriptedBackend::new("rm -rf /"));
        let mut out = Vec::new();

        let result = run_generate_with(&config, backend, "wipe", false, true, &mut out).await;
        assert!(matches!(result, Err(GuardError::CommandDenied { .. })));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_generate_writes_audit_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.audit.enabled = true;
        config.audit.path = dir.path().join("audit.log");
        let backend = Arc::new(ScriptedBackend::new("pwd"));
        let mut out = Vec::new();

        run_generate_with(&config, backend, "where am i", false, true, &mut out)
            .await
            .unwrap();
        let log = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        assert!(log.contains("pwd"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_generate_with_process_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.backend.program = "echo".to_string();
        config.backend.args = vec!["df -h".to_string()];
        let mut out = Vec::new();

        run_generate(&config, "disk usage", false, false, &mut out)
            .await
            .unwrap();
        assert_eq!(output(out), "df -h\n");
    }

    // ============== run_validate / run_risk Tests ==============

    #[test]
    fn test_validate_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        run_validate(&test_config(&dir), "ls -la", false, &mut out).unwrap();
        assert_eq!(output(out), "accepted\n");
    }

    #[test]
    fn test_validate_rejects_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        let err = run_validate(&test_config(&dir), "ls; rm x", false, &mut out).unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(output(out).starts_with("rejected: "));
    }

    #[test]
    fn test_validate_safe_mode_forces_restricted() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.security.safe_mode = true;
        let mut out = Vec::new();
        assert!(run_validate(&config, "touch file", false, &mut out).is_err());
    }

    #[test]
    fn test_risk_levels() {
        let mut out = Vec::new();
        run_risk("ls -la", &mut out).unwrap();
        run_risk("kill -9 1234", &mut out).unwrap();
        assert_eq!(output(out), "LOW\nHIGH\n");
    }

    // ============== Cache Command Tests ==============

    #[test]
    fn test_cache_export_import_between_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let key = CommandCache::key_for("list files");
        cache(&config).put(&key, "ls -la", 3600).unwrap();

        let mut blob = Vec::new();
        run_cache_export(&config, &key, &mut blob).unwrap();
        let file = dir.path().join("entry.export");
        std::fs::write(&file, &blob).unwrap();

        let mut other = test_config(&dir);
        other.cache.dir = dir.path().join("other-cache");
        let mut out = Vec::new();
        run_cache_import(&other, &file, &mut out).unwrap();
        assert_eq!(output(out), format!("Imported {key}\n"));
        assert_eq!(cache(&other).get(&key).unwrap().as_deref(), Some("ls -la"));
    }

    #[test]
    fn test_cache_export_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = CommandCache::key_for("nothing");
        let result = run_cache_export(&test_config(&dir), &key, &mut Vec::new());
        assert!(matches!(result, Err(GuardError::InvalidInput { .. })));
    }

    #[test]
    fn test_cache_stats_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let cache = cache(&config);
        cache.put(&CommandCache::key_for("a"), "ls", 3600).unwrap();
        cache.put(&CommandCache::key_for("b"), "pwd", 3600).unwrap();

        let mut out = Vec::new();
        run_cache_stats(&config, &mut out).unwrap();
        assert!(output(out).contains("Entries: 2"));

        let mut out = Vec::new();
        run_cache_clear(&config, Some(3600), &mut out).unwrap();
        assert_eq!(output(out), "Removed 0 cache entries\n");

        let mut out = Vec::new();
        run_cache_clear(&config, None, &mut out).unwrap();
        assert_eq!(output(out), "Removed 2 cache entries\n");
    }

    // ============== run_reset / run_status Tests ==============

    #[test]
    fn test_reset_breaker_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let breaker = breaker(&config);
        breaker.record_failure(FailureKind::Timeout).unwrap();
        assert!(rate_limiter(&config).admit());

        let mut out = Vec::new();
        run_reset(&config, false, true, &mut out).unwrap();
        assert_eq!(output(out), "Circuit breakers reset\n");
        assert!(breaker.snapshot().unwrap().iter().all(|r| r.error_count == 0));
    }

    #[test]
    fn test_reset_both_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        run_reset(&test_config(&dir), false, false, &mut out).unwrap();
        assert_eq!(output(out), "Rate limiter reset\nCircuit breakers reset\n");
    }

    #[test]
    fn test_status_shows_breakers() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let mut out = Vec::new();
        run_status(&config, &mut out).unwrap();
        let text = output(out);
        assert!(text.contains("Safe mode: false"));
        assert!(text.contains("timeout"));
        assert!(text.contains("rate_limit"));
        assert!(text.contains("backend_error"));
        assert!(text.contains("closed"));
    }
}
