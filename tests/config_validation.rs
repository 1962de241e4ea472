//! Configuration loading tests through the public API

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use nlsh_guard::config::{Config, FallbackMode, load_config, load_or_default, validate_config};
use nlsh_guard::error::GuardError;
use nlsh_guard::security::CommandValidator;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

// ============== Defaults ==============

#[test]
fn test_defaults_are_valid() {
    let config = Config::default();
    assert!(validate_config(&config).is_ok());
    assert_eq!(config.security.max_input_length, 500);
    assert_eq!(config.security.max_command_length, 1000);
    assert_eq!(config.limits.timeout_seconds, 30);
    assert_eq!(config.limits.breaker_threshold, 5);
    assert_eq!(config.limits.breaker_cooldown_seconds, 300);
    assert_eq!(config.cache.ttl_seconds, 3600);
    assert_eq!(config.cache.fallback, FallbackMode::None);
}

#[test]
fn test_partial_file_keeps_other_defaults() {
    let file = write_config("limits:\n  rate_limit: 60\n");
    let config = load_config(file.path()).unwrap();
    assert_eq!(config.limits.rate_limit, 60);
    assert_eq!(config.limits.burst_limit, 5);
    assert!(config.cache.enabled);
}

#[test]
fn test_missing_explicit_path_is_config_error() {
    let err = load_or_default(Some(Path::new("/nonexistent/nlsh.yaml"))).unwrap_err();
    assert_eq!(err.exit_code(), 78);
}

// ============== Validation ==============

#[test]
fn test_invalid_values_name_the_field() {
    let file = write_config("limits:\n  breaker_threshold: 0\n");
    match load_config(file.path()) {
        Err(GuardError::ConfigInvalid { field, .. }) => {
            assert_eq!(field, "limits.breaker_threshold");
        }
        other => panic!("expected ConfigInvalid, got {other:?}"),
    }
}

#[test]
fn test_prompt_template_needs_placeholder() {
    let mut config = Config::default();
    config.backend.prompt_template = "Write a command".to_string();
    assert!(matches!(
        validate_config(&config),
        Err(GuardError::ConfigInvalid { .. })
    ));
}

#[test]
fn test_type_errors_are_reported() {
    let file = write_config("limits:\n  rate_limit: lots\n");
    assert!(load_config(file.path()).is_err());
}

// ============== Security Extensions ==============

#[test]
fn test_extra_rules_reach_the_validator() {
    let yaml = r"
security:
  extra_forbidden: ['git push --force']
  extra_dangerous_patterns: ['\bdocker\s+system\s+prune\b']
";
    let file = write_config(yaml);
    let config = load_config(file.path()).unwrap();
    let validator = CommandValidator::new(&config.security).unwrap();

    assert!(validator.check("git push --force origin main", false).is_err());
    assert!(validator.check("docker system prune -af", false).is_err());
    assert!(validator.check("git push origin main", false).is_ok());
}

#[test]
fn test_safe_mode_from_file() {
    let file = write_config("security:\n  safe_mode: true\n");
    assert!(load_config(file.path()).unwrap().security.safe_mode);
}
