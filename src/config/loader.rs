use super::types::{BackendConfig, Config};
use crate::error::{GuardError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Load configuration from a YAML file
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file does not exist
/// - The file cannot be read
/// - The YAML content is invalid or cannot be parsed
/// - The configuration fails validation (e.g., zero limits, invalid regex patterns)
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Err(GuardError::ConfigNotFound {
            path: path.display().to_string(),
        });
    }

    // World-readable config is reported, not rejected
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.mode() & 0o777;
            if mode & 0o004 != 0 {
                warn!(
                    config_path = %path.display(),
                    permissions = format!("{mode:04o}"),
                    "Config file is world-readable. Consider: chmod 600 {}",
                    path.display()
                );
            }
        }
    }

    let content = std::fs::read_to_string(path)?;
    let mut config: Config = serde_saphyr::from_str(&content)?;
    expand_paths(&mut config);
    validate_config(&config)?;

    debug!(config_path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Load `path` if given, otherwise the default file if it exists, otherwise
/// built-in defaults.
///
/// # Errors
///
/// Returns an error if an explicitly given file is missing, or if any file
/// that is read fails to parse or validate.
pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return load_config(path);
    }

    let default_path = default_config_path();
    if default_path.exists() {
        load_config(&default_path)
    } else {
        debug!(config_path = %default_path.display(), "No config file, using defaults");
        Ok(Config::default())
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).as_ref())
}

fn expand_paths(config: &mut Config) {
    config.state_dir = expand_path(&config.state_dir);
    config.cache.dir = expand_path(&config.cache.dir);
    config.audit.path = expand_path(&config.audit.path);
}

fn invalid(field: &str, reason: impl Into<String>) -> GuardError {
    GuardError::ConfigInvalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Validate the configuration
///
/// # Errors
///
/// Returns `ConfigInvalid` naming the first offending field.
pub fn validate_config(config: &Config) -> Result<()> {
    let security = &config.security;
    if security.max_input_length == 0 {
        return Err(invalid("security.max_input_length", "must be greater than 0"));
    }
    if security.max_command_length == 0 || security.max_command_length > 1000 {
        return Err(invalid(
            "security.max_command_length",
            "must be between 1 and 1000",
        ));
    }
    for pattern in &security.extra_dangerous_patterns {
        regex::Regex::new(pattern).map_err(|e| {
            invalid(
                "security.extra_dangerous_patterns",
                format!("Invalid regex '{pattern}': {e}"),
            )
        })?;
    }

    let limits = &config.limits;
    if limits.timeout_seconds == 0 {
        return Err(invalid("limits.timeout_seconds", "must be greater than 0"));
    }
    if limits.rate_limit > 0 && limits.burst_limit == 0 {
        return Err(invalid(
            "limits.burst_limit",
            "must be at least 1 when rate limiting is enabled",
        ));
    }
    if limits.retry_attempts == 0 {
        return Err(invalid("limits.retry_attempts", "must be at least 1"));
    }
    if limits.retry_initial_delay_ms > limits.retry_max_delay_ms {
        return Err(invalid(
            "limits.retry_initial_delay_ms",
            "must not exceed retry_max_delay_ms",
        ));
    }
    if limits.breaker_threshold == 0 {
        return Err(invalid("limits.breaker_threshold", "must be at least 1"));
    }

    if config.backend.program.trim().is_empty() {
        return Err(invalid("backend.program", "cannot be empty"));
    }
    if !config
        .backend
        .prompt_template
        .contains(BackendConfig::REQUEST_PLACEHOLDER)
    {
        return Err(invalid(
            "backend.prompt_template",
            format!("must contain {}", BackendConfig::REQUEST_PLACEHOLDER),
        ));
    }
    if config.backend.prompt_template.contains(['\n', '\r']) {
        return Err(invalid("backend.prompt_template", "must be a single line"));
    }

    Ok(())
}

/// Get the default config path
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nlsh-guard")
        .join("config.yaml")
}
