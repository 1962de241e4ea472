use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::AuditConfig;

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    CommandGenerated,
    CommandDenied,
    GenerationFailed,
    CacheHit,
}

impl AuditEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CommandGenerated => "command_generated",
            Self::CommandDenied => "command_denied",
            Self::GenerationFailed => "generation_failed",
            Self::CacheHit => "cache_hit",
        }
    }
}

/// Audit event for logging
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Sanitized user request
    pub input: String,
    /// Candidate or final command, empty when none was produced
    pub output: String,
    pub status: String,
}

impl AuditEvent {
    #[must_use]
    pub fn new(event_type: AuditEventType, input: &str, output: &str, status: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            input: input.to_string(),
            output: output.to_string(),
            status: status.to_string(),
        }
    }

    /// A command that passed validation and was handed to the user.
    #[must_use]
    pub fn generated(input: &str, command: &str, source: &str) -> Self {
        Self::new(AuditEventType::CommandGenerated, input, command, source)
    }

    #[must_use]
    pub fn cache_hit(input: &str, command: &str) -> Self {
        Self::new(AuditEventType::CacheHit, input, command, "cached")
    }

    /// A candidate the validator refused.
    #[must_use]
    pub fn denied(input: &str, command: &str, reason: &str) -> Self {
        Self::new(AuditEventType::CommandDenied, input, command, reason)
    }

    #[must_use]
    pub fn failed(input: &str, error: &str) -> Self {
        Self::new(AuditEventType::GenerationFailed, input, "", error)
    }
}

/// Audit logger that writes events to a file and/or tracing
///
/// Uses an async channel to avoid blocking on file writes.
pub struct AuditLogger {
    config: AuditConfig,
    sender: Option<mpsc::UnboundedSender<AuditEvent>>,
}

/// Background task that writes audit events to a file
pub struct AuditWriterTask {
    rx: mpsc::UnboundedReceiver<AuditEvent>,
    file: File,
}

impl AuditWriterTask {
    /// Run the writer task, consuming events until every logger is dropped
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            let line = format!("{json}\n");
            if let Ok(mut file) = self.file.try_clone() {
                let _ = tokio::task::spawn_blocking(move || {
                    if let Err(e) = file.write_all(line.as_bytes()) {
                        warn!(error = %e, "Failed to write audit event to file");
                    }
                    if let Err(e) = file.flush() {
                        warn!(error = %e, "Failed to flush audit log file");
                    }
                })
                .await;
            }
        }
    }
}

impl AuditLogger {
    /// Create an audit logger, rotating the log first if it is over size.
    ///
    /// Returns the logger and an optional writer task that must be spawned.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit log file cannot be created or opened.
    pub fn new(config: &AuditConfig) -> std::io::Result<(Self, Option<AuditWriterTask>)> {
        if !config.enabled {
            return Ok((Self::disabled(), None));
        }

        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut logger = Self {
            config: config.clone(),
            sender: None,
        };
        if logger.needs_rotation() {
            logger.rotate()?;
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&config.path)?;

        let (tx, rx) = mpsc::unbounded_channel();
        logger.sender = Some(tx);

        Ok((logger, Some(AuditWriterTask { rx, file })))
    }

    /// Create a disabled audit logger (for testing or when audit is off)
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            config: AuditConfig {
                enabled: false,
                ..AuditConfig::default()
            },
            sender: None,
        }
    }

    /// Log an audit event (non-blocking)
    pub fn log(&self, event: AuditEvent) {
        info!(
            event_type = event.event_type.as_str(),
            input = %event.input,
            output = %event.output,
            status = %event.status,
            "Audit"
        );

        if let Some(ref sender) = self.sender {
            let _ = sender.send(event);
        }
    }

    /// Check if the audit log needs rotation (exceeds max size)
    #[must_use]
    pub fn needs_rotation(&self) -> bool {
        if !self.config.enabled {
            return false;
        }

        if let Ok(metadata) = std::fs::metadata(&self.config.path) {
            let size_mb = metadata.len() / (1024 * 1024);
            return size_mb >= self.config.max_size_mb;
        }

        false
    }

    /// Rotate the audit log file to a timestamped sibling
    ///
    /// # Errors
    ///
    /// Returns an error if the log file cannot be renamed during rotation.
    pub fn rotate(&self) -> std::io::Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let path = &self.config.path;
        if !path.exists() {
            return Ok(());
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let rotated_path = path.with_file_name(format!("{}.{timestamp}", log_file_name(path)));
        std::fs::rename(path, &rotated_path)?;
        info!(rotated = %rotated_path.display(), "Audit log rotated");

        self.cleanup_old_files();
        Ok(())
    }

    /// Remove rotated audit files older than the retention period
    fn cleanup_old_files(&self) {
        let retain_days = self.config.retain_days;
        if retain_days == 0 {
            return;
        }

        let Some(parent) = self.config.path.parent() else {
            return;
        };
        let prefix = format!("{}.", log_file_name(&self.config.path));
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retain_days));

        let Ok(entries) = std::fs::read_dir(parent) else {
            return;
        };
        for entry in entries.flatten() {
            if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            if let Ok(metadata) = entry.metadata()
                && let Ok(modified) = metadata.modified()
            {
                let modified: DateTime<Utc> = modified.into();
                if modified < cutoff {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }
}

fn log_file_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("audit.log")
}
