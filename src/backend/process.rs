//! External-process generation backend

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::{GuardError, Result};
use crate::ports::CommandBackend;

/// Shell convention for "command not found"
const EXIT_NOT_FOUND: i32 = 127;

const THROTTLE_MARKERS: &[&str] = &["429", "rate limit", "too many requests"];

/// Runs the configured program once per prompt.
///
/// The prompt goes to stdin, the candidate text comes back on stdout. The
/// child is killed if the timeout fires or the future is dropped.
pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessBackend {
    #[must_use]
    pub const fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &BackendConfig, timeout: Duration) -> Self {
        Self::new(config.program.clone(), config.args.clone(), timeout)
    }

    async fn run(&self, prompt: &str) -> Result<std::process::Output> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(GuardError::BackendNotInstalled {
                    program: self.program.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.shutdown().await
            }
            .await;
            // A backend that ignores stdin may exit before reading it
            if let Err(e) = written
                && e.kind() != io::ErrorKind::BrokenPipe
            {
                return Err(e.into());
            }
        }

        Ok(child.wait_with_output().await?)
    }
}

/// Map a finished backend process onto the failure taxonomy.
fn classify_output(program: &str, output: &std::process::Output) -> Result<String> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let first_stderr_line = stderr.lines().map(str::trim).find(|l| !l.is_empty());

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.trim().is_empty() {
            return Err(GuardError::BackendFailed {
                reason: "empty response".to_string(),
                exit_code: Some(0),
            });
        }
        return Ok(stdout);
    }

    let exit_code = output.status.code();
    if exit_code == Some(EXIT_NOT_FOUND) {
        return Err(GuardError::BackendNotInstalled {
            program: program.to_string(),
        });
    }

    let lowered = stderr.to_lowercase();
    if THROTTLE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Err(GuardError::BackendThrottled {
            reason: first_stderr_line.unwrap_or("throttled").to_string(),
        });
    }

    Err(GuardError::BackendFailed {
        reason: first_stderr_line
            .map_or_else(|| "process exited unsuccessfully".to_string(), str::to_string),
        exit_code,
    })
}

#[async_trait]
impl CommandBackend for ProcessBackend {
    async fn generate(&self, prompt: &str) -> Result<String> {
        debug!(program = %self.program, prompt_len = prompt.len(), "Invoking backend");

        let output = tokio::time::timeout(self.timeout, self.run(prompt))
            .await
            .map_err(|_| GuardError::BackendTimeout {
                seconds: self.timeout.as_secs(),
            })??;

        debug!(
            program = %self.program,
            status = ?output.status.code(),
            stdout_len = output.stdout.len(),
            "Backend finished"
        );
        classify_output(&self.program, &output)
    }

    fn name(&self) -> &str {
        &self.program
    }
}
