//! Command generation backend port

use async_trait::async_trait;

use crate::error::Result;

/// Trait for the external text-generation backend
///
/// Implementations receive an already sanitized, single-line prompt and
/// return the raw candidate text untouched. All cleaning and validation of
/// that text happens on the caller's side.
#[async_trait]
pub trait CommandBackend: Send + Sync {
    /// Produce raw candidate text for `prompt`
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Short name used in logs and audit records
    fn name(&self) -> &str;
}
