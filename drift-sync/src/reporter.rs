//! External metrics/progress updater boundary
//!
//! Invoked when a mode completes. Fire-and-forget from the sync engine's
//! perspective: failures are logged by the caller, never retried here.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::Result;

#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Record a mode completion for a session with the given results.
    async fn record_completion(&self, session_id: &str, mode: &str, results: &Value)
        -> Result<()>;
}

/// Reporter that drops everything. Default when no updater is wired in.
#[derive(Debug, Clone, Default)]
pub struct NoopReporter;

#[async_trait]
impl ProgressReporter for NoopReporter {
    async fn record_completion(
        &self,
        _session_id: &str,
        _mode: &str,
        _results: &Value,
    ) -> Result<()> {
        Ok(())
    }
}
