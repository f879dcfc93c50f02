//! Reverse-proxy purge seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// What the reverse proxy should drop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeScope {
    #[default]
    All,
    /// URL paths to purge.
    Paths(Vec<String>),
}

#[derive(Debug, Error)]
#[error("reverse proxy purge failed: {reason}")]
pub struct PurgeError {
    pub reason: String,
}

impl PurgeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Issues purge requests against a reverse-proxy cache.
#[async_trait]
pub trait PurgeClient: Send + Sync {
    async fn purge(&self, scope: &PurgeScope) -> Result<(), PurgeError>;
}

/// Purge client for deployments without a reverse proxy; only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingPurgeClient;

#[async_trait]
impl PurgeClient for LoggingPurgeClient {
    async fn purge(&self, scope: &PurgeScope) -> Result<(), PurgeError> {
        info!(scope = ?scope, "Reverse proxy purge requested; no proxy configured");
        Ok(())
    }
}
