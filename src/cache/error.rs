use thiserror::Error;

/// Errors surfaced by cache clients and backends.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation not supported: {0}")]
    NotSupported(String),
    #[error("cache server `{server}` unavailable during {op}: {reason}")]
    BackendUnavailable {
        server: String,
        op: &'static str,
        reason: String,
    },
    #[error("cache server `{server}` timed out during {op}")]
    BackendTimeout { server: String, op: &'static str },
    #[error("cache server `{server}` sent an invalid reply to {op}: {reason}")]
    Protocol {
        server: String,
        op: &'static str,
        reason: String,
    },
    #[error("failed to encode or decode cache value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{op} failed on {} of {attempted} cache servers", failures.len())]
    PartialFailure {
        op: &'static str,
        attempted: usize,
        failures: Vec<CacheError>,
    },
    #[error("invalid cache configuration for `{key}`: {reason}")]
    Configuration { key: &'static str, reason: String },
}

impl CacheError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }

    pub fn unavailable(server: impl Into<String>, op: &'static str, reason: impl ToString) -> Self {
        Self::BackendUnavailable {
            server: server.into(),
            op,
            reason: reason.to_string(),
        }
    }

    pub fn timeout(server: impl Into<String>, op: &'static str) -> Self {
        Self::BackendTimeout {
            server: server.into(),
            op,
        }
    }

    pub fn protocol(server: impl Into<String>, op: &'static str, reason: impl Into<String>) -> Self {
        Self::Protocol {
            server: server.into(),
            op,
            reason: reason.into(),
        }
    }

    pub fn configuration(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            key,
            reason: reason.into(),
        }
    }

    /// True when the backend did not answer within the configured timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::BackendTimeout { .. })
    }

    /// True for transient backend failures where retrying an idempotent read may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendTimeout { .. } | Self::BackendUnavailable { .. }
        )
    }

    /// The server address this error refers to, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::BackendUnavailable { server, .. }
            | Self::BackendTimeout { server, .. }
            | Self::Protocol { server, .. } => Some(server),
            _ => None,
        }
    }
}
