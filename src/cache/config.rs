//! Client configuration.
//!
//! One `ClientConfig` describes a single named cache: its server pool,
//! default namespace and lifetime, and whether keys are tracked.

use std::time::Duration;

use serde::Deserialize;

use super::error::CacheError;

pub const DEFAULT_SERVER: &str = "127.0.0.1:11211";
pub const DEFAULT_LIFETIME_SECS: u32 = 3600;
const DEFAULT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

/// Which backend a client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Memcache servers over TCP.
    #[default]
    Memcache,
    /// In-process emulation of the server pool.
    Memory,
}

/// Behavior of `keys()` when key tracking is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UntrackedKeys {
    /// Fail with `CacheError::NotSupported`.
    #[default]
    Reject,
    /// Return an empty list.
    Empty,
}

/// Configuration of one cache client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Servers as `host:port`.
    pub servers: Vec<String>,
    /// Namespace used when a call does not name one.
    pub default_namespace: Option<String>,
    /// Lifetime in seconds used when a call does not give one. Zero means no expiry.
    pub default_lifetime: u32,
    /// Enables `keys()`.
    pub track_keys: bool,
    /// Per-call network timeout.
    pub timeout: Duration,
    pub backend: BackendKind,
    /// Entries per emulated server for the memory backend.
    pub memory_capacity: usize,
    pub untracked_keys: UntrackedKeys,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_SERVER.to_string()],
            default_namespace: None,
            default_lifetime: DEFAULT_LIFETIME_SECS,
            track_keys: false,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            backend: BackendKind::Memcache,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            untracked_keys: UntrackedKeys::Reject,
        }
    }
}

/// Unvalidated client settings as they appear in configuration files.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawClientConfig {
    pub servers: Option<Vec<String>>,
    pub default_namespace: Option<String>,
    pub default_lifetime: Option<i64>,
    pub track_keys: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub backend: Option<BackendKind>,
    pub memory_capacity: Option<usize>,
    pub untracked_keys: Option<UntrackedKeys>,
}

impl TryFrom<RawClientConfig> for ClientConfig {
    type Error = CacheError;

    fn try_from(raw: RawClientConfig) -> Result<Self, Self::Error> {
        let defaults = ClientConfig::default();

        let default_lifetime = match raw.default_lifetime {
            Some(value) if value < 0 => {
                return Err(CacheError::configuration(
                    "default_lifetime",
                    "must be zero or greater",
                ));
            }
            Some(value) => u32::try_from(value).map_err(|_| {
                CacheError::configuration("default_lifetime", "value exceeds supported range")
            })?,
            None => defaults.default_lifetime,
        };

        let timeout = match raw.timeout_ms {
            Some(0) => {
                return Err(CacheError::configuration(
                    "timeout_ms",
                    "must be greater than zero",
                ));
            }
            Some(ms) => Duration::from_millis(ms),
            None => defaults.timeout,
        };

        let default_namespace = raw.default_namespace.and_then(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        });

        let config = Self {
            servers: raw.servers.unwrap_or(defaults.servers),
            default_namespace,
            default_lifetime,
            track_keys: raw.track_keys.unwrap_or(defaults.track_keys),
            timeout,
            backend: raw.backend.unwrap_or_default(),
            memory_capacity: raw.memory_capacity.unwrap_or(defaults.memory_capacity),
            untracked_keys: raw.untracked_keys.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }
}

impl ClientConfig {
    /// Check the invariants a client relies on.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.servers.is_empty() {
            return Err(CacheError::configuration(
                "servers",
                "at least one server is required",
            ));
        }
        for server in &self.servers {
            validate_server(server)?;
        }
        if self.timeout.is_zero() {
            return Err(CacheError::configuration(
                "timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.memory_capacity == 0 {
            return Err(CacheError::configuration(
                "memory_capacity",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn validate_server(server: &str) -> Result<(), CacheError> {
    let Some((host, port)) = server.rsplit_once(':') else {
        return Err(CacheError::configuration(
            "servers",
            format!("`{server}` is not in <hostname>:<port> form"),
        ));
    };
    if host.trim().is_empty() {
        return Err(CacheError::configuration(
            "servers",
            format!("`{server}` has an empty hostname"),
        ));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(CacheError::configuration(
            "servers",
            format!("`{server}` has an invalid port"),
        )),
        Ok(_) => Ok(()),
    }
}
