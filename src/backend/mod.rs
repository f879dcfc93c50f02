//! Cache backends.
//!
//! A backend owns the connection to a pool of cache servers and routes each
//! key to one of them. The facade in `crate::cache` only talks to backends
//! through `CacheBackend`.

mod memcache;
mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::cache::{BackendKind, CacheError, ClientConfig};

pub use memcache::MemcacheBackend;
pub use memory::MemoryBackend;

/// Expiry times above this many seconds are absolute unix timestamps.
pub const RELATIVE_EXPIRY_LIMIT: u32 = 60 * 60 * 24 * 30;

/// Key/value operations a cache server pool provides.
///
/// Per-key operations are routed to a single server. `flush` and `stats`
/// address one server explicitly so callers can fan out and aggregate.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Configured servers, in configuration order.
    fn servers(&self) -> &[String];

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Store unconditionally. `exptime` follows memcache rules.
    async fn set(&self, key: &str, value: Bytes, exptime: u32) -> Result<(), CacheError>;

    /// Store only if absent; `false` when the key already exists.
    async fn add(&self, key: &str, value: Bytes, exptime: u32) -> Result<bool, CacheError>;

    /// Append to an existing value; `false` when the key is absent.
    async fn append(&self, key: &str, value: Bytes) -> Result<bool, CacheError>;

    /// Remove a key; `false` when it was absent.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Drop every entry on one server.
    async fn flush(&self, server: &str) -> Result<(), CacheError>;

    /// Server-reported statistics for one server.
    async fn stats(&self, server: &str) -> Result<BTreeMap<String, String>, CacheError>;
}

/// Build the backend selected by `config`.
pub fn connect(config: &ClientConfig) -> Arc<dyn CacheBackend> {
    match config.backend {
        BackendKind::Memcache => Arc::new(MemcacheBackend::new(config)),
        BackendKind::Memory => Arc::new(MemoryBackend::new(config)),
    }
}

/// Index of the server responsible for `key`.
///
/// Uses a stable hash so every process agrees on the placement.
pub(crate) fn route(server_count: usize, key: &str) -> usize {
    if server_count <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % server_count as u64) as usize
}
