//! Named cache clients.
//!
//! The caller owns the registry and passes it to whatever needs to resolve
//! a cache by name, such as the invalidation dispatcher.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::client::MemcacheClient;
use super::config::ClientConfig;
use super::error::CacheError;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

/// Maps cache names to client instances.
pub struct ClientRegistry {
    clients: RwLock<BTreeMap<String, Arc<MemcacheClient>>>,
}

impl ClientRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(BTreeMap::new()),
        }
    }

    /// Connect one client per configuration entry.
    pub fn from_configs<I>(configs: I) -> Result<Self, CacheError>
    where
        I: IntoIterator<Item = (String, ClientConfig)>,
    {
        let registry = Self::new();
        for (name, config) in configs {
            registry.register(Arc::new(MemcacheClient::connect(name, config)?));
        }
        Ok(registry)
    }

    /// Register a client under its own name, returning any client it replaced.
    pub fn register(&self, client: Arc<MemcacheClient>) -> Option<Arc<MemcacheClient>> {
        rw_write(&self.clients, SOURCE, "register").insert(client.name().to_string(), client)
    }

    pub fn get(&self, name: &str) -> Option<Arc<MemcacheClient>> {
        rw_read(&self.clients, SOURCE, "get").get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<MemcacheClient>> {
        rw_write(&self.clients, SOURCE, "remove").remove(name)
    }

    /// All clients, ordered by name.
    pub fn clients(&self) -> Vec<Arc<MemcacheClient>> {
        rw_read(&self.clients, SOURCE, "clients")
            .values()
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        rw_read(&self.clients, SOURCE, "names")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.clients, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
