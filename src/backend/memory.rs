//! In-process backend emulating a memcache server pool.
//!
//! Each configured server gets its own LRU store, so routing, per-server
//! flushes, and per-server failures behave as they do against real servers.

use std::collections::{BTreeMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use time::OffsetDateTime;

use crate::cache::lock::{mutex_lock, rw_read, rw_write};
use crate::cache::{CacheError, ClientConfig};

use super::{CacheBackend, RELATIVE_EXPIRY_LIMIT, route};

const SOURCE: &str = "backend::memory";

#[derive(Clone)]
struct Stored {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

#[derive(Default)]
struct Counters {
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    delete_hits: AtomicU64,
    delete_misses: AtomicU64,
    evictions: AtomicU64,
    cmd_flush: AtomicU64,
}

struct Shard {
    entries: Mutex<LruCache<String, Stored>>,
    counters: Counters,
}

/// Memory-backed server pool.
pub struct MemoryBackend {
    servers: Vec<String>,
    shards: Vec<Shard>,
    capacity: NonZeroUsize,
    unreachable: RwLock<HashSet<String>>,
}

impl MemoryBackend {
    pub fn new(config: &ClientConfig) -> Self {
        let capacity = NonZeroUsize::new(config.memory_capacity).unwrap_or(NonZeroUsize::MIN);
        let shards = config
            .servers
            .iter()
            .map(|_| Shard {
                entries: Mutex::new(LruCache::new(capacity)),
                counters: Counters::default(),
            })
            .collect();
        Self {
            servers: config.servers.clone(),
            shards,
            capacity,
            unreachable: RwLock::new(HashSet::new()),
        }
    }

    /// Simulate a server going away or coming back.
    pub fn set_reachable(&self, server: &str, reachable: bool) {
        let mut unreachable = rw_write(&self.unreachable, SOURCE, "set_reachable");
        if reachable {
            unreachable.remove(server);
        } else {
            unreachable.insert(server.to_string());
        }
    }

    /// Number of live entries across all servers.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                mutex_lock(&shard.entries, SOURCE, "len")
                    .iter()
                    .filter(|(_, stored)| stored.is_live(now))
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard_for_key(&self, key: &str, op: &'static str) -> Result<&Shard, CacheError> {
        let index = route(self.servers.len(), key);
        self.check_reachable(&self.servers[index], op)?;
        Ok(&self.shards[index])
    }

    fn shard_for_server(&self, server: &str, op: &'static str) -> Result<&Shard, CacheError> {
        let index = self
            .servers
            .iter()
            .position(|candidate| candidate == server)
            .ok_or_else(|| CacheError::unavailable(server, op, "server is not configured"))?;
        self.check_reachable(server, op)?;
        Ok(&self.shards[index])
    }

    fn check_reachable(&self, server: &str, op: &'static str) -> Result<(), CacheError> {
        if rw_read(&self.unreachable, SOURCE, "check_reachable").contains(server) {
            return Err(CacheError::unavailable(server, op, "connection refused"));
        }
        Ok(())
    }

    /// Store into an already locked shard.
    fn put(
        shard: &Shard,
        entries: &mut LruCache<String, Stored>,
        key: &str,
        value: Bytes,
        exptime: u32,
    ) {
        shard.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        let stored = Stored {
            value,
            expires_at: expiry_deadline(exptime),
        };
        if let Some((evicted, _)) = entries.push(key.to_string(), stored)
            && evicted != key
        {
            shard.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Convert a memcache expiry time into a deadline; `None` never expires.
fn expiry_deadline(exptime: u32) -> Option<Instant> {
    if exptime == 0 {
        return None;
    }
    let now = Instant::now();
    if exptime <= RELATIVE_EXPIRY_LIMIT {
        return Some(now + Duration::from_secs(u64::from(exptime)));
    }
    let remaining = i64::from(exptime) - OffsetDateTime::now_utc().unix_timestamp();
    if remaining <= 0 {
        Some(now)
    } else {
        Some(now + Duration::from_secs(remaining as u64))
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn servers(&self) -> &[String] {
        &self.servers
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let shard = self.shard_for_key(key, "get")?;
        shard.counters.cmd_get.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut entries = mutex_lock(&shard.entries, SOURCE, "get");
        let found = entries
            .get(key)
            .map(|stored| (stored.is_live(now), stored.value.clone()));
        let value = match found {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        drop(entries);

        let counter = if value.is_some() {
            &shard.counters.get_hits
        } else {
            &shard.counters.get_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set(&self, key: &str, value: Bytes, exptime: u32) -> Result<(), CacheError> {
        let shard = self.shard_for_key(key, "set")?;
        let mut entries = mutex_lock(&shard.entries, SOURCE, "set");
        Self::put(shard, &mut entries, key, value, exptime);
        Ok(())
    }

    async fn add(&self, key: &str, value: Bytes, exptime: u32) -> Result<bool, CacheError> {
        let shard = self.shard_for_key(key, "add")?;
        let now = Instant::now();
        let mut entries = mutex_lock(&shard.entries, SOURCE, "add");
        if entries.peek(key).is_some_and(|stored| stored.is_live(now)) {
            return Ok(false);
        }
        Self::put(shard, &mut entries, key, value, exptime);
        Ok(true)
    }

    async fn append(&self, key: &str, value: Bytes) -> Result<bool, CacheError> {
        let shard = self.shard_for_key(key, "append")?;
        let now = Instant::now();
        let mut entries = mutex_lock(&shard.entries, SOURCE, "append");
        match entries.get_mut(key) {
            Some(stored) if stored.is_live(now) => {
                let mut combined = BytesMut::with_capacity(stored.value.len() + value.len());
                combined.extend_from_slice(&stored.value);
                combined.extend_from_slice(&value);
                stored.value = combined.freeze();
                shard.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let shard = self.shard_for_key(key, "delete")?;
        let now = Instant::now();
        let removed = mutex_lock(&shard.entries, SOURCE, "delete")
            .pop(key)
            .is_some_and(|stored| stored.is_live(now));
        let counter = if removed {
            &shard.counters.delete_hits
        } else {
            &shard.counters.delete_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(removed)
    }

    async fn flush(&self, server: &str) -> Result<(), CacheError> {
        let shard = self.shard_for_server(server, "flush_all")?;
        mutex_lock(&shard.entries, SOURCE, "flush").clear();
        shard.counters.cmd_flush.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn stats(&self, server: &str) -> Result<BTreeMap<String, String>, CacheError> {
        let shard = self.shard_for_server(server, "stats")?;
        let curr_items = mutex_lock(&shard.entries, SOURCE, "stats").len();
        let counters = &shard.counters;

        let mut stats = BTreeMap::new();
        let mut record = |name: &str, value: String| {
            stats.insert(name.to_string(), value);
        };
        record("curr_items", curr_items.to_string());
        record("limit_items", self.capacity.get().to_string());
        record("cmd_get", counters.cmd_get.load(Ordering::Relaxed).to_string());
        record("cmd_set", counters.cmd_set.load(Ordering::Relaxed).to_string());
        record("cmd_flush", counters.cmd_flush.load(Ordering::Relaxed).to_string());
        record("get_hits", counters.get_hits.load(Ordering::Relaxed).to_string());
        record("get_misses", counters.get_misses.load(Ordering::Relaxed).to_string());
        record("delete_hits", counters.delete_hits.load(Ordering::Relaxed).to_string());
        record(
            "delete_misses",
            counters.delete_misses.load(Ordering::Relaxed).to_string(),
        );
        record("evictions", counters.evictions.load(Ordering::Relaxed).to_string());
        Ok(stats)
    }
}
