//! Namespaced cache client.
//!
//! Composes backend keys from (namespace, key) pairs, keeps dependency-tag
//! indexes in the backend, and optionally tracks the keys written per
//! namespace.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::backend::{self, CacheBackend, RELATIVE_EXPIRY_LIMIT};

use super::config::{ClientConfig, UntrackedKeys};
use super::error::CacheError;
use super::keys::{KeyPart, dependency_index_key, derive, raw_key};

const METRIC_QUERY_TOTAL: &str = "tagcache_query_total";
const METRIC_SET_TOTAL: &str = "tagcache_set_total";
const METRIC_INVALIDATE_TOTAL: &str = "tagcache_invalidate_total";

/// Options for [`MemcacheClient::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub lifetime: Option<u32>,
    pub ns: Option<KeyPart>,
    pub raw: bool,
    pub dependencies: Vec<String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifetime(mut self, seconds: u32) -> Self {
        self.lifetime = Some(seconds);
        self
    }

    pub fn ns(mut self, ns: impl Into<KeyPart>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn depends_on(mut self, tag: impl Into<String>) -> Self {
        self.dependencies.push(tag.into());
        self
    }
}

/// Options for [`MemcacheClient::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub ns: Option<KeyPart>,
    pub raw: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ns(mut self, ns: impl Into<KeyPart>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }
}

/// What [`MemcacheClient::invalidate`] should remove.
///
/// Either a key or at least one dependency tag is required; a namespace on
/// its own cannot be invalidated.
#[derive(Debug, Clone, Default)]
pub struct Invalidation {
    pub key: Option<KeyPart>,
    pub ns: Option<KeyPart>,
    pub raw: bool,
    pub dependencies: Vec<String>,
}

impl Invalidation {
    pub fn key(key: impl Into<KeyPart>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn dependencies<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dependencies: tags.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn ns(mut self, ns: impl Into<KeyPart>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }
}

/// Statistics reported by one server.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerStatistics {
    pub server: String,
    /// Empty when the server could not be queried.
    pub stats: BTreeMap<String, String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct TrackedKey {
    key: String,
    composed: String,
}

/// A cache client bound to one server pool.
pub struct MemcacheClient {
    name: String,
    config: ClientConfig,
    backend: Arc<dyn CacheBackend>,
    tracked: DashMap<Option<String>, Vec<TrackedKey>>,
}

impl MemcacheClient {
    /// Create a client over an existing backend.
    pub fn new(
        name: impl Into<String>,
        config: ClientConfig,
        backend: Arc<dyn CacheBackend>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            backend,
            tracked: DashMap::new(),
        })
    }

    /// Create a client with the backend its configuration selects.
    pub fn connect(name: impl Into<String>, config: ClientConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let backend = backend::connect(&config);
        Self::new(name, config, backend)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Statistics for every configured server, in configuration order.
    ///
    /// Unreachable servers are reported with an empty mapping and an error.
    pub async fn get_statistics(&self) -> Vec<ServerStatistics> {
        let servers = self.backend.servers();
        let results = join_all(servers.iter().map(|server| self.backend.stats(server))).await;

        servers
            .iter()
            .zip(results)
            .map(|(server, result)| match result {
                Ok(stats) => ServerStatistics {
                    server: server.clone(),
                    stats,
                    error: None,
                },
                Err(err) => {
                    warn!(cache = %self.name, server = %server, error = %err, "Statistics unavailable");
                    ServerStatistics {
                        server: server.clone(),
                        stats: BTreeMap::new(),
                        error: Some(err.to_string()),
                    }
                }
            })
            .collect()
    }

    /// Store `data` under `key` and return the backend key used.
    pub async fn set<T>(
        &self,
        data: &T,
        key: impl Into<KeyPart>,
        options: SetOptions,
    ) -> Result<String, CacheError>
    where
        T: Serialize + ?Sized,
    {
        let key = key.into();
        let ns = self.effective_ns(options.ns);
        let composed = compose(ns.as_ref(), &key, options.raw)?;
        let payload = Bytes::from(serde_json::to_vec(data)?);
        let lifetime = options.lifetime.unwrap_or(self.config.default_lifetime);

        // Index first: an entry must never exist without its tags.
        for tag in unique(&options.dependencies) {
            self.register_dependency(tag, &composed).await?;
        }

        self.backend
            .set(&composed, payload, exptime(lifetime))
            .await?;

        if self.config.track_keys {
            self.track(ns.as_ref(), &key, &composed);
        }

        counter!(METRIC_SET_TOTAL, "cache" => self.name.clone()).increment(1);
        debug!(
            cache = %self.name,
            namespace = ?ns.as_ref().map(KeyPart::label),
            composed_key = %composed,
            lifetime,
            dependencies = options.dependencies.len(),
            "Cache entry stored"
        );
        Ok(composed)
    }

    /// Look up `key`; `None` when absent, expired, or unreadable.
    pub async fn query<T>(
        &self,
        key: impl Into<KeyPart>,
        options: QueryOptions,
    ) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned,
    {
        let key = key.into();
        let ns = self.effective_ns(options.ns);
        let composed = compose(ns.as_ref(), &key, options.raw)?;

        let value = match self.backend.get(&composed).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(
                        cache = %self.name,
                        composed_key = %composed,
                        error = %err,
                        "Cached value could not be decoded; treating as a miss"
                    );
                    None
                }
            },
            None => None,
        };

        let result = if value.is_some() { "hit" } else { "miss" };
        counter!(METRIC_QUERY_TOTAL, "cache" => self.name.clone(), "result" => result)
            .increment(1);
        Ok(value)
    }

    /// Look up `key`, falling back to `default` on a miss.
    pub async fn query_or<T>(
        &self,
        key: impl Into<KeyPart>,
        default: T,
        options: QueryOptions,
    ) -> Result<T, CacheError>
    where
        T: DeserializeOwned,
    {
        Ok(self.query(key, options).await?.unwrap_or(default))
    }

    /// Remove a single entry or every entry carrying the given tags.
    ///
    /// Returns the number of backend entries that were removed.
    #[instrument(skip(self, request), fields(cache = %self.name))]
    pub async fn invalidate(&self, request: Invalidation) -> Result<usize, CacheError> {
        let Invalidation {
            key,
            ns,
            raw,
            dependencies,
        } = request;

        if key.is_none() && dependencies.is_empty() {
            return Err(CacheError::invalid_argument(
                "invalidating a whole namespace is not supported; give a key or dependencies",
            ));
        }

        let ns = self.effective_ns(ns);
        let single = match &key {
            Some(key) => Some(compose(ns.as_ref(), key, raw)?),
            None => None,
        };

        let mut removed = 0;
        if !dependencies.is_empty() {
            removed += self.invalidate_dependencies(&dependencies).await?;
        }
        if let Some(composed) = single {
            if self.backend.delete(&composed).await? {
                removed += 1;
            }
            self.untrack(|candidate| candidate == composed);
            counter!(METRIC_INVALIDATE_TOTAL, "cache" => self.name.clone(), "kind" => "key")
                .increment(1);
            debug!(composed_key = %composed, "Cache entry invalidated");
        }
        Ok(removed)
    }

    /// Flush every configured server.
    ///
    /// Each server is attempted even if others fail; servers that were
    /// flushed stay flushed.
    #[instrument(skip(self), fields(cache = %self.name))]
    pub async fn invalidate_all(&self) -> Result<(), CacheError> {
        let servers = self.backend.servers();
        let results = join_all(servers.iter().map(|server| self.backend.flush(server))).await;

        let mut failed = HashSet::new();
        let mut failures = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            if let Err(err) = result {
                failed.insert(index);
                failures.push(err);
            }
        }

        let server_count = servers.len();
        self.untrack(|composed| !failed.contains(&backend::route(server_count, composed)));
        counter!(METRIC_INVALIDATE_TOTAL, "cache" => self.name.clone(), "kind" => "all")
            .increment(1);

        if failures.is_empty() {
            info!(servers = server_count, "Cache flushed on all servers");
            return Ok(());
        }
        warn!(
            servers = server_count,
            failed = failures.len(),
            "Cache flush incomplete"
        );
        Err(CacheError::PartialFailure {
            op: "flush_all",
            attempted: server_count,
            failures,
        })
    }

    /// Keys written to `ns` (or the default namespace), in first-write order.
    pub fn keys(&self, ns: Option<KeyPart>) -> Result<Vec<String>, CacheError> {
        if !self.config.track_keys {
            return match self.config.untracked_keys {
                UntrackedKeys::Reject => Err(CacheError::not_supported(format!(
                    "key tracking is disabled for cache `{}`",
                    self.name
                ))),
                UntrackedKeys::Empty => Ok(Vec::new()),
            };
        }

        let label = self.effective_ns(ns).as_ref().map(tracking_label);
        Ok(self
            .tracked
            .get(&label)
            .map(|entries| entries.iter().map(|entry| entry.key.clone()).collect())
            .unwrap_or_default())
    }

    fn effective_ns(&self, ns: Option<KeyPart>) -> Option<KeyPart> {
        ns.or_else(|| self.config.default_namespace.as_deref().map(KeyPart::from))
    }

    async fn register_dependency(&self, tag: &str, composed: &str) -> Result<(), CacheError> {
        let index_key = dependency_index_key(tag);
        let line = Bytes::from(format!("{composed}\n"));

        if self.backend.append(&index_key, line.clone()).await? {
            return Ok(());
        }
        if self.backend.add(&index_key, line.clone(), 0).await? {
            return Ok(());
        }
        // Another writer created the index between our append and add.
        if self.backend.append(&index_key, line).await? {
            return Ok(());
        }
        let servers = self.backend.servers();
        let server = servers[backend::route(servers.len(), &index_key)].clone();
        Err(CacheError::protocol(
            server,
            "append",
            format!("dependency index for `{tag}` could not be updated"),
        ))
    }

    async fn invalidate_dependencies(&self, tags: &[String]) -> Result<usize, CacheError> {
        let mut failures = Vec::new();
        let mut attempted = 0;
        let mut removed = 0;
        let mut invalidated = HashSet::new();

        for tag in unique(tags) {
            let index_key = dependency_index_key(tag);
            attempted += 1;
            let listed = match self.backend.get(&index_key).await {
                Ok(Some(bytes)) => parse_index(&bytes),
                Ok(None) => Vec::new(),
                Err(err) => {
                    failures.push(err);
                    continue;
                }
            };

            let pending: Vec<String> = listed
                .into_iter()
                .filter(|composed| !invalidated.contains(composed))
                .collect();
            attempted += pending.len();
            let results = join_all(pending.iter().map(|composed| self.backend.delete(composed))).await;

            let mut tag_failed = false;
            for (composed, result) in pending.into_iter().zip(results) {
                match result {
                    Ok(deleted) => {
                        if deleted {
                            removed += 1;
                        }
                        invalidated.insert(composed);
                    }
                    Err(err) => {
                        tag_failed = true;
                        failures.push(err);
                    }
                }
            }

            // Keep the index while any of its entries may still be live.
            if !tag_failed {
                if let Err(err) = self.backend.delete(&index_key).await {
                    failures.push(err);
                }
            }
            counter!(METRIC_INVALIDATE_TOTAL, "cache" => self.name.clone(), "kind" => "dependency")
                .increment(1);
            debug!(dependency = tag, "Dependency invalidated");
        }

        self.untrack(|composed| invalidated.contains(composed));

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(CacheError::PartialFailure {
                op: "invalidate_dependencies",
                attempted,
                failures,
            })
        }
    }

    fn track(&self, ns: Option<&KeyPart>, key: &KeyPart, composed: &str) {
        let label = ns.map(tracking_label);
        let mut entries = self.tracked.entry(label).or_default();
        if entries.iter().any(|entry| entry.composed == composed) {
            return;
        }
        entries.push(TrackedKey {
            key: key.label(),
            composed: composed.to_string(),
        });
    }

    fn untrack(&self, mut remove: impl FnMut(&str) -> bool) {
        if !self.config.track_keys {
            return;
        }
        self.tracked.retain(|_, entries| {
            entries.retain(|entry| !remove(&entry.composed));
            !entries.is_empty()
        });
    }
}

/// Namespaces are tracked by their JSON text so `7` and `"7"` stay apart.
fn tracking_label(ns: &KeyPart) -> String {
    ns.as_value().to_string()
}

fn compose(ns: Option<&KeyPart>, key: &KeyPart, raw: bool) -> Result<String, CacheError> {
    if raw {
        raw_key(ns, key)
    } else {
        Ok(derive(ns, key))
    }
}

/// Memcache treats expiry values above thirty days as unix timestamps.
fn exptime(lifetime: u32) -> u32 {
    if lifetime <= RELATIVE_EXPIRY_LIMIT {
        return lifetime;
    }
    let deadline = OffsetDateTime::now_utc().unix_timestamp() + i64::from(lifetime);
    u32::try_from(deadline).unwrap_or(u32::MAX)
}

fn parse_index(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn unique(tags: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    tags.iter()
        .map(String::as_str)
        .filter(|tag| seen.insert(*tag))
        .collect()
}
