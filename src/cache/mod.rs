//! Namespaced memcache caching.
//!
//! A [`MemcacheClient`] stores JSON values under keys derived from a
//! `(namespace, key)` pair, groups entries under dependency tags, and can
//! optionally remember which keys it wrote per namespace.
//!
//! Invalidation can be requested directly on a client or published as an
//! [`InvalidationEvent`] and routed by the [`InvalidationDispatcher`]:
//!
//! ```toml
//! [caches.pages]
//! servers = ["127.0.0.1:11211"]
//! default_namespace = "site"
//! track_keys = true
//! ```

mod client;
mod config;
mod dispatcher;
mod error;
mod events;
mod keys;
pub(crate) mod lock;
mod purge;
mod registry;

pub use client::{
    Invalidation, MemcacheClient, QueryOptions, ServerStatistics, SetOptions,
};
pub use config::{
    BackendKind, ClientConfig, DEFAULT_LIFETIME_SECS, DEFAULT_SERVER, RawClientConfig,
    UntrackedKeys,
};
pub use dispatcher::{DispatchError, DispatchFailure, DispatchReport, InvalidationDispatcher};
pub use error::CacheError;
pub use events::{
    Epoch, EventQueue, InvalidationEvent, MemcacheInvalidation, QueuedEvent, VarnishInvalidation,
};
pub use keys::{
    KeyPart, MAX_KEY_LEN, dependency_index_key, derive, raw_key, validate_backend_key,
};
pub use purge::{LoggingPurgeClient, PurgeClient, PurgeError, PurgeScope};
pub use registry::ClientRegistry;
