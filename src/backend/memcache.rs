//! Memcache server pool backed by `async_memcached`.
//!
//! Keeps one lazily opened client per server. A client whose call fails
//! at the transport level or times out is dropped and reopened by the next
//! call. Lock acquisition, connecting and the call itself all share one
//! timeout.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_memcached::{AsciiProtocol, Client, Error as MemcachedError, Status, Value};
use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::{CacheError, ClientConfig};

use super::{CacheBackend, route};

const METRIC_BACKEND_MS: &str = "tagcache_backend_ms";
const METRIC_BACKEND_ERRORS: &str = "tagcache_backend_error_total";

/// One request against a single server.
#[derive(Debug, Clone, Copy)]
enum Command<'a> {
    Get { key: &'a str },
    Set { key: &'a str, value: &'a [u8], exptime: u32 },
    Add { key: &'a str, value: &'a [u8], exptime: u32 },
    Append { key: &'a str, value: &'a [u8] },
    Delete { key: &'a str },
    FlushAll,
    Stats,
}

impl Command<'_> {
    fn op(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Set { .. } => "set",
            Self::Add { .. } => "add",
            Self::Append { .. } => "append",
            Self::Delete { .. } => "delete",
            Self::FlushAll => "flush_all",
            Self::Stats => "stats",
        }
    }
}

#[derive(Debug)]
enum Reply {
    Value(Option<Bytes>),
    Stored(bool),
    Deleted(bool),
    Done,
    Stats(BTreeMap<String, String>),
}

enum ExchangeError {
    Connect(MemcachedError),
    Call(MemcachedError),
}

/// Memcache server pool client.
pub struct MemcacheBackend {
    servers: Vec<String>,
    connections: Vec<Mutex<Option<Client>>>,
    timeout: Duration,
}

impl MemcacheBackend {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            connections: config.servers.iter().map(|_| Mutex::new(None)).collect(),
            timeout: config.timeout,
        }
    }

    fn server_index(&self, server: &str, op: &'static str) -> Result<usize, CacheError> {
        self.servers
            .iter()
            .position(|candidate| candidate == server)
            .ok_or_else(|| CacheError::unavailable(server, op, "server is not configured"))
    }

    async fn execute(&self, index: usize, command: Command<'_>) -> Result<Reply, CacheError> {
        let server = self.servers[index].as_str();
        let op = command.op();
        let started_at = Instant::now();

        let outcome = timeout(
            self.timeout,
            exchange(&self.connections[index], server, command),
        )
        .await;

        histogram!(METRIC_BACKEND_MS, "op" => op)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        let error = match outcome {
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(ExchangeError::Connect(err))) => CacheError::unavailable(server, op, err),
            Ok(Err(ExchangeError::Call(MemcachedError::Io(err)))) => {
                CacheError::unavailable(server, op, err)
            }
            Ok(Err(ExchangeError::Call(err))) => CacheError::protocol(server, op, err.to_string()),
            Err(_) => CacheError::timeout(server, op),
        };

        counter!(METRIC_BACKEND_ERRORS, "op" => op).increment(1);
        warn!(server, op, error = %error, "Cache server call failed");
        Err(error)
    }
}

/// Run `command` on the server's client, opening it first if needed.
///
/// The client is taken out of its slot for the duration of the call and is
/// only put back after a complete reply. A cancelled or broken call drops it.
async fn exchange(
    slot: &Mutex<Option<Client>>,
    server: &str,
    command: Command<'_>,
) -> Result<Reply, ExchangeError> {
    let mut slot = slot.lock().await;
    let mut client = match slot.take() {
        Some(client) => client,
        None => {
            let dsn = format!("tcp://{server}");
            let client = Client::new(dsn.as_str())
                .await
                .map_err(ExchangeError::Connect)?;
            debug!(server, "Opened cache server connection");
            client
        }
    };

    let result = perform(&mut client, command).await;
    match &result {
        Ok(_) | Err(MemcachedError::Protocol(_)) => *slot = Some(client),
        Err(_) => debug!(server, "Dropped cache server connection"),
    }
    result.map_err(ExchangeError::Call)
}

async fn perform(client: &mut Client, command: Command<'_>) -> Result<Reply, MemcachedError> {
    match command {
        Command::Get { key } => Ok(Reply::Value(client.get(key).await?.map(payload))),
        Command::Set {
            key,
            value,
            exptime,
        } => {
            client
                .set(key, value, Some(i64::from(exptime)), None)
                .await?;
            Ok(Reply::Stored(true))
        }
        Command::Add {
            key,
            value,
            exptime,
        } => match client.add(key, value, Some(i64::from(exptime)), None).await {
            Ok(()) => Ok(Reply::Stored(true)),
            Err(MemcachedError::Protocol(Status::NotStored)) => Ok(Reply::Stored(false)),
            Err(err) => Err(err),
        },
        // Read and rewrite while holding the server's slot, so appends from
        // this process never interleave. Appended keys never expire.
        Command::Append { key, value } => match client.get(key).await? {
            Some(existing) => {
                let mut joined = payload(existing).to_vec();
                joined.extend_from_slice(value);
                client.set(key, joined.as_slice(), Some(0), None).await?;
                Ok(Reply::Stored(true))
            }
            None => Ok(Reply::Stored(false)),
        },
        Command::Delete { key } => match client.delete(key).await {
            Ok(()) => Ok(Reply::Deleted(true)),
            Err(MemcachedError::Protocol(Status::NotFound)) => Ok(Reply::Deleted(false)),
            Err(err) => Err(err),
        },
        Command::FlushAll => {
            client.flush_all().await?;
            Ok(Reply::Done)
        }
        Command::Stats => Ok(Reply::Stats(client.stats().await?.into_iter().collect())),
    }
}

fn payload(value: Value) -> Bytes {
    Bytes::from(value.data.unwrap_or_default())
}

fn unexpected(server: &str, op: &'static str, reply: Reply) -> CacheError {
    CacheError::protocol(server, op, format!("unexpected reply {reply:?}"))
}

#[async_trait]
impl CacheBackend for MemcacheBackend {
    fn servers(&self) -> &[String] {
        &self.servers
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let index = route(self.servers.len(), key);
        match self.execute(index, Command::Get { key }).await? {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected(&self.servers[index], "get", other)),
        }
    }

    async fn set(&self, key: &str, value: Bytes, exptime: u32) -> Result<(), CacheError> {
        let index = route(self.servers.len(), key);
        let command = Command::Set {
            key,
            value: &value,
            exptime,
        };
        match self.execute(index, command).await? {
            Reply::Stored(true) => Ok(()),
            other => Err(unexpected(&self.servers[index], "set", other)),
        }
    }

    async fn add(&self, key: &str, value: Bytes, exptime: u32) -> Result<bool, CacheError> {
        let index = route(self.servers.len(), key);
        let command = Command::Add {
            key,
            value: &value,
            exptime,
        };
        match self.execute(index, command).await? {
            Reply::Stored(stored) => Ok(stored),
            other => Err(unexpected(&self.servers[index], "add", other)),
        }
    }

    async fn append(&self, key: &str, value: Bytes) -> Result<bool, CacheError> {
        let index = route(self.servers.len(), key);
        let command = Command::Append { key, value: &value };
        match self.execute(index, command).await? {
            Reply::Stored(stored) => Ok(stored),
            other => Err(unexpected(&self.servers[index], "append", other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let index = route(self.servers.len(), key);
        match self.execute(index, Command::Delete { key }).await? {
            Reply::Deleted(deleted) => Ok(deleted),
            other => Err(unexpected(&self.servers[index], "delete", other)),
        }
    }

    async fn flush(&self, server: &str) -> Result<(), CacheError> {
        let index = self.server_index(server, "flush_all")?;
        match self.execute(index, Command::FlushAll).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(server, "flush_all", other)),
        }
    }

    async fn stats(&self, server: &str) -> Result<BTreeMap<String, String>, CacheError> {
        let index = self.server_index(server, "stats")?;
        match self.execute(index, Command::Stats).await? {
            Reply::Stats(stats) => Ok(stats),
            other => Err(unexpected(server, "stats", other)),
        }
    }
}
