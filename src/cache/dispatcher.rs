//! Invalidation dispatcher.
//!
//! Drains invalidation events and turns them into client and purge calls.

use std::sync::Arc;
use std::time::Instant;

use metrics::{gauge, histogram};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::client::MemcacheClient;
use super::error::CacheError;
use super::events::{EventQueue, InvalidationEvent, MemcacheInvalidation};
use super::purge::{PurgeClient, PurgeError, PurgeScope};
use super::registry::ClientRegistry;

const METRIC_DISPATCH_MS: &str = "tagcache_dispatch_ms";
const METRIC_QUEUE_LEN: &str = "tagcache_event_queue_len";
const DEFAULT_BATCH_LIMIT: usize = 100;
const PURGE_TARGET: &str = "reverse-proxy";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Purge(#[from] PurgeError),
    #[error("no cache named `{0}` is registered")]
    UnknownCache(String),
}

/// One target that could not be invalidated.
#[derive(Debug)]
pub struct DispatchFailure {
    pub event_kind: &'static str,
    /// Cache name, or `reverse-proxy` for purge failures.
    pub target: String,
    pub error: DispatchError,
}

/// Outcome of dispatching one or more events.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub events: usize,
    /// Targets invalidated without error.
    pub succeeded: usize,
    pub failures: Vec<DispatchFailure>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn merge(&mut self, other: DispatchReport) {
        self.events += other.events;
        self.succeeded += other.succeeded;
        self.failures.extend(other.failures);
    }

    fn record(&mut self, event_kind: &'static str, target: &str, result: Result<(), DispatchError>) {
        match result {
            Ok(()) => self.succeeded += 1,
            Err(error) => {
                warn!(event_kind, target, error = %error, "Invalidation target failed");
                self.failures.push(DispatchFailure {
                    event_kind,
                    target: target.to_string(),
                    error,
                });
            }
        }
    }
}

/// Routes invalidation events to cache clients and the purge client.
///
/// Every target of an event is attempted; failures are collected in the
/// report instead of aborting the batch.
pub struct InvalidationDispatcher {
    registry: Arc<ClientRegistry>,
    purge: Arc<dyn PurgeClient>,
    queue: Arc<EventQueue>,
    batch_limit: usize,
}

impl InvalidationDispatcher {
    pub fn new(
        registry: Arc<ClientRegistry>,
        purge: Arc<dyn PurgeClient>,
        queue: Arc<EventQueue>,
    ) -> Self {
        Self {
            registry,
            purge,
            queue,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    /// Maximum events handled per `consume` call.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// Publish an event and optionally dispatch the pending batch right away.
    pub async fn trigger(&self, event: InvalidationEvent, consume_now: bool) -> Uuid {
        let id = self.queue.publish(event);
        if consume_now {
            self.consume().await;
        }
        id
    }

    /// Dispatch one batch of pending events.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> DispatchReport {
        let events = self.queue.drain(self.batch_limit);
        gauge!(METRIC_QUEUE_LEN).set(self.queue.len() as f64);
        if events.is_empty() {
            return DispatchReport::default();
        }

        let started_at = Instant::now();
        let event_ids: Vec<Uuid> = events.iter().map(|queued| queued.id).collect();
        info!(
            event_count = events.len(),
            event_ids = ?event_ids,
            "Invalidation dispatch starting"
        );

        let mut report = DispatchReport::default();
        for queued in events {
            report.merge(self.dispatch(&queued.event).await);
        }

        info!(
            event_count = report.events,
            succeeded = report.succeeded,
            failed = report.failures.len(),
            "Invalidation dispatch complete"
        );
        histogram!(METRIC_DISPATCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        report
    }

    /// Dispatch a single event immediately, bypassing the queue.
    pub async fn dispatch(&self, event: &InvalidationEvent) -> DispatchReport {
        let mut report = DispatchReport {
            events: 1,
            ..Default::default()
        };
        let kind = event.kind();

        match event {
            InvalidationEvent::Memcache(request) => {
                self.dispatch_memcache(kind, request, &mut report).await;
            }
            InvalidationEvent::Varnish(request) => {
                let result = self.purge.purge(&request.scope).await.map_err(Into::into);
                report.record(kind, PURGE_TARGET, result);
            }
            InvalidationEvent::Everything => {
                for client in self.registry.clients() {
                    let result = client.invalidate_all().await.map_err(Into::into);
                    report.record(kind, client.name(), result);
                }
                let result = self.purge.purge(&PurgeScope::All).await.map_err(Into::into);
                report.record(kind, PURGE_TARGET, result);
            }
        }
        report
    }

    async fn dispatch_memcache(
        &self,
        kind: &'static str,
        request: &MemcacheInvalidation,
        report: &mut DispatchReport,
    ) {
        let targets: Vec<Arc<MemcacheClient>> = match &request.cache_name {
            Some(name) => match self.registry.get(name) {
                Some(client) => vec![client],
                None => {
                    report.record(kind, name, Err(DispatchError::UnknownCache(name.clone())));
                    return;
                }
            },
            None => self.registry.clients(),
        };

        for client in targets {
            let result = client.invalidate(request.to_request()).await.map(|_| ());
            report.record(kind, client.name(), result.map_err(Into::into));
        }
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }
}
