//! Cache invalidation events.
//!
//! Defines the invalidation event variants and an in-memory queue that
//! writers publish to and the dispatcher drains.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::client::Invalidation;
use super::keys::KeyPart;
use super::lock::mutex_lock;
use super::purge::PurgeScope;

const SOURCE: &str = "cache::events";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// Invalidate entries in one named memcache client, or in all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemcacheInvalidation {
    /// Target client; `None` targets every registered client.
    pub cache_name: Option<String>,
    pub key: Option<String>,
    pub ns: Option<String>,
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl MemcacheInvalidation {
    /// The client request this event translates to.
    pub fn to_request(&self) -> Invalidation {
        Invalidation {
            key: self.key.as_deref().map(KeyPart::from),
            ns: self.ns.as_deref().map(KeyPart::from),
            raw: self.raw,
            dependencies: self.dependencies.clone(),
        }
    }
}

/// Purge the reverse-proxy cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarnishInvalidation {
    #[serde(default)]
    pub scope: PurgeScope,
}

/// An invalidation request handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidationEvent {
    Memcache(MemcacheInvalidation),
    Varnish(VarnishInvalidation),
    /// Flush every memcache client and purge the reverse proxy.
    Everything,
}

impl InvalidationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memcache(_) => "memcache",
            Self::Varnish(_) => "varnish",
            Self::Everything => "everything",
        }
    }
}

/// A published event with idempotency and ordering metadata.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub event: InvalidationEvent,
    pub timestamp: OffsetDateTime,
}

impl QueuedEvent {
    pub fn new(event: InvalidationEvent, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            event,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// In-memory FIFO of invalidation events.
pub struct EventQueue {
    queue: Mutex<VecDeque<QueuedEvent>>,
    epoch_counter: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an event and return its id.
    pub fn publish(&self, event: InvalidationEvent) -> Uuid {
        let queued = QueuedEvent::new(event, self.next_epoch());
        let id = queued.id;

        info!(
            event_id = %queued.id,
            event_epoch = queued.epoch,
            event_kind = queued.event.kind(),
            "Invalidation event enqueued"
        );

        mutex_lock(&self.queue, SOURCE, "publish").push_back(queued);
        id
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<QueuedEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn memcache_event(key: &str) -> InvalidationEvent {
        InvalidationEvent::Memcache(MemcacheInvalidation {
            key: Some(key.to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn epochs_increase() {
        let queue = EventQueue::new();
        let e1 = queue.next_epoch();
        let e2 = queue.next_epoch();
        assert!(e1 < e2);
    }

    #[test]
    fn publish_and_drain_in_order() {
        let queue = EventQueue::new();
        let first = queue.publish(memcache_event("a"));
        queue.publish(InvalidationEvent::Varnish(VarnishInvalidation::default()));
        queue.publish(InvalidationEvent::Everything);
        assert_eq!(queue.len(), 3);

        let events = queue.drain(2);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, first);
        assert_eq!(events[0].event, memcache_event("a"));
        assert_eq!(events[1].event.kind(), "varnish");
        assert!(events[0].epoch < events[1].epoch);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_more_than_available() {
        let queue = EventQueue::new();
        queue.publish(InvalidationEvent::Everything);
        assert_eq!(queue.drain(100).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_queue() {
        let queue = EventQueue::new();
        queue.publish(InvalidationEvent::Everything);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn memcache_event_translates_to_request() {
        let event = MemcacheInvalidation {
            cache_name: Some("pages".to_string()),
            key: Some("front".to_string()),
            ns: Some("site".to_string()),
            raw: true,
            dependencies: vec!["posts".to_string()],
        };
        let request = event.to_request();
        assert_eq!(request.key, Some(KeyPart::from("front")));
        assert_eq!(request.ns, Some(KeyPart::from("site")));
        assert!(request.raw);
        assert_eq!(request.dependencies, vec!["posts".to_string()]);

        let bare = MemcacheInvalidation {
            ns: Some("site".to_string()),
            ..Default::default()
        }
        .to_request();
        assert_eq!(bare.key, None);
        assert_eq!(bare.ns, Some(KeyPart::from("site")));
        assert!(bare.dependencies.is_empty());
    }

    #[test]
    fn events_deserialize_from_tagged_json() {
        let event: InvalidationEvent = serde_json::from_str(
            r#"{"kind":"memcache","cache_name":null,"key":"k","ns":null,"dependencies":["t"]}"#,
        )
        .expect("memcache event");
        assert_eq!(
            event,
            InvalidationEvent::Memcache(MemcacheInvalidation {
                key: Some("k".to_string()),
                dependencies: vec!["t".to_string()],
                ..Default::default()
            })
        );

        let everything: InvalidationEvent =
            serde_json::from_str(r#"{"kind":"everything"}"#).expect("everything event");
        assert_eq!(everything, InvalidationEvent::Everything);
    }

    #[test]
    fn event_queue_recovers_from_poisoned_lock() {
        let queue = EventQueue::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.publish(InvalidationEvent::Everything);
        assert_eq!(queue.len(), 1);
    }
}
