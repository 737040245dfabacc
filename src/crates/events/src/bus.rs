//! In-process event bus
//!
//! Publishing stamps the envelope, redacts the payload, appends to the
//! durable log and fans out to subscribers. The publisher never waits on a
//! subscriber: a full queue drops the event for that subscriber only and
//! bumps a counter. A broadcast tap feeds external streamers (WebSocket).

use crate::envelope::{Event, EventDraft, SCHEMA_VERSION};
use crate::log::EventLog;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tooling::redact::{redact_value, RedactionCounters, MAX_STR_LEN_LOG};
use uuid::Uuid;

/// Default per-subscriber queue capacity
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Capacity of the broadcast tap for external streamers
const BROADCAST_CAPACITY: usize = 1024;

struct SubscriberHandle {
    name: String,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// A named, bounded subscription to the bus
pub struct Subscription {
    /// Subscriber name, used in drop counters
    pub name: String,
    /// Receiving end of the bounded queue
    pub rx: mpsc::Receiver<Event>,
}

/// Point-in-time bus statistics
#[derive(Debug, Clone)]
pub struct BusStats {
    /// Events published since startup
    pub published_total: u64,
    /// Events published with a kind unknown to this build
    pub quarantined_total: u64,
    /// Durable log append failures
    pub log_append_failures: u64,
    /// Dropped events per slow subscriber
    pub dropped_by_subscriber: HashMap<String, u64>,
    /// Keys dropped by publish-boundary redaction
    pub redaction_denied_keys: u64,
    /// Strings hashed by publish-boundary redaction
    pub redaction_truncated: u64,
}

impl BusStats {
    /// Total events dropped across all subscribers
    pub fn dropped_total(&self) -> u64 {
        self.dropped_by_subscriber.values().sum()
    }
}

/// The in-process event bus
pub struct EventBus {
    log: Arc<EventLog>,
    next_seq: AtomicU64,
    publish_lock: Mutex<()>,
    subscribers: RwLock<Vec<SubscriberHandle>>,
    broadcast_tx: broadcast::Sender<Event>,
    redaction: RedactionCounters,
    dropped: DashMap<String, Arc<AtomicU64>>,
    published: AtomicU64,
    quarantined: AtomicU64,
    append_failures: AtomicU64,
}

impl EventBus {
    /// Create a bus over a durable log, continuing the sequence from the
    /// highest number already in the log.
    pub fn new(log: Arc<EventLog>) -> Self {
        let initial_seq = log.last_seq().ok().flatten().unwrap_or(0);
        Self::with_initial_seq(log, initial_seq)
    }

    /// Create a bus with an explicit starting sequence number.
    pub fn with_initial_seq(log: Arc<EventLog>, last_seq: u64) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            log,
            next_seq: AtomicU64::new(last_seq + 1),
            publish_lock: Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
            broadcast_tx,
            redaction: RedactionCounters::new(),
            dropped: DashMap::new(),
            published: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            append_failures: AtomicU64::new(0),
        }
    }

    /// Register a subscriber with a bounded queue.
    pub fn subscribe(&self, name: impl Into<String>, capacity: usize) -> Subscription {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = self
            .dropped
            .entry(name.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();

        self.subscribers.write().push(SubscriberHandle {
            name: name.clone(),
            tx,
            dropped,
        });

        Subscription { name, rx }
    }

    /// Tap the bus for external streamers.
    ///
    /// Broadcast receivers that lag are skipped by the channel itself; the
    /// durable log remains the source for catching up.
    pub fn tap(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    /// Publish an event.
    ///
    /// Never fails from the caller's point of view: redaction, stamping,
    /// the durable append and fan-out all happen here, and a failing log
    /// append is counted rather than surfaced. Returns the stamped event.
    pub fn publish(&self, draft: EventDraft) -> Event {
        let payload = redact_value(draft.payload, MAX_STR_LEN_LOG, &self.redaction);

        if draft.kind.is_other() {
            self.quarantined.fetch_add(1, Ordering::Relaxed);
        }

        // Single publish path: sequence assignment, durable append and
        // fan-out stay in publish order for every subscriber.
        let _guard = self.publish_lock.lock();

        let event = Event {
            event_id: draft.event_id.unwrap_or_else(Uuid::new_v4),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            ts: Utc::now(),
            kind: draft.kind,
            schema_version: SCHEMA_VERSION,
            conversation_id: draft.conversation_id,
            trace_id: draft.trace_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            payload,
        };

        if let Err(e) = self.log.append(&event) {
            self.append_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Durable log append failed for {}: {}", event.kind, e);
        }

        let mut saw_closed = false;
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter() {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        sub.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Subscriber {} is full, dropping {}", sub.name, event.kind);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        saw_closed = true;
                    }
                }
            }
        }
        if saw_closed {
            self.subscribers.write().retain(|s| !s.tx.is_closed());
        }

        let _ = self.broadcast_tx.send(event.clone());
        self.published.fetch_add(1, Ordering::Relaxed);

        event
    }

    /// The durable log behind this bus.
    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Sequence number the next published event will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }

    /// Snapshot of bus counters.
    pub fn stats(&self) -> BusStats {
        BusStats {
            published_total: self.published.load(Ordering::Relaxed),
            quarantined_total: self.quarantined.load(Ordering::Relaxed),
            log_append_failures: self.append_failures.load(Ordering::Relaxed),
            dropped_by_subscriber: self
                .dropped
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            redaction_denied_keys: self.redaction.denied_key_dropped(),
            redaction_truncated: self.redaction.string_truncated(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventKind;
    use serde_json::json;

    fn make_bus(dir: &std::path::Path) -> EventBus {
        let log = Arc::new(EventLog::new(dir).unwrap());
        EventBus::new(log)
    }

    #[tokio::test]
    async fn test_publish_stamps_and_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let bus = make_bus(dir.path());
        let mut sub = bus.subscribe("gml", 16);

        let event = bus.publish(
            EventDraft::new(EventKind::ChatMessage)
                .with_conversation("conv-1")
                .with_payload(json!({"x": 1})),
        );

        assert_eq!(event.seq, 1);
        assert_eq!(event.schema_version, SCHEMA_VERSION);

        let received = sub.rx.recv().await.unwrap();
        assert_eq!(received.event_id, event.event_id);
        assert_eq!(received.payload, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_payload_redacted_before_subscribers_see_it() {
        let dir = tempfile::tempdir().unwrap();
        let bus = make_bus(dir.path());
        let mut sub = bus.subscribe("gml", 16);

        bus.publish(
            EventDraft::new(EventKind::ChatMessage)
                .with_payload(json!({"prompt": "secret", "x": 1})),
        );

        let received = sub.rx.recv().await.unwrap();
        assert_eq!(received.payload, json!({"x": 1}));
        assert_eq!(bus.stats().redaction_denied_keys, 1);
    }

    #[tokio::test]
    async fn test_denied_payload_absent_from_durable_log() {
        let dir = tempfile::tempdir().unwrap();
        let bus = make_bus(dir.path());

        bus.publish(
            EventDraft::new(EventKind::ChatMessage)
                .with_payload(json!({"prompt": "secret", "x": 1})),
        );

        let content = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| std::fs::read_to_string(e.unwrap().path()).unwrap())
            .collect::<String>();
        assert!(!content.contains("secret"));
        assert!(content.contains("\"x\":1"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_not_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let bus = make_bus(dir.path());
        let mut slow = bus.subscribe("slow", 2);
        let mut fast = bus.subscribe("fast", 16);

        for i in 0..5 {
            bus.publish(EventDraft::new(EventKind::RunStep).with_payload(json!({"i": i})));
        }

        // Slow subscriber got only its queue capacity; the rest dropped.
        let mut slow_count = 0;
        while slow.rx.try_recv().is_ok() {
            slow_count += 1;
        }
        assert_eq!(slow_count, 2);

        let mut fast_count = 0;
        while fast.rx.try_recv().is_ok() {
            fast_count += 1;
        }
        assert_eq!(fast_count, 5);

        let stats = bus.stats();
        assert_eq!(stats.dropped_by_subscriber.get("slow"), Some(&3));
        assert_eq!(stats.dropped_by_subscriber.get("fast"), Some(&0));
        assert_eq!(stats.dropped_total(), 3);
    }

    #[tokio::test]
    async fn test_per_conversation_order_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let bus = make_bus(dir.path());
        let mut sub = bus.subscribe("gml", 64);

        for i in 0..10 {
            bus.publish(
                EventDraft::new(EventKind::RunStep)
                    .with_conversation("conv-a")
                    .with_payload(json!({"i": i})),
            );
        }

        let mut last = -1i64;
        for _ in 0..10 {
            let event = sub.rx.recv().await.unwrap();
            let i = event.payload["i"].as_i64().unwrap();
            assert!(i > last);
            last = i;
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_counted_and_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let bus = make_bus(dir.path());
        let mut sub = bus.subscribe("gml", 16);

        bus.publish(EventDraft::new(EventKind::from("mystery.kind".to_string())));

        assert_eq!(bus.stats().quarantined_total, 1);
        let received = sub.rx.recv().await.unwrap();
        assert_eq!(received.kind.as_str(), "mystery.kind");
    }

    #[tokio::test]
    async fn test_seq_continues_from_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let bus = make_bus(dir.path());
            bus.publish(EventDraft::new(EventKind::ChatMessage));
            bus.publish(EventDraft::new(EventKind::ChatMessage));
        }

        let bus = make_bus(dir.path());
        let event = bus.publish(EventDraft::new(EventKind::ChatMessage));
        assert_eq!(event.seq, 3);
    }

    #[tokio::test]
    async fn test_broadcast_tap_receives() {
        let dir = tempfile::tempdir().unwrap();
        let bus = make_bus(dir.path());
        let mut tap = bus.tap();

        let published = bus.publish(EventDraft::new(EventKind::WorkerSeen));
        let seen = tap.recv().await.unwrap();
        assert_eq!(seen.event_id, published.event_id);
    }
}
