//! Session Hub: fan-out of server-sent events to device and operator
//! WebSocket subscribers (spec.md §3 `EventEnvelope`, §4.6).
//!
//! Grounded in the donor's `TopicBroadcaster<A>`
//! (`web/src/handlers/websocket_topics.rs`): a
//! `broadcast::Sender`-per-key map behind a lock, generalized here to two
//! fixed subscriber classes instead of arbitrary string topics, since
//! spec.md names exactly two ("device WS" and "operator WS").

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Outbound buffer depth per subscriber before a slow consumer is
/// dropped (spec.md §4.6/§5).
const SUBSCRIBER_BUFFER: usize = 256;

/// The two subscriber classes the Session Hub fans out to (spec.md
/// §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberClass {
    /// A connected device's WebSocket.
    Device,
    /// A connected operator's WebSocket.
    Operator,
}

/// An event published through the Session Hub (spec.md §3
/// `EventEnvelope`). Not persisted; ordered per subscriber only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Discriminates the payload's shape for subscribers.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event-specific payload.
    pub payload: serde_json::Value,
    /// Server wall-clock time the event was published.
    pub server_time: DateTime<Utc>,
}

impl EventEnvelope {
    /// Build an envelope stamped with the current time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            server_time: Utc::now(),
        }
    }
}

/// A `(owner_id, connection_seq)` key identifying one live WebSocket
/// connection within a subscriber class (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    /// The device or operator id this connection belongs to.
    pub owner_id: Uuid,
    /// Monotonically increasing per-owner connection counter,
    /// disambiguating concurrent connections from the same owner.
    pub connection_seq: u64,
}

type Sender = broadcast::Sender<EventEnvelope>;

/// Per-class map of subscriber key to its broadcast sender. A broadcast
/// channel (not a plain mpsc) is used per-subscriber so the hub can drop
/// a lagging receiver's backlog without blocking the publisher
/// (spec.md §4.6/§5 "slow consumers never block publishers").
struct ClassChannels {
    senders: RwLock<HashMap<SubscriberKey, Sender>>,
    next_seq: std::sync::atomic::AtomicU64,
}

impl ClassChannels {
    fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            next_seq: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

/// Fans out [`EventEnvelope`]s to device and operator WebSocket
/// subscribers, each keyed by `(owner_id, connection_seq)`. Publish is
/// FIFO per subscriber; there is no ordering guarantee across
/// subscribers (spec.md §4.6).
pub struct SessionHub {
    device: ClassChannels,
    operator: ClassChannels,
}

impl SessionHub {
    /// Construct an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self {
            device: ClassChannels::new(),
            operator: ClassChannels::new(),
        }
    }

    fn channels(&self, class: SubscriberClass) -> &ClassChannels {
        match class {
            SubscriberClass::Device => &self.device,
            SubscriberClass::Operator => &self.operator,
        }
    }

    /// Register a new subscriber connection for `owner_id` in the given
    /// class, returning its key and a receiver for published events. WS
    /// open for a device subscriber is how presence is established
    /// (spec.md §4.6: "WS presence is authoritative, not HTTP traffic").
    pub async fn subscribe(
        &self,
        class: SubscriberClass,
        owner_id: Uuid,
    ) -> (SubscriberKey, broadcast::Receiver<EventEnvelope>) {
        let channels = self.channels(class);
        let connection_seq = channels
            .next_seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let key = SubscriberKey {
            owner_id,
            connection_seq,
        };
        let (tx, rx) = broadcast::channel(SUBSCRIBER_BUFFER);
        channels.senders.write().await.insert(key, tx);
        (key, rx)
    }

    /// Deregister a subscriber connection, e.g. on WebSocket close.
    pub async fn unsubscribe(&self, class: SubscriberClass, key: SubscriberKey) {
        self.channels(class).senders.write().await.remove(&key);
    }

    /// Publish an event to every current subscriber in `class`. A
    /// subscriber with no room left in its buffer (an overflowing slow
    /// consumer) simply misses events on its next receive as
    /// `RecvError::Lagged`; publish itself never blocks or fails
    /// (spec.md §4.6/§7: "Session Hub never surfaces publish failures to
    /// handlers").
    pub async fn publish(&self, class: SubscriberClass, event: EventEnvelope) {
        let senders = self.channels(class).senders.read().await;
        for tx in senders.values() {
            // Zero receivers currently attached is not an error: the
            // sender is retained until explicit unsubscribe.
            let _ = tx.send(event.clone());
        }
    }

    /// Number of live subscribers in a class, for diagnostics.
    pub async fn subscriber_count(&self, class: SubscriberClass) -> usize {
        self.channels(class).senders.read().await.len()
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle type alias, matching how the rest of `pclink-core`'s
/// components are held by `pclink-web`'s `AppState`.
pub type SharedSessionHub = Arc<SessionHub>;
