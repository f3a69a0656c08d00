//! Process-wide notification surface for beach-ferry.
//!
//! The core publishes connection, messaging and transfer events here; UI layers
//! subscribe per topic (or to everything) and never touch session internals.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

mod events;

pub use events::{
    CallId, ConnectionState, FerryEvent, Payload, ReceiveProgress, ReceivedFile, SendProgress,
    Topic,
};

const DEFAULT_CAPACITY: usize = 1024;

pub trait EventBus: Send + Sync {
    fn subscribe(&self, topic: Topic) -> broadcast::Receiver<FerryEvent>;
    fn subscribe_all(&self) -> broadcast::Receiver<FerryEvent>;
    /// Returns how many subscribers saw the event. Zero is not an error.
    fn publish(&self, event: FerryEvent) -> usize;
}

/// In-memory bus backed by one broadcast channel per topic plus a firehose.
#[derive(Debug)]
pub struct LocalBus {
    capacity: usize,
    topics: RwLock<HashMap<Topic, broadcast::Sender<FerryEvent>>>,
    all: broadcast::Sender<FerryEvent>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress events arrive once per chunk; size the buffer for the largest
    /// burst a slow subscriber should survive without lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            topics: RwLock::new(HashMap::new()),
            all: broadcast::channel(capacity).0,
        }
    }

    fn sender_for(&self, topic: Topic) -> broadcast::Sender<FerryEvent> {
        if let Some(sender) = self.topics.read().get(&topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl EventBus for LocalBus {
    fn subscribe(&self, topic: Topic) -> broadcast::Receiver<FerryEvent> {
        self.sender_for(topic).subscribe()
    }

    fn subscribe_all(&self) -> broadcast::Receiver<FerryEvent> {
        self.all.subscribe()
    }

    fn publish(&self, event: FerryEvent) -> usize {
        let topic = event.topic();
        let sender = self.topics.read().get(&topic).cloned();
        let mut delivered = 0;
        if let Some(sender) = sender {
            delivered += sender.send(event.clone()).unwrap_or(0);
        }
        delivered += self.all.send(event).unwrap_or(0);
        trace!(target = "ferry::bus", %topic, delivered, "published event");
        delivered
    }
}
