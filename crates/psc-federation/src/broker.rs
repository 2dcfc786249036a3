//! The local broker seam.
//!
//! The broker itself (the WAMP-style engine holding end-user subscriptions)
//! lives outside the federation layer. The federation layer only needs three
//! things from it: local fan-out of inbound events, the subscriber count per
//! topic, and the set of currently-subscribed topics for replay after a
//! handshake.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;

pub type DispatchError = Box<dyn std::error::Error + Send + Sync>;

/// What the federation layer consumes from the node's local pub/sub broker.
///
/// Implementations must remove a topic's entry when its subscriber count
/// reaches zero: the consumer's unsubscribe edge trigger fires on
/// `subscriber_count(topic) == 0`.
pub trait Broker: Send + Sync + 'static {
    /// Fan an event that arrived from a peer out to local subscribers.
    ///
    /// Errors are caught and logged by the calling session; they never
    /// close the connection.
    fn dispatch(&self, topic: &str, event: &Value) -> Result<(), DispatchError>;

    /// Current local subscriber count for `topic` (0 when unknown).
    fn subscriber_count(&self, topic: &str) -> usize;

    /// Topics with at least one local subscriber. Replayed to a producer
    /// whenever a session completes its handshake.
    fn subscribed_topics(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// An in-process broker: a counted topic map plus a record of everything
/// dispatched. Backs the standalone node binary and the test suites.
pub struct MemoryBroker {
    subscriptions: RwLock<HashMap<String, usize>>,
    dispatched: Mutex<Vec<(String, Value)>>,
    /// Live tap for anything that wants to observe dispatches as they land.
    tap: broadcast::Sender<(String, Value)>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(256);
        MemoryBroker {
            subscriptions: RwLock::new(HashMap::new()),
            dispatched: Mutex::new(Vec::new()),
            tap,
        }
    }

    /// Record one more local subscriber for `topic`; returns the new count.
    pub fn client_subscribe(&self, topic: &str) -> usize {
        let mut subs = self.subscriptions.write().unwrap();
        let count = subs.entry(topic.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    /// Record one local unsubscription; returns the new count. The map key
    /// is removed when the count reaches zero.
    pub fn client_unsubscribe(&self, topic: &str) -> usize {
        let mut subs = self.subscriptions.write().unwrap();
        match subs.get_mut(topic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                subs.remove(topic);
                0
            }
            None => 0,
        }
    }

    /// Everything dispatched so far, in arrival order.
    pub fn dispatched(&self) -> Vec<(String, Value)> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Subscribe to dispatches as they happen.
    pub fn events(&self) -> broadcast::Receiver<(String, Value)> {
        self.tap.subscribe()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

impl Broker for MemoryBroker {
    fn dispatch(&self, topic: &str, event: &Value) -> Result<(), DispatchError> {
        self.dispatched
            .lock()
            .unwrap()
            .push((topic.to_owned(), event.clone()));
        // A send with no receivers is not an error; the tap is optional.
        let _ = self.tap.send((topic.to_owned(), event.clone()));
        Ok(())
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .unwrap()
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.read().unwrap().keys().cloned().collect()
    }
}
