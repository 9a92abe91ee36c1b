//! Event bus - fan-out publication of timestamped events
//!
//! Every SyncMesh component publishes its events through an [`EventBus`]
//! backed by a `tokio::sync::broadcast` channel. Each subscriber owns its own
//! cursor into the ring buffer, so a slow subscriber lags (and eventually
//! skips events) without ever blocking delivery to the others.

use std::fmt::Debug;

use tokio::sync::broadcast;
use tracing::trace;

use crate::Timestamp;

/// Default ring buffer capacity (events)
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// An event together with the wall-clock time it was emitted
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope<E> {
    pub timestamp: Timestamp,
    pub event: E,
}

impl<E> Envelope<E> {
    pub fn new(event: E) -> Self {
        Envelope {
            timestamp: Timestamp::now(),
            event,
        }
    }
}

/// Broadcast channel for one component's events
pub struct EventBus<E> {
    tx: broadcast::Sender<Envelope<E>>,
}

impl<E: Clone + Debug + Send + 'static> EventBus<E> {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    /// Emit an event to all current subscribers
    ///
    /// Fire-and-forget: with no subscribers the event is dropped.
    pub fn emit(&self, event: E) {
        trace!(?event, "EventBus::emit");
        let _ = self.tx.send(Envelope::new(event));
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope<E>> {
        self.tx.subscribe()
    }

    /// Sender half, for components that publish on behalf of this bus
    pub fn sender(&self) -> broadcast::Sender<Envelope<E>> {
        self.tx.clone()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone + Debug + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        EventBus {
            tx: self.tx.clone(),
        }
    }
}

impl<E> Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
