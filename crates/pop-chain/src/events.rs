//! Chain events and the in-process event bus.

use crate::StoredHeader;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Event emitted when the best tip changes.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// The new tip descends from the previous tip.
    NewBestBlock {
        /// Previous tip, if one was known.
        previous: Option<StoredHeader>,
        /// New tip.
        latest: StoredHeader,
    },

    /// The tip moved to a competing branch.
    ///
    /// Both lists start right after the fork point and run towards their tip;
    /// the fork point itself is in neither.
    Reorg {
        /// Blocks that left the best chain.
        removed: Vec<StoredHeader>,
        /// Blocks that joined the best chain.
        added: Vec<StoredHeader>,
    },
}

impl ChainEvent {
    /// The tip after this event.
    pub fn tip(&self) -> Option<&StoredHeader> {
        match self {
            ChainEvent::NewBestBlock { latest, .. } => Some(latest),
            ChainEvent::Reorg { added, .. } => added.last(),
        }
    }
}

/// Ordered publish/subscribe channel.
///
/// Each subscriber gets its own unbounded queue, so events reach every
/// subscriber in publication order and none are dropped. Subscribers whose
/// receiver was dropped are pruned on the next publish.
pub struct EventBus<E> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<E>>>>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create a bus without subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a subscriber. Only events published afterwards are delivered.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber. Returns the number reached.
    pub fn publish(&self, event: E) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order_for_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        for i in 0..5u32 {
            assert_eq!(bus.publish(i), 2);
        }

        for i in 0..5u32 {
            assert_eq!(a.recv().await, Some(i));
            assert_eq!(b.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        drop(rx);

        assert_eq!(bus.publish("event"), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_clones_share_subscribers() {
        let bus = EventBus::<u8>::new();
        let clone = bus.clone();
        let _rx = clone.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
