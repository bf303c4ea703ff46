//! Publish/subscribe transport between nodes.
//!
//! Every published payload reaches every subscribed node, the publisher
//! included; routers drop their own envelopes on receipt. The returned count is
//! the number of *other* nodes that received the payload, which the router uses
//! to know how many replies a scatter/gather request can expect.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::ecs::NodeId;
use crate::error::TransportError;

pub trait Broker: Send + Sync + fmt::Debug {
    /// Publish `payload` to every subscriber.
    ///
    /// Returns the number of subscribers other than `origin` that received it.
    fn publish(&self, origin: NodeId, payload: Vec<u8>) -> Result<usize, TransportError>;
}

/// Receiving side of a node's broker subscription.
pub trait Subscription: Send {
    /// Take every payload received since the last call, in publish order.
    fn drain(&mut self) -> Vec<Vec<u8>>;
}

#[derive(Debug)]
struct BrokerState {
    queues: BTreeMap<NodeId, VecDeque<Vec<u8>>>,
    available: bool,
}

/// Process-local broker shared by the nodes of a [crate::cluster::LocalCluster]
/// or a test.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    published: Arc<AtomicU64>,
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("published", &self.published.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                queues: BTreeMap::new(),
                available: true,
            })),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        self.state.lock().map_err(|_| TransportError::BrokerUnavailable)
    }

    /// Register `node` as a receiver. Re-subscribing replaces the old queue.
    pub fn subscribe(&self, node: NodeId) -> InMemorySubscription {
        if let Ok(mut state) = self.lock() {
            state.queues.insert(node, VecDeque::new());
        }
        debug!(node = %node, "broker subscription created");
        InMemorySubscription {
            node,
            state: Arc::clone(&self.state),
        }
    }

    /// Simulate a broker outage: publishes fail with [TransportError::BrokerUnavailable].
    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.lock() {
            state.available = available;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().map(|s| s.queues.len()).unwrap_or(0)
    }

    /// Payloads waiting for `node`.
    pub fn pending_for(&self, node: NodeId) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(&node).map(VecDeque::len))
            .unwrap_or(0)
    }

    pub fn messages_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Broker for InMemoryBroker {
    fn publish(&self, origin: NodeId, payload: Vec<u8>) -> Result<usize, TransportError> {
        let mut state = self.lock()?;
        if !state.available {
            warn!(origin = %origin, "publish failed: broker unavailable");
            return Err(TransportError::BrokerUnavailable);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut receivers = 0;
        for (node, queue) in state.queues.iter_mut() {
            queue.push_back(payload.clone());
            if *node != origin {
                receivers += 1;
            }
        }
        debug!(origin = %origin, receivers, bytes = payload.len(), "payload published");
        Ok(receivers)
    }
}

#[derive(Debug)]
pub struct InMemorySubscription {
    node: NodeId,
    state: Arc<Mutex<BrokerState>>,
}

impl InMemorySubscription {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl Subscription for InMemorySubscription {
    fn drain(&mut self) -> Vec<Vec<u8>> {
        match self.state.lock() {
            Ok(mut state) => state
                .queues
                .get_mut(&self.node)
                .map(|q| q.drain(..).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.queues.remove(&self.node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_counts_peers_but_delivers_to_everyone() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe(NodeId(1));
        let mut b = broker.subscribe(NodeId(2));
        let mut c = broker.subscribe(NodeId(3));

        let receivers = broker.publish(NodeId(1), vec![7]).expect("publish");
        assert_eq!(receivers, 2);
        assert_eq!(a.drain(), vec![vec![7]]);
        assert_eq!(b.drain(), vec![vec![7]]);
        assert_eq!(c.drain(), vec![vec![7]]);
        assert!(b.drain().is_empty());
        assert_eq!(broker.messages_published(), 1);
    }

    #[test]
    fn unavailable_broker_fails_publish() {
        let broker = InMemoryBroker::new();
        let _a = broker.subscribe(NodeId(1));
        broker.set_available(false);
        assert_eq!(
            broker.publish(NodeId(1), vec![1]),
            Err(TransportError::BrokerUnavailable)
        );
        broker.set_available(true);
        assert_eq!(broker.publish(NodeId(1), vec![1]), Ok(0));
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let broker = InMemoryBroker::new();
        let a = broker.subscribe(NodeId(1));
        let _b = broker.subscribe(NodeId(2));
        drop(a);
        assert_eq!(broker.subscriber_count(), 1);
        assert_eq!(broker.publish(NodeId(2), vec![1]), Ok(0));
    }
}
