//! Several nodes on one virtual timeline, wired through an [InMemoryBroker].
//!
//! The cluster always runs the globally earliest event next and pumps the
//! broker after every step, so an envelope published at time `t` is handled
//! by its receivers at `t`. Runs are deterministic for a given seed.

use std::sync::Arc;

use tracing::debug;

use crate::broker::{InMemoryBroker, InMemorySubscription};
use crate::collaborators::Collaborators;
use crate::config::NodeConfig;
use crate::ecs::NodeId;
use crate::error::DispatchError;
use crate::node::DispatchNode;

pub struct LocalCluster {
    broker: InMemoryBroker,
    nodes: Vec<(DispatchNode, InMemorySubscription)>,
    now: u64,
}

impl LocalCluster {
    /// `count` nodes with ids `node-1`, `node-2`, … sharing `collaborators`.
    pub fn new(
        count: usize,
        config: NodeConfig,
        collaborators: Collaborators,
    ) -> Result<Self, DispatchError> {
        let broker = InMemoryBroker::new();
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let node_id = NodeId(i as u64 + 1);
            let node_config = config
                .clone()
                .with_node_id(node_id)
                .with_seed(config.seed.wrapping_add(i as u64));
            let subscription = broker.subscribe(node_id);
            let node = DispatchNode::new(node_config, Arc::new(broker.clone()), collaborators.clone())?;
            nodes.push((node, subscription));
        }
        Ok(Self {
            broker,
            nodes,
            now: 0,
        })
    }

    pub fn node(&self, index: usize) -> &DispatchNode {
        &self.nodes[index].0
    }

    pub fn node_mut(&mut self, index: usize) -> &mut DispatchNode {
        &mut self.nodes[index].0
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    fn pump(&mut self) {
        for (node, subscription) in &mut self.nodes {
            node.pump(subscription);
        }
    }

    fn earliest(&self) -> Option<(u64, usize)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, (node, _))| node.next_event_time().map(|t| (t, i)))
            .min()
    }

    fn advance_all(&mut self, timestamp: u64) {
        for (node, _) in &mut self.nodes {
            node.advance_to(timestamp);
        }
        self.now = self.now.max(timestamp);
    }

    /// Run the globally earliest event. Returns `false` when every node is idle.
    pub fn step(&mut self) -> bool {
        self.pump();
        let Some((timestamp, index)) = self.earliest() else {
            return false;
        };
        self.advance_all(timestamp);
        self.nodes[index].0.run_next_event();
        self.pump();
        true
    }

    /// Process every event due up to `until` on every node. Returns the number processed.
    pub fn run_until(&mut self, until: u64) -> usize {
        let mut steps = 0;
        self.pump();
        while self.earliest().is_some_and(|(t, _)| t <= until) {
            self.step();
            steps += 1;
        }
        self.advance_all(until);
        debug!(now = self.now, steps, "cluster advanced");
        steps
    }

    pub fn run_for(&mut self, duration_ms: u64) -> usize {
        let until = self.now.saturating_add(duration_ms);
        self.run_until(until)
    }
}
