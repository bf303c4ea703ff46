use dispatch_core::cluster::LocalCluster;
use dispatch_core::config::NodeConfig;
use dispatch_core::ecs::{ConnectionId, GeoPoint, RidePid, Role};
use dispatch_core::node::DispatchNode;
use dispatch_core::registry::MemorySocket;
use dispatch_core::test_helpers::{setup_frame, TestCollaborators, TEST_PICKUP};

use super::participants::Participant;

/// Cluster of nodes plus the collaborators behind them.
pub struct TestCluster {
    pub cluster: LocalCluster,
    pub collaborators: TestCollaborators,
    next_participant: u64,
}

impl TestCluster {
    pub fn new(nodes: usize) -> Self {
        Self::with_config(nodes, NodeConfig::default().with_seed(7))
    }

    pub fn with_config(nodes: usize, config: NodeConfig) -> Self {
        let collaborators = TestCollaborators::new();
        let cluster = LocalCluster::new(nodes, config, collaborators.collaborators())
            .expect("valid cluster config");
        Self {
            cluster,
            collaborators,
            next_participant: 100,
        }
    }

    pub fn node(&self, index: usize) -> &DispatchNode {
        self.cluster.node(index)
    }

    pub fn node_mut(&mut self, index: usize) -> &mut DispatchNode {
        self.cluster.node_mut(index)
    }

    pub fn now(&self) -> u64 {
        self.cluster.now()
    }

    fn connect(&mut self, node: usize, role: Role) -> Participant {
        self.next_participant += 1;
        let participant = self.next_participant;
        let token = format!("token-{participant}");
        self.collaborators.grant(&token, participant, role);
        let socket = MemorySocket::new(ConnectionId(participant));
        let connection = self
            .cluster
            .node_mut(node)
            .connect(&token, role, socket.handle())
            .expect("connect");
        Participant {
            node,
            connection,
            participant,
            socket,
        }
    }

    /// A driver on `node` that already sent its setup at `point`.
    pub fn driver(&mut self, node: usize, point: GeoPoint) -> Participant {
        let driver = self.connect(node, Role::Driver);
        self.send(&driver, setup_frame(point));
        self.settle();
        driver
    }

    /// A driver on `node` that has not sent its setup yet.
    pub fn driver_without_setup(&mut self, node: usize) -> Participant {
        self.connect(node, Role::Driver)
    }

    pub fn rider(&mut self, node: usize) -> Participant {
        self.connect(node, Role::Rider)
    }

    /// Book ride `pid` for `rider` at the test pickup and dispatch it from `owner`.
    pub fn dispatch(&mut self, owner: usize, pid: u64, rider: &Participant) -> RidePid {
        self.dispatch_at(owner, pid, rider, TEST_PICKUP)
    }

    pub fn dispatch_at(
        &mut self,
        owner: usize,
        pid: u64,
        rider: &Participant,
        pickup: GeoPoint,
    ) -> RidePid {
        let ride = self.collaborators.book(pid, rider.connection, pickup);
        self.cluster
            .node_mut(owner)
            .start_dispatch(ride)
            .expect("ride is dispatchable");
        self.settle();
        ride
    }

    /// Book ride `pid` and queue its dispatch on `owner` without running anything.
    pub fn start(&mut self, owner: usize, pid: u64, rider: &Participant) -> RidePid {
        let ride = self.collaborators.book(pid, rider.connection, TEST_PICKUP);
        self.cluster
            .node_mut(owner)
            .start_dispatch(ride)
            .expect("ride is dispatchable");
        ride
    }

    /// Run one event at a time until the broker carried `more` envelopes.
    pub fn step_until_published(&mut self, more: u64) {
        let target = self.cluster.broker().messages_published() + more;
        while self.cluster.broker().messages_published() < target {
            assert!(self.cluster.step(), "cluster went idle first");
        }
    }

    /// Deliver a frame from `participant`'s socket to its node.
    pub fn send(&mut self, participant: &Participant, frame: Vec<u8>) {
        self.cluster
            .node_mut(participant.node)
            .receive_frame(participant.connection, frame);
    }

    /// Process everything due at the current time.
    pub fn settle(&mut self) -> usize {
        let now = self.cluster.now();
        self.cluster.run_until(now)
    }

    pub fn run_until(&mut self, until: u64) -> usize {
        self.cluster.run_until(until)
    }
}
