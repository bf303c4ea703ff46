//! Cross-node request correlation.
//!
//! The router owns the node identity, the broker handle and the table of
//! requests waiting for a reply. A request leaves the pending table exactly
//! once: either a reply (or the last expected gather reply) arrives, or its
//! deadline fires. Either way it moves to the resolved table, from which the
//! request systems take it and act on its [AckPurpose].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bevy_ecs::prelude::Resource;
use tracing::debug;

use crate::broker::Broker;
use crate::config::NodeConfig;
use crate::ecs::{ConnectionId, DispatchState, NodeId, RequestId, RidePid};
use crate::envelope::{BroadcastTopic, Envelope, EnvelopeBody, ReplyPayload};
use crate::error::TransportError;
use crate::selector::{merge, Candidate};

/// What the sending node does to its own driver once the ride owner answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFollowUp {
    Keep,
    Assign(DispatchState),
    Release,
    /// Release only while the driver is still held by an offer for the ride.
    ReleaseHold,
}

/// Continuation attached to a pending request, interpreted on resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckPurpose {
    /// Nothing to do beyond logging.
    Observe,
    /// The rider was told a driver accepted.
    RiderAccepted { ride: RidePid },
    /// A driver's ride command; adjust the local driver by the owner's verdict.
    DriverTransition {
        connection: ConnectionId,
        ride: RidePid,
        applied: DriverFollowUp,
        rejected: DriverFollowUp,
    },
    /// Candidate scatter/gather for one search iteration.
    Gather { ride: RidePid },
    /// An offer sent to a driver on another node.
    OfferDelivery {
        ride: RidePid,
        driver: ConnectionId,
        attempt: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Replied(ReplyPayload),
    TimedOut,
    Gathered(Vec<Candidate>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub purpose: AckPurpose,
    pub outcome: RequestOutcome,
}

#[derive(Debug)]
enum PendingMode {
    Single,
    Gather {
        expected: usize,
        received: usize,
        lists: Vec<Vec<Candidate>>,
    },
}

#[derive(Debug)]
struct PendingRequest {
    purpose: AckPurpose,
    mode: PendingMode,
    deadline: u64,
}

#[derive(Resource)]
pub struct NodeRouter {
    node_id: NodeId,
    broker: Arc<dyn Broker>,
    next_request: u64,
    ack_timeout_ms: u64,
    gather_timeout_ms: u64,
    republish: HashSet<BroadcastTopic>,
    pending: HashMap<RequestId, PendingRequest>,
    resolved: HashMap<RequestId, Resolved>,
}

impl fmt::Debug for NodeRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRouter")
            .field("node_id", &self.node_id)
            .field("pending", &self.pending.len())
            .field("resolved", &self.resolved.len())
            .finish()
    }
}

impl NodeRouter {
    pub fn new(node_id: NodeId, broker: Arc<dyn Broker>, config: &NodeConfig) -> Self {
        Self {
            node_id,
            broker,
            next_request: 1,
            ack_timeout_ms: config.ack_timeout_ms,
            gather_timeout_ms: config.candidate_gather_timeout_ms,
            republish: config.republish.iter().copied().collect(),
            pending: HashMap::new(),
            resolved: HashMap::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn ack_timeout_ms(&self) -> u64 {
        self.ack_timeout_ms
    }

    pub fn gather_timeout_ms(&self) -> u64 {
        self.gather_timeout_ms
    }

    pub fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }

    pub fn republishes(&self, topic: BroadcastTopic) -> bool {
        self.republish.contains(&topic)
    }

    /// Publish `body` tagged with this node and `request_id`.
    /// Returns the number of other nodes that received it.
    pub fn publish(&self, request_id: RequestId, body: EnvelopeBody) -> Result<usize, TransportError> {
        let envelope = Envelope {
            origin: self.node_id,
            request_id,
            body,
        };
        let kind = envelope.kind();
        let bytes = envelope.encode()?;
        let receivers = self.broker.publish(self.node_id, bytes)?;
        debug!(node = %self.node_id, request = %request_id, kind, receivers, "envelope published");
        Ok(receivers)
    }

    /// Wait for a single reply until `deadline`.
    pub fn track(&mut self, id: RequestId, purpose: AckPurpose, deadline: u64) {
        self.pending.insert(
            id,
            PendingRequest {
                purpose,
                mode: PendingMode::Single,
                deadline,
            },
        );
    }

    /// Wait for `expected` candidate replies until `deadline`; `local` is
    /// merged into the result.
    pub fn track_gather(
        &mut self,
        id: RequestId,
        purpose: AckPurpose,
        expected: usize,
        deadline: u64,
        local: Vec<Candidate>,
    ) {
        self.pending.insert(
            id,
            PendingRequest {
                purpose,
                mode: PendingMode::Gather {
                    expected,
                    received: 0,
                    lists: vec![local],
                },
                deadline,
            },
        );
    }

    /// Resolve a request on the spot, without a round trip.
    pub fn resolve_now(&mut self, id: RequestId, purpose: AckPurpose, outcome: RequestOutcome) {
        self.pending.remove(&id);
        self.resolved.insert(id, Resolved { purpose, outcome });
    }

    /// Record a reply. Returns `true` when this reply resolved the request;
    /// late or duplicate replies return `false`.
    pub fn on_reply(&mut self, id: RequestId, payload: ReplyPayload) -> bool {
        let Some(mut request) = self.pending.remove(&id) else {
            debug!(node = %self.node_id, request = %id, "reply for unknown or finished request");
            return false;
        };
        match &mut request.mode {
            PendingMode::Single => {
                self.resolved.insert(
                    id,
                    Resolved {
                        purpose: request.purpose,
                        outcome: RequestOutcome::Replied(payload),
                    },
                );
                true
            }
            PendingMode::Gather {
                expected,
                received,
                lists,
            } => {
                if let ReplyPayload::Candidates(list) = payload {
                    lists.push(list);
                }
                *received += 1;
                if *received >= *expected {
                    let gathered = merge(std::mem::take(lists));
                    self.resolved.insert(
                        id,
                        Resolved {
                            purpose: request.purpose,
                            outcome: RequestOutcome::Gathered(gathered),
                        },
                    );
                    true
                } else {
                    self.pending.insert(id, request);
                    false
                }
            }
        }
    }

    /// Deadline for `id` fired. Returns `true` when the request was still
    /// pending: single requests time out, gathers resolve with what arrived.
    pub fn expire(&mut self, id: RequestId) -> bool {
        let Some(request) = self.pending.remove(&id) else {
            return false;
        };
        let outcome = match request.mode {
            PendingMode::Single => RequestOutcome::TimedOut,
            PendingMode::Gather { lists, .. } => RequestOutcome::Gathered(merge(lists)),
        };
        debug!(node = %self.node_id, request = %id, deadline = request.deadline, "request deadline reached");
        self.resolved.insert(
            id,
            Resolved {
                purpose: request.purpose,
                outcome,
            },
        );
        true
    }

    pub fn take_resolved(&mut self, id: RequestId) -> Option<Resolved> {
        self.resolved.remove(&id)
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    fn router() -> NodeRouter {
        NodeRouter::new(
            NodeId(1),
            Arc::new(InMemoryBroker::new()),
            &NodeConfig::default(),
        )
    }

    fn candidate(id: u64, node: u64, distance_m: u32) -> Candidate {
        Candidate {
            connection: ConnectionId(id),
            node: NodeId(node),
            distance_m,
        }
    }

    #[test]
    fn single_request_resolves_once() {
        let mut router = router();
        let id = router.next_request_id();
        router.track(id, AckPurpose::Observe, 3_000);

        assert!(router.on_reply(id, ReplyPayload::Delivered));
        assert!(!router.on_reply(id, ReplyPayload::Delivered), "duplicate reply");
        assert!(!router.expire(id), "deadline after reply");

        let resolved = router.take_resolved(id).expect("resolved");
        assert_eq!(resolved.outcome, RequestOutcome::Replied(ReplyPayload::Delivered));
        assert!(router.take_resolved(id).is_none());
    }

    #[test]
    fn single_request_times_out_once() {
        let mut router = router();
        let id = router.next_request_id();
        router.track(id, AckPurpose::Observe, 3_000);
        assert!(router.expire(id));
        assert!(!router.expire(id));
        assert!(!router.on_reply(id, ReplyPayload::Delivered), "late reply");
        assert_eq!(
            router.take_resolved(id).map(|r| r.outcome),
            Some(RequestOutcome::TimedOut)
        );
    }

    #[test]
    fn gather_finishes_when_every_peer_answered() {
        let mut router = router();
        let id = router.next_request_id();
        let ride = RidePid(4);
        router.track_gather(
            id,
            AckPurpose::Gather { ride },
            2,
            300,
            vec![candidate(5, 1, 800)],
        );
        assert!(!router.on_reply(id, ReplyPayload::Candidates(vec![candidate(9, 2, 200)])));
        assert!(router.is_pending(id));
        assert!(router.on_reply(id, ReplyPayload::Candidates(Vec::new())));

        let resolved = router.take_resolved(id).expect("resolved");
        assert_eq!(resolved.purpose, AckPurpose::Gather { ride });
        assert_eq!(
            resolved.outcome,
            RequestOutcome::Gathered(vec![candidate(9, 2, 200), candidate(5, 1, 800)])
        );
    }

    #[test]
    fn gather_deadline_keeps_partial_results() {
        let mut router = router();
        let id = router.next_request_id();
        router.track_gather(id, AckPurpose::Gather { ride: RidePid(1) }, 3, 300, Vec::new());
        router.on_reply(id, ReplyPayload::Candidates(vec![candidate(2, 3, 100)]));
        assert!(router.expire(id));
        assert_eq!(
            router.take_resolved(id).map(|r| r.outcome),
            Some(RequestOutcome::Gathered(vec![candidate(2, 3, 100)]))
        );
    }

    #[test]
    fn request_ids_are_unique_per_node() {
        let mut router = router();
        let a = router.next_request_id();
        let b = router.next_request_id();
        assert_ne!(a, b);
    }
}
