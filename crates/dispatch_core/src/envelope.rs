//! Cross-node envelopes exchanged over the broker.

use serde::{Deserialize, Serialize};

use crate::ecs::{ConnectionId, GeoPoint, NodeId, ParticipantPid, RequestId, RidePid, Role};
use crate::error::{ProtocolError, TransportError};
use crate::selector::{Candidate, CandidateQuery};
use crate::wire::WireEvent;

/// Mutation of a ride, applied only by the node that owns the ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RideCommand {
    OfferDecision {
        driver: ConnectionId,
        driver_pid: ParticipantPid,
        accepted: bool,
    },
    Cancel {
        by: ConnectionId,
        role: Role,
        participant: ParticipantPid,
    },
    Start {
        driver: ConnectionId,
        at: GeoPoint,
    },
    Finish {
        driver: ConnectionId,
        at: GeoPoint,
    },
    UpdatePickup {
        point: GeoPoint,
    },
    RelayDriverPosition {
        driver: ConnectionId,
        point: GeoPoint,
        heading: u16,
        kmh: u16,
    },
}

impl RideCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RideCommand::OfferDecision { .. } => "offer_decision",
            RideCommand::Cancel { .. } => "cancel",
            RideCommand::Start { .. } => "start",
            RideCommand::Finish { .. } => "finish",
            RideCommand::UpdatePickup { .. } => "update_pickup",
            RideCommand::RelayDriverPosition { .. } => "relay_driver_position",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Applied,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyPayload {
    Delivered,
    DeliveryFailed,
    /// The driver was no longer free when the offer reached its node.
    Refused,
    Command(CommandOutcome),
    Candidates(Vec<Candidate>),
}

/// Topics that may be fanned out to every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BroadcastTopic {
    RiderPosition,
    DriverPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BroadcastEvent {
    RiderPosition {
        ride: RidePid,
        point: GeoPoint,
    },
    DriverPosition {
        ride: RidePid,
        driver: ConnectionId,
        point: GeoPoint,
        heading: u16,
        kmh: u16,
    },
}

impl BroadcastEvent {
    pub fn topic(&self) -> BroadcastTopic {
        match self {
            BroadcastEvent::RiderPosition { .. } => BroadcastTopic::RiderPosition,
            BroadcastEvent::DriverPosition { .. } => BroadcastTopic::DriverPosition,
        }
    }

    pub fn ride(&self) -> RidePid {
        match self {
            BroadcastEvent::RiderPosition { ride, .. }
            | BroadcastEvent::DriverPosition { ride, .. } => *ride,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EnvelopeBody {
    /// Deliver `event` to `connection` if this node owns it.
    Emit {
        connection: ConnectionId,
        event: WireEvent,
        ack: bool,
    },
    /// Apply `command` if this node owns `ride`.
    RideCommand {
        ride: RidePid,
        command: RideCommand,
        ack: bool,
    },
    /// Every node answers with its local candidates.
    CandidateQuery(CandidateQuery),
    /// Answer to request `Envelope::request_id` issued by node `to`.
    Reply { to: NodeId, payload: ReplyPayload },
    Broadcast(BroadcastEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: NodeId,
    pub request_id: RequestId,
    pub body: EnvelopeBody,
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self.body {
            EnvelopeBody::Emit { .. } => "emit",
            EnvelopeBody::RideCommand { .. } => "ride_command",
            EnvelopeBody::CandidateQuery(_) => "candidate_query",
            EnvelopeBody::Reply { .. } => "reply",
            EnvelopeBody::Broadcast(_) => "broadcast",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serialize(self).map_err(|e| TransportError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Envelope(e.to_string()))
    }
}
