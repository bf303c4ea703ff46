//! Error types for the dispatch core.

use thiserror::Error;

use crate::ecs::{ConnectionId, RidePid, RideStatus, Role};

/// Malformed or out-of-schema input. Rejected without touching dispatch state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown event id {0}")]
    UnknownEvent(u8),

    #[error("truncated {event} payload")]
    Truncated { event: &'static str },

    #[error("{extra} trailing bytes after {event} payload")]
    TrailingBytes { event: &'static str, extra: usize },

    #[error("invalid {field} value {value} in {event}")]
    InvalidValue {
        event: &'static str,
        field: &'static str,
        value: u64,
    },

    #[error("invalid utf-8 in {event}")]
    InvalidUtf8 { event: &'static str },

    #[error("coordinates out of range in {event}")]
    InvalidCoordinate { event: &'static str },

    #[error("{field} list in {event} exceeds 255 entries")]
    ListTooLong {
        event: &'static str,
        field: &'static str,
    },

    #[error("{event} is not accepted from a {role} connection")]
    NotAllowed { event: &'static str, role: Role },

    #[error("malformed envelope: {0}")]
    Envelope(String),
}

/// Delivery failed below the protocol: broker or socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("broker unavailable")]
    BrokerUnavailable,

    #[error("socket closed: {0}")]
    SocketClosed(ConnectionId),

    #[error("envelope encoding failed: {0}")]
    Encode(String),

    #[error("driver {0} is not free to take an offer")]
    DriverUnavailable(ConnectionId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("unknown session token")]
    UnknownToken,

    #[error("ride {0} not found")]
    RideNotFound(RidePid),

    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors surfaced by the node facade to the embedding server.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("session is not permitted to connect as {0}")]
    RoleNotPermitted(Role),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("ride {ride} cannot be dispatched from status {status:?}")]
    RideNotDispatchable { ride: RidePid, status: RideStatus },
}
