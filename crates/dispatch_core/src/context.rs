//! Node-wide system parameter: registry, router, clock and the local queues.
//!
//! [NodeContext] is the one place that decides whether a connection or a ride
//! lives here or must be reached through the broker.

use std::collections::VecDeque;

use bevy_ecs::prelude::{Entity, Query, Res, ResMut, Resource};
use bevy_ecs::system::SystemParam;
use tracing::{debug, warn};

use crate::clock::{EventKind, EventSubject, SimulationClock};
use crate::config::DispatchConfig;
use crate::coordinator::RideIndex;
use crate::ecs::{
    Connection, ConnectionId, DispatchState, DriverState, NodeId, RequestId, Ride, RidePid,
    RiderState,
};
use crate::envelope::{BroadcastEvent, EnvelopeBody, ReplyPayload, RideCommand};
use crate::error::TransportError;
use crate::registry::ConnectionRegistry;
use crate::router::{AckPurpose, DriverFollowUp, NodeRouter, RequestOutcome};
use crate::selector::{select, Candidate, CandidateQuery};
use crate::spatial::SpatialIndex;
use crate::telemetry::DispatchTelemetry;
use crate::wire::WireEvent;

/// Frames read from client sockets, in arrival order.
#[derive(Debug, Default, Resource)]
pub struct FrameInbox(VecDeque<(ConnectionId, Vec<u8>)>);

impl FrameInbox {
    pub fn push(&mut self, connection: ConnectionId, frame: Vec<u8>) {
        self.0.push_back((connection, frame));
    }

    pub fn pop(&mut self) -> Option<(ConnectionId, Vec<u8>)> {
        self.0.pop_front()
    }
}

/// Envelopes drained from the broker, in arrival order.
#[derive(Debug, Default, Resource)]
pub struct EnvelopeInbox(VecDeque<Vec<u8>>);

impl EnvelopeInbox {
    pub fn push(&mut self, bytes: Vec<u8>) {
        self.0.push_back(bytes);
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.0.pop_front()
    }
}

/// Rides loaded from the repository, waiting for their owner entity.
#[derive(Debug, Default, Resource)]
pub struct DispatchRequests(VecDeque<Ride>);

impl DispatchRequests {
    pub fn push(&mut self, ride: Ride) {
        self.0.push_back(ride);
    }

    pub fn pop(&mut self) -> Option<Ride> {
        self.0.pop_front()
    }
}

/// Where the verdict on a command goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTo {
    Local(RequestId),
    Remote { node: NodeId, request: RequestId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub ride: RidePid,
    pub command: RideCommand,
    pub reply: Option<ReplyTo>,
}

/// Commands for rides owned by this node, applied one per event.
#[derive(Debug, Default, Resource)]
pub struct RideCommandQueue(VecDeque<QueuedCommand>);

impl RideCommandQueue {
    pub fn pop(&mut self) -> Option<QueuedCommand> {
        self.0.pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Written to a local socket.
    Delivered,
    /// Handed to the broker; no acknowledgement requested.
    Published,
    /// Acknowledgement will arrive as a resolved request.
    Pending(RequestId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Gather {
    Ready(Vec<Candidate>),
    Pending(RequestId),
}

#[derive(SystemParam)]
pub struct NodeContext<'w, 's> {
    pub clock: ResMut<'w, SimulationClock>,
    pub router: ResMut<'w, NodeRouter>,
    pub registry: ResMut<'w, ConnectionRegistry>,
    pub rides: ResMut<'w, RideIndex>,
    pub command_queue: ResMut<'w, RideCommandQueue>,
    pub telemetry: ResMut<'w, DispatchTelemetry>,
    pub config: Res<'w, DispatchConfig>,
    pub spatial: ResMut<'w, SpatialIndex>,
    pub connections: Query<'w, 's, &'static Connection>,
    pub drivers: Query<'w, 's, &'static mut DriverState>,
    pub riders: Query<'w, 's, &'static mut RiderState>,
}

impl NodeContext<'_, '_> {
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn node_id(&self) -> NodeId {
        self.router.node_id()
    }

    /// Send `event` to a connection anywhere in the fleet.
    pub fn emit(
        &mut self,
        to: ConnectionId,
        event: WireEvent,
        ack: Option<AckPurpose>,
    ) -> Result<EmitOutcome, TransportError> {
        if self.registry.contains(to) {
            self.deliver_local(to, &event)?;
            return Ok(match ack {
                Some(purpose) => {
                    let id = self.router.next_request_id();
                    self.router.resolve_now(
                        id,
                        purpose,
                        RequestOutcome::Replied(ReplyPayload::Delivered),
                    );
                    self.clock
                        .schedule_now(EventKind::RequestResolved, Some(EventSubject::Request(id)));
                    EmitOutcome::Pending(id)
                }
                None => EmitOutcome::Delivered,
            });
        }

        let id = self.router.next_request_id();
        let wants_ack = ack.is_some();
        self.router.publish(
            id,
            EnvelopeBody::Emit {
                connection: to,
                event,
                ack: wants_ack,
            },
        )?;
        match ack {
            Some(purpose) => {
                self.track(id, purpose);
                Ok(EmitOutcome::Pending(id))
            }
            None => Ok(EmitOutcome::Published),
        }
    }

    fn track(&mut self, id: RequestId, purpose: AckPurpose) {
        let deadline = self.now().saturating_add(self.router.ack_timeout_ms());
        self.router.track(id, purpose, deadline);
        self.clock.schedule_at(
            deadline,
            EventKind::RequestDeadline,
            Some(EventSubject::Request(id)),
        );
    }

    /// Write `event` to a connection owned by this node and apply its
    /// outbound side effects on the participant's state.
    ///
    /// An `Offer` is refused with [TransportError::DriverUnavailable] unless
    /// the driver is free at this instant.
    pub fn deliver_local(&mut self, to: ConnectionId, event: &WireEvent) -> Result<(), TransportError> {
        let entity = self
            .registry
            .get(to)
            .map(|entry| entry.entity)
            .ok_or(TransportError::SocketClosed(to))?;
        if matches!(event, WireEvent::Offer { .. }) && !self.driver_is_free(entity) {
            return Err(TransportError::DriverUnavailable(to));
        }
        let connection = self
            .connections
            .get(entity)
            .map_err(|_| TransportError::SocketClosed(to))?;
        let frame = event
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        connection.socket.send(&frame)?;
        debug!(connection = %to, event = event.name(), "frame delivered");
        self.apply_outbound(entity, event);
        Ok(())
    }

    fn driver_is_free(&self, entity: Entity) -> bool {
        let now = self.now();
        self.drivers
            .get(entity)
            .is_ok_and(|driver| driver.is_available(now))
    }

    fn apply_outbound(&mut self, entity: Entity, event: &WireEvent) {
        let hold_ms = self.config.driver_response_timeout_ms;
        let now = self.now();
        if let Ok(mut driver) = self.drivers.get_mut(entity) {
            match event {
                WireEvent::Offer { ride } => driver.hold_for_offer(*ride, now.saturating_add(hold_ms)),
                WireEvent::DriverRideAccepted { ride, .. } => {
                    driver.assign(*ride, DispatchState::PickingUp)
                }
                WireEvent::RideCanceled { ride, .. } if driver.current_ride == Some(*ride) => {
                    driver.release()
                }
                _ => {}
            }
        } else if let Ok(mut rider) = self.riders.get_mut(entity) {
            match event {
                WireEvent::OfferSent { ride, .. } => rider.open(*ride),
                WireEvent::NoDriverFound { ride, .. }
                | WireEvent::RideCanceled { ride, .. }
                | WireEvent::FinishRide { ride, .. } => rider.close(*ride),
                _ => {}
            }
        }
    }

    /// Apply `command` where `ride` is owned. With `ack`, the verdict
    /// resolves a request carrying `ack` as its purpose.
    pub fn route_command(
        &mut self,
        ride: RidePid,
        command: RideCommand,
        ack: Option<AckPurpose>,
    ) -> Result<Option<RequestId>, TransportError> {
        if self.rides.contains(ride) {
            let reply = ack.map(|purpose| {
                let id = self.router.next_request_id();
                self.track(id, purpose);
                ReplyTo::Local(id)
            });
            self.enqueue_command(QueuedCommand {
                ride,
                command,
                reply,
            });
            return Ok(reply.map(|r| match r {
                ReplyTo::Local(id) | ReplyTo::Remote { request: id, .. } => id,
            }));
        }

        let id = self.router.next_request_id();
        self.router.publish(
            id,
            EnvelopeBody::RideCommand {
                ride,
                command,
                ack: ack.is_some(),
            },
        )?;
        Ok(ack.map(|purpose| {
            self.track(id, purpose);
            id
        }))
    }

    pub fn enqueue_command(&mut self, command: QueuedCommand) {
        let ride = command.ride;
        self.command_queue.0.push_back(command);
        self.clock
            .schedule_now(EventKind::RideCommandQueued, Some(EventSubject::Ride(ride)));
    }

    pub fn reply(&mut self, to: ReplyTo, payload: ReplyPayload) {
        match to {
            ReplyTo::Local(id) => self.resolve_reply(id, payload),
            ReplyTo::Remote { node, request } => {
                if let Err(err) = self
                    .router
                    .publish(request, EnvelopeBody::Reply { to: node, payload })
                {
                    warn!(node = %self.node_id(), to = %node, request = %request, error = %err, "reply not sent");
                    self.telemetry.transport_failures += 1;
                }
            }
        }
    }

    /// Feed a reply into the router; schedules resolution when it completes the request.
    pub fn resolve_reply(&mut self, id: RequestId, payload: ReplyPayload) {
        if self.router.on_reply(id, payload) {
            self.clock
                .schedule_now(EventKind::RequestResolved, Some(EventSubject::Request(id)));
        }
    }

    /// Deadline of a pending request fired.
    pub fn expire_request(&mut self, id: RequestId) {
        if self.router.expire(id) {
            self.clock
                .schedule_now(EventKind::RequestResolved, Some(EventSubject::Request(id)));
        }
    }

    /// Republish an allow-listed event to every node, this one included.
    pub fn broadcast_event(&mut self, event: BroadcastEvent) {
        if !self.router.republishes(event.topic()) {
            debug!(topic = ?event.topic(), "topic not republished");
            return;
        }
        self.apply_broadcast(event.clone());
        let id = self.router.next_request_id();
        if let Err(err) = self.router.publish(id, EnvelopeBody::Broadcast(event)) {
            warn!(node = %self.node_id(), error = %err, "broadcast not published");
            self.telemetry.transport_failures += 1;
        }
    }

    /// Turn a broadcast into a command when this node owns its ride.
    pub fn apply_broadcast(&mut self, event: BroadcastEvent) {
        let ride = event.ride();
        if !self.rides.contains(ride) {
            return;
        }
        let command = match event {
            BroadcastEvent::RiderPosition { point, .. } => RideCommand::UpdatePickup { point },
            BroadcastEvent::DriverPosition {
                driver,
                point,
                heading,
                kmh,
                ..
            } => RideCommand::RelayDriverPosition {
                driver,
                point,
                heading,
                kmh,
            },
        };
        self.enqueue_command(QueuedCommand {
            ride,
            command,
            reply: None,
        });
    }

    /// Candidates for `query` among this node's drivers.
    pub fn local_candidates(&mut self, query: &CandidateQuery) -> Vec<Candidate> {
        let now = self.now();
        let node = self.node_id();
        let reach = query.radius_m.min(query.too_away_m);
        match self.spatial.drivers_near(query.pickup, reach) {
            Some(entities) => select(
                query,
                entities.iter().filter_map(|e| self.drivers.get(*e).ok()),
                node,
                now,
            ),
            None => select(query, self.drivers.iter(), node, now),
        }
    }

    /// Local candidates plus every peer's, scattered through the broker.
    /// A broker failure degrades to local candidates only.
    pub fn gather_candidates(&mut self, query: CandidateQuery) -> Gather {
        let local = self.local_candidates(&query);
        let ride = query.ride;
        let id = self.router.next_request_id();
        match self.router.publish(id, EnvelopeBody::CandidateQuery(query)) {
            Ok(0) => Gather::Ready(local),
            Ok(peers) => {
                let deadline = self.now().saturating_add(self.router.gather_timeout_ms());
                self.router
                    .track_gather(id, AckPurpose::Gather { ride }, peers, deadline, local);
                self.clock.schedule_at(
                    deadline,
                    EventKind::RequestDeadline,
                    Some(EventSubject::Request(id)),
                );
                Gather::Pending(id)
            }
            Err(err) => {
                warn!(ride = %ride, error = %err, "candidate query not published, using local drivers only");
                self.telemetry.transport_failures += 1;
                Gather::Ready(local)
            }
        }
    }

    /// Adjust a local driver after the ride owner answered one of its commands.
    pub fn follow_up_driver(&mut self, connection: ConnectionId, ride: RidePid, follow_up: DriverFollowUp) {
        let Some(entity) = self.registry.get(connection).map(|e| e.entity) else {
            return;
        };
        let Ok(mut driver) = self.drivers.get_mut(entity) else {
            return;
        };
        if driver.current_ride != Some(ride) {
            return;
        }
        match follow_up {
            DriverFollowUp::Keep => {}
            DriverFollowUp::Assign(state) => driver.assign(ride, state),
            DriverFollowUp::Release => driver.release(),
            DriverFollowUp::ReleaseHold => {
                if driver.dispatch_state == DispatchState::Offered {
                    driver.release();
                }
            }
        }
    }
}
