//! Inbound frames from client sockets.
//!
//! Frames are decoded against the wire schema and checked against the
//! sender's role before anything changes. Driver and rider state owned by
//! this node is updated in place; anything that touches a ride goes through
//! [NodeContext::route_command] so only the ride owner mutates it.

use std::collections::HashSet;

use bevy_ecs::prelude::ResMut;
use tracing::{debug, warn};

use crate::context::{FrameInbox, NodeContext};
use crate::ecs::{ConnectionId, DispatchState, DriverConfig, RidePid, Role};
use crate::envelope::{BroadcastEvent, RideCommand};
use crate::error::ProtocolError;
use crate::registry::RegisteredConnection;
use crate::router::{AckPurpose, DriverFollowUp};
use crate::wire::{WireDriverState, WireEvent};

pub fn frame_received_system(mut ctx: NodeContext, mut inbox: ResMut<FrameInbox>) {
    let Some((connection, frame)) = inbox.pop() else {
        return;
    };
    let Some(sender) = ctx.registry.get(connection).copied() else {
        debug!(connection = %connection, "frame from unknown connection dropped");
        return;
    };
    let event = match WireEvent::decode(&frame) {
        Ok(event) => event,
        Err(err) => {
            reject(&mut ctx, connection, err);
            return;
        }
    };
    if !event.accepted_from(sender.role) {
        let err = ProtocolError::NotAllowed {
            event: event.name(),
            role: sender.role,
        };
        reject(&mut ctx, connection, err);
        return;
    }
    debug!(connection = %connection, role = %sender.role, event = event.name(), "frame received");
    match sender.role {
        Role::Driver => driver_event(&mut ctx, connection, sender, event),
        Role::Rider => rider_event(&mut ctx, connection, sender, event),
    }
}

fn reject(ctx: &mut NodeContext, connection: ConnectionId, err: ProtocolError) {
    warn!(connection = %connection, error = %err, "frame rejected");
    ctx.telemetry.protocol_errors += 1;
}

fn driver_event(
    ctx: &mut NodeContext,
    connection: ConnectionId,
    sender: RegisteredConnection,
    event: WireEvent,
) {
    let transition = |ride: RidePid, applied: DriverFollowUp, rejected: DriverFollowUp| {
        AckPurpose::DriverTransition {
            connection,
            ride,
            applied,
            rejected,
        }
    };
    match event {
        WireEvent::OfferResponse { ride, accepted } => {
            let command = RideCommand::OfferDecision {
                driver: connection,
                driver_pid: sender.participant,
                accepted,
            };
            if accepted {
                let ack = transition(ride, DriverFollowUp::Keep, DriverFollowUp::ReleaseHold);
                route(ctx, ride, command, Some(ack));
            } else {
                ctx.follow_up_driver(connection, ride, DriverFollowUp::ReleaseHold);
                route(ctx, ride, command, None);
            }
        }
        WireEvent::Position(update) => {
            let Ok(mut driver) = ctx.drivers.get_mut(sender.entity) else {
                return;
            };
            driver.position = Some(update.point);
            driver.heading = update.heading;
            driver.speed_kmh = update.kmh;
            driver.ignored_rides = update.ignore.iter().copied().collect::<HashSet<_>>();
            if let Some(ride) = update.ride {
                ctx.broadcast_event(BroadcastEvent::DriverPosition {
                    ride,
                    driver: connection,
                    point: update.point,
                    heading: update.heading,
                    kmh: update.kmh,
                });
            }
        }
        WireEvent::DriverSetup(setup) => {
            let Ok(mut driver) = ctx.drivers.get_mut(sender.entity) else {
                return;
            };
            driver.position = Some(setup.point);
            driver.config = DriverConfig {
                accepted_pay_methods: setup.pay_methods,
                accepted_ride_types: setup.ride_types,
                accepted_drop_districts: setup.drop_districts,
            };
            driver.vehicle_id = Some(setup.vehicle_id);
            if driver.dispatch_state == DispatchState::Searching {
                driver.dispatch_state = DispatchState::Idle;
            }
            debug!(driver = %connection, vehicle = setup.vehicle_id, "driver setup applied");
        }
        WireEvent::State { state, ride } => {
            let Ok(mut driver) = ctx.drivers.get_mut(sender.entity) else {
                return;
            };
            match (state, ride) {
                (WireDriverState::Available, _) => {
                    if driver.dispatch_state != DispatchState::Searching {
                        driver.release();
                    }
                }
                (WireDriverState::PickingUp, Some(ride)) => {
                    driver.assign(ride, DispatchState::PickingUp)
                }
                (WireDriverState::Running, Some(ride)) => driver.assign(ride, DispatchState::Running),
                (state, None) => {
                    warn!(driver = %connection, ?state, "busy state without a ride ignored");
                }
            }
        }
        WireEvent::CancelRide { ride } => {
            let command = RideCommand::Cancel {
                by: connection,
                role: Role::Driver,
                participant: sender.participant,
            };
            let ack = transition(ride, DriverFollowUp::Release, DriverFollowUp::Keep);
            route(ctx, ride, command, Some(ack));
        }
        WireEvent::StartRide { ride, at } => {
            let command = RideCommand::Start {
                driver: connection,
                at,
            };
            let ack = transition(
                ride,
                DriverFollowUp::Assign(DispatchState::Running),
                DriverFollowUp::Keep,
            );
            route(ctx, ride, command, Some(ack));
        }
        WireEvent::FinishRide { ride, at } => {
            let command = RideCommand::Finish {
                driver: connection,
                at,
            };
            let ack = transition(ride, DriverFollowUp::Release, DriverFollowUp::Keep);
            route(ctx, ride, command, Some(ack));
        }
        other => debug!(driver = %connection, event = other.name(), "event ignored"),
    }
}

fn rider_event(
    ctx: &mut NodeContext,
    connection: ConnectionId,
    sender: RegisteredConnection,
    event: WireEvent,
) {
    match event {
        WireEvent::Position(update) => {
            if let Ok(mut rider) = ctx.riders.get_mut(sender.entity) {
                rider.position = Some(update.point);
            }
            if let Some(ride) = update.ride {
                ctx.broadcast_event(BroadcastEvent::RiderPosition {
                    ride,
                    point: update.point,
                });
            }
        }
        WireEvent::CancelRide { ride } => {
            let command = RideCommand::Cancel {
                by: connection,
                role: Role::Rider,
                participant: sender.participant,
            };
            route(ctx, ride, command, None);
        }
        other => debug!(rider = %connection, event = other.name(), "event ignored"),
    }
}

fn route(ctx: &mut NodeContext, ride: RidePid, command: RideCommand, ack: Option<AckPurpose>) {
    let name = command.name();
    if let Err(err) = ctx.route_command(ride, command, ack) {
        warn!(ride = %ride, command = name, error = %err, "ride command not routed");
        ctx.telemetry.transport_failures += 1;
    }
}
