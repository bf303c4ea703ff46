use bevy_ecs::prelude::ResMut;
use tracing::{debug, warn};

use crate::context::{EnvelopeInbox, NodeContext, QueuedCommand, ReplyTo};
use crate::envelope::{Envelope, EnvelopeBody, ReplyPayload};
use crate::error::TransportError;

/// Handles one envelope drained from the broker.
pub fn envelope_received_system(mut ctx: NodeContext, mut inbox: ResMut<EnvelopeInbox>) {
    let Some(bytes) = inbox.pop() else {
        return;
    };
    let envelope = match Envelope::decode(&bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(node = %ctx.node_id(), error = %err, "envelope rejected");
            ctx.telemetry.protocol_errors += 1;
            return;
        }
    };
    if envelope.origin == ctx.node_id() {
        ctx.telemetry.envelopes_suppressed += 1;
        return;
    }
    let origin = envelope.origin;
    let request = envelope.request_id;
    debug!(node = %ctx.node_id(), origin = %origin, request = %request, kind = envelope.kind(), "envelope received");

    match envelope.body {
        EnvelopeBody::Emit {
            connection,
            event,
            ack,
        } => {
            if !ctx.registry.contains(connection) {
                return;
            }
            let payload = match ctx.deliver_local(connection, &event) {
                Ok(()) => ReplyPayload::Delivered,
                Err(TransportError::DriverUnavailable(_)) => {
                    debug!(connection = %connection, "offer refused, driver is busy");
                    ReplyPayload::Refused
                }
                Err(err) => {
                    warn!(connection = %connection, event = event.name(), error = %err, "remote emit not delivered");
                    ctx.telemetry.transport_failures += 1;
                    ReplyPayload::DeliveryFailed
                }
            };
            if ack {
                ctx.reply(ReplyTo::Remote { node: origin, request }, payload);
            }
        }
        EnvelopeBody::RideCommand { ride, command, ack } => {
            if !ctx.rides.contains(ride) {
                return;
            }
            ctx.enqueue_command(QueuedCommand {
                ride,
                command,
                reply: ack.then_some(ReplyTo::Remote { node: origin, request }),
            });
        }
        EnvelopeBody::CandidateQuery(query) => {
            let candidates = ctx.local_candidates(&query);
            debug!(ride = %query.ride, origin = %origin, candidates = candidates.len(), "answering candidate query");
            ctx.reply(
                ReplyTo::Remote { node: origin, request },
                ReplyPayload::Candidates(candidates),
            );
        }
        EnvelopeBody::Reply { to, payload } => {
            if to == ctx.node_id() {
                ctx.resolve_reply(request, payload);
            }
        }
        EnvelopeBody::Broadcast(event) => ctx.apply_broadcast(event),
    }
}
