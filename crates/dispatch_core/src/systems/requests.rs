use bevy_ecs::prelude::Res;
use tracing::{debug, warn};

use crate::clock::{CurrentEvent, EventSubject};
use crate::envelope::{CommandOutcome, ReplyPayload};
use crate::router::{AckPurpose, RequestOutcome};
use crate::systems::dispatch::Coordinator;

pub fn request_deadline_system(mut coord: Coordinator, event: Res<CurrentEvent>) {
    if let Some(EventSubject::Request(id)) = event.0.subject {
        coord.ctx.expire_request(id);
    }
}

/// Acts on a request that got its reply, its last gather answer or its deadline.
pub fn request_resolved_system(mut coord: Coordinator, event: Res<CurrentEvent>) {
    let Some(EventSubject::Request(id)) = event.0.subject else {
        return;
    };
    let Some(resolved) = coord.ctx.router.take_resolved(id) else {
        return;
    };
    match &resolved.outcome {
        RequestOutcome::Replied(_) => coord.ctx.telemetry.requests_acked += 1,
        RequestOutcome::TimedOut => coord.ctx.telemetry.requests_timed_out += 1,
        RequestOutcome::Gathered(_) => {}
    }

    match (resolved.purpose, resolved.outcome) {
        (AckPurpose::Observe, outcome) => {
            debug!(request = %id, ?outcome, "request finished");
        }
        (AckPurpose::RiderAccepted { ride }, outcome) => {
            if outcome != RequestOutcome::Replied(ReplyPayload::Delivered) {
                warn!(ride = %ride, request = %id, ?outcome, "rider did not get the acceptance");
            }
        }
        (
            AckPurpose::DriverTransition {
                connection,
                ride,
                applied,
                rejected,
            },
            outcome,
        ) => match outcome {
            RequestOutcome::Replied(ReplyPayload::Command(CommandOutcome::Applied)) => {
                coord.ctx.follow_up_driver(connection, ride, applied)
            }
            RequestOutcome::Replied(ReplyPayload::Command(CommandOutcome::Rejected)) => {
                coord.ctx.follow_up_driver(connection, ride, rejected)
            }
            other => {
                warn!(driver = %connection, ride = %ride, request = %id, outcome = ?other, "ride owner did not answer");
            }
        },
        (AckPurpose::Gather { ride }, RequestOutcome::Gathered(candidates)) => {
            let Some(entity) = coord.ctx.rides.get(ride) else {
                return;
            };
            debug!(ride = %ride, candidates = candidates.len(), "candidates gathered");
            let directives = coord
                .with_ride(entity, |m, r, offer, cursor| match cursor {
                    Some(cursor) if cursor.gathering == Some(id) => {
                        m.candidates_ready(r, offer, cursor, candidates)
                    }
                    _ => Vec::new(),
                })
                .unwrap_or_default();
            coord.run(entity, directives);
        }
        (AckPurpose::Gather { ride }, outcome) => {
            warn!(ride = %ride, request = %id, ?outcome, "unexpected gather outcome");
        }
        (
            AckPurpose::OfferDelivery {
                ride,
                driver,
                attempt,
            },
            outcome,
        ) => {
            let Some(entity) = coord.ctx.rides.get(ride) else {
                return;
            };
            let directives = match outcome {
                RequestOutcome::Replied(ReplyPayload::Delivered) => return,
                RequestOutcome::Replied(ReplyPayload::Refused) => {
                    debug!(ride = %ride, driver = %driver, attempt, "remote driver became busy, skipped");
                    coord.searching(entity, |m, r, offer, cursor| {
                        m.candidate_unavailable(r, offer, cursor, driver, attempt)
                    })
                }
                other => {
                    let directives = coord.searching(entity, |m, r, offer, cursor| {
                        m.delivery_failed(r, offer, cursor, driver, attempt)
                    });
                    if !directives.is_empty() {
                        warn!(ride = %ride, driver = %driver, attempt, outcome = ?other, "remote offer not delivered");
                        coord.ctx.telemetry.delivery_failures += 1;
                    }
                    directives
                }
            };
            coord.run(entity, directives);
        }
    }
}
