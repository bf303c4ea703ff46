//! Ride owner systems: start dispatch, run search iterations, expire offers
//! and apply ride commands. All of them drive [OfferCoordinator] and execute
//! its directives through [Coordinator::run].

use std::collections::VecDeque;

use bevy_ecs::prelude::{Commands, Entity, Query, Res, ResMut};
use bevy_ecs::system::SystemParam;
use tracing::{debug, error, info, warn};

use crate::clock::{CurrentEvent, EventKind, EventSubject};
use crate::collaborators::Collaborators;
use crate::context::{DispatchRequests, Gather, NodeContext};
use crate::coordinator::{CommandRejected, Directive, OfferCoordinator};
use crate::ecs::{CancellationOutcome, Offer, Ride, RideStatus, SearchCursor};
use crate::envelope::{CommandOutcome, ReplyPayload, RideCommand};
use crate::error::TransportError;
use crate::router::AckPurpose;
use crate::selector::{eligible_distance, Candidate};
use crate::telemetry::RideOutcomeRecord;
use crate::wire::WireEvent;

/// Ride-owner view of the world: node context plus the owned rides.
#[derive(SystemParam)]
pub struct Coordinator<'w, 's> {
    pub ctx: NodeContext<'w, 's>,
    rides: Query<
        'w,
        's,
        (
            &'static mut Ride,
            &'static mut Offer,
            Option<&'static mut SearchCursor>,
        ),
    >,
    collaborators: Res<'w, Collaborators>,
    commands: Commands<'w, 's>,
}

impl Coordinator<'_, '_> {
    fn machine(&self) -> OfferCoordinator {
        OfferCoordinator::new(*self.ctx.config, self.ctx.now())
    }

    /// Run `f` against the ride's components; `None` when the ride is gone.
    pub fn with_ride<R, F>(&mut self, entity: Entity, f: F) -> Option<R>
    where
        F: FnOnce(&OfferCoordinator, &mut Ride, &mut Offer, Option<&mut SearchCursor>) -> R,
    {
        let machine = self.machine();
        let (mut ride, mut offer, mut cursor) = self.rides.get_mut(entity).ok()?;
        Some(f(&machine, &mut *ride, &mut *offer, cursor.as_deref_mut()))
    }

    /// Like [Self::with_ride] for transitions that need the search cursor.
    pub(crate) fn searching<F>(&mut self, entity: Entity, f: F) -> Vec<Directive>
    where
        F: FnOnce(&OfferCoordinator, &mut Ride, &mut Offer, &mut SearchCursor) -> Vec<Directive>,
    {
        self.with_ride(entity, |m, ride, offer, cursor| match cursor {
            Some(cursor) => f(m, ride, offer, cursor),
            None => Vec::new(),
        })
        .unwrap_or_default()
    }

    /// Execute directives until none are left. Directives produced while
    /// executing (e.g. a failed offer turning into the next offer) are
    /// appended to the same work list.
    pub fn run(&mut self, entity: Entity, directives: Vec<Directive>) {
        let mut queue: VecDeque<Directive> = directives.into();
        while let Some(directive) = queue.pop_front() {
            match directive {
                Directive::GatherCandidates(query) => {
                    let ride = query.ride;
                    debug!(ride = %ride, radius_m = query.radius_m, "searching candidates");
                    match self.ctx.gather_candidates(query) {
                        Gather::Ready(candidates) => {
                            queue.extend(self.searching(entity, |m, ride, offer, cursor| {
                                m.candidates_ready(ride, offer, cursor, candidates)
                            }));
                        }
                        Gather::Pending(id) => {
                            if let Ok((_, _, Some(mut cursor))) = self.rides.get_mut(entity) {
                                cursor.gathering = Some(id);
                            }
                        }
                    }
                }
                Directive::SendOffer {
                    ride,
                    rider,
                    candidate,
                    attempt,
                    deadline,
                } => {
                    let driver = candidate.connection;
                    if !self.still_eligible(entity, &candidate) {
                        debug!(ride = %ride, driver = %driver, "candidate no longer eligible, skipped");
                        queue.extend(self.searching(entity, |m, ride, offer, cursor| {
                            m.candidate_unavailable(ride, offer, cursor, driver, attempt)
                        }));
                        continue;
                    }
                    let p2p = candidate.node == self.ctx.node_id();
                    let ack = (!p2p).then_some(AckPurpose::OfferDelivery {
                        ride,
                        driver,
                        attempt,
                    });
                    match self.ctx.emit(driver, WireEvent::Offer { ride }, ack) {
                        Ok(_) => {
                            self.ctx.telemetry.offers_sent += 1;
                            self.ctx.clock.schedule_at(
                                deadline,
                                EventKind::OfferDeadline,
                                Some(EventSubject::Offer { ride, attempt }),
                            );
                            info!(
                                ride = %ride,
                                driver = %driver,
                                distance_m = candidate.distance_m,
                                attempt,
                                p2p,
                                "offer sent"
                            );
                            queue.push_back(Directive::Notify {
                                to: rider,
                                event: WireEvent::OfferSent { ride, p2p },
                                ack: None,
                            });
                        }
                        Err(TransportError::DriverUnavailable(_)) => {
                            debug!(ride = %ride, driver = %driver, "driver became busy, skipped");
                            queue.extend(self.searching(entity, |m, ride, offer, cursor| {
                                m.candidate_unavailable(ride, offer, cursor, driver, attempt)
                            }));
                        }
                        Err(err) => {
                            warn!(ride = %ride, driver = %driver, error = %err, "offer delivery failed");
                            self.ctx.telemetry.delivery_failures += 1;
                            queue.extend(self.searching(entity, |m, ride, offer, cursor| {
                                m.delivery_failed(ride, offer, cursor, driver, attempt)
                            }));
                        }
                    }
                }
                Directive::ScheduleIteration { ride, at } => {
                    self.ctx
                        .clock
                        .schedule_at(at, EventKind::SearchIteration, Some(EventSubject::Ride(ride)));
                }
                Directive::Notify { to, event, ack } => {
                    let name = event.name();
                    if let Err(err) = self.ctx.emit(to, event, ack) {
                        warn!(connection = %to, event = name, error = %err, "notification not delivered");
                        self.ctx.telemetry.transport_failures += 1;
                    }
                }
                Directive::IssuePendency(pendency) => {
                    if let Err(err) = self.collaborators.billing.issue_pendency(&pendency) {
                        error!(
                            ride = %pendency.ride,
                            party = %pendency.party,
                            error = %err,
                            "pendency could not be issued"
                        );
                    }
                }
                Directive::Persist(ride) => {
                    if let Err(err) = self.collaborators.rides.store(&ride) {
                        warn!(ride = %ride.pid, status = ?ride.status, error = %err, "ride not persisted");
                    }
                }
                Directive::ReleaseSearch => {
                    self.commands.entity(entity).remove::<SearchCursor>();
                }
                Directive::Finish => self.finish(entity),
            }
        }
    }

    /// Whether a candidate connected here still passes the iteration's query.
    /// Candidates on other nodes are checked by their node on delivery.
    fn still_eligible(&self, entity: Entity, candidate: &Candidate) -> bool {
        let Some(driver_entity) = self.ctx.registry.get(candidate.connection).map(|e| e.entity)
        else {
            return true;
        };
        let Ok(driver) = self.ctx.drivers.get(driver_entity) else {
            return false;
        };
        let now = self.ctx.now();
        match self.rides.get(entity) {
            Ok((_, _, Some(cursor))) => match &cursor.query {
                Some(query) => eligible_distance(query, driver, now).is_some(),
                None => driver.is_available(now),
            },
            _ => false,
        }
    }

    fn finish(&mut self, entity: Entity) {
        if let Ok((ride, offer, _)) = self.rides.get(entity) {
            let telemetry = &mut self.ctx.telemetry;
            match (ride.status, ride.cancellation) {
                (RideStatus::Completed, _) => telemetry.rides_completed += 1,
                (RideStatus::NoDriverFound, _) => telemetry.rides_exhausted += 1,
                (RideStatus::Canceled, Some(CancellationOutcome::PendencyIssued)) => {
                    telemetry.rides_canceled_with_pendency += 1
                }
                (RideStatus::Canceled, _) => telemetry.rides_canceled_safe += 1,
                _ => {}
            }
            telemetry.record_outcome(RideOutcomeRecord {
                ride: ride.pid,
                status: ride.status,
                cancellation: ride.cancellation,
                requested_at: offer.requested_at,
                accepted_at: offer.accepted_at,
                finished_at: self.ctx.clock.now(),
                offers: offer.offers_sent,
            });
            info!(ride = %ride.pid, status = ?ride.status, offers = offer.offers_sent, "ride finished");
            self.ctx.rides.remove(ride.pid);
        }
        self.commands.entity(entity).despawn();
    }
}

/// Takes ownership of a ride queued by the node facade and starts searching.
pub fn ride_requested_system(mut coord: Coordinator, mut requests: ResMut<DispatchRequests>) {
    let Some(mut ride) = requests.pop() else {
        return;
    };
    if coord.ctx.rides.contains(ride.pid) {
        warn!(ride = %ride.pid, "ride already dispatched here");
        return;
    }
    let now = coord.ctx.now();
    let config = *coord.ctx.config;
    let offer = Offer::new(ride.pid, ride.rider_connection, config.initial_radius_m, now);
    let mut cursor = SearchCursor::default();
    let directives = OfferCoordinator::new(config, now).begin(&mut ride, &mut cursor);
    let pid = ride.pid;
    info!(ride = %pid, node = %coord.ctx.node_id(), "dispatch started");
    let entity = coord.commands.spawn((ride, offer, cursor)).id();
    coord.ctx.rides.insert(pid, entity);
    coord.run(entity, directives);
}

pub fn search_iteration_system(mut coord: Coordinator, event: Res<CurrentEvent>) {
    let Some(EventSubject::Ride(pid)) = event.0.subject else {
        return;
    };
    let Some(entity) = coord.ctx.rides.get(pid) else {
        return;
    };
    let directives = coord.searching(entity, |m, ride, offer, cursor| m.iterate(ride, offer, cursor));
    coord.run(entity, directives);
}

pub fn offer_deadline_system(mut coord: Coordinator, event: Res<CurrentEvent>) {
    let Some(EventSubject::Offer { ride, attempt }) = event.0.subject else {
        return;
    };
    let Some(entity) = coord.ctx.rides.get(ride) else {
        return;
    };
    let directives = coord.searching(entity, |m, ride, offer, cursor| {
        m.deadline_elapsed(ride, offer, cursor, attempt)
    });
    if directives.is_empty() {
        debug!(ride = %ride, attempt, "stale offer deadline");
        return;
    }
    info!(ride = %ride, attempt, "offer timed out");
    coord.ctx.telemetry.offers_timed_out += 1;
    coord.run(entity, directives);
}

/// Applies one queued command to a ride this node owns and answers the sender.
pub fn ride_command_system(mut coord: Coordinator) {
    let Some(queued) = coord.ctx.command_queue.pop() else {
        return;
    };
    let ride = queued.ride;
    let name = queued.command.name();
    let routine = matches!(
        queued.command,
        RideCommand::UpdatePickup { .. } | RideCommand::RelayDriverPosition { .. }
    );
    let decision = match queued.command {
        RideCommand::OfferDecision { accepted, .. } => Some(accepted),
        _ => None,
    };

    let result = match coord.ctx.rides.get(ride) {
        None => Err(CommandRejected::UnknownRide(ride)),
        Some(entity) => coord
            .with_ride(entity, |m, r, offer, cursor| match queued.command {
                RideCommand::OfferDecision {
                    driver,
                    driver_pid,
                    accepted,
                } => m.decision(r, offer, cursor, driver, driver_pid, accepted),
                RideCommand::Cancel {
                    by,
                    role,
                    participant,
                } => m.cancel(r, offer, by, role, participant),
                RideCommand::Start { driver, at } => m.start(r, offer, driver, at),
                RideCommand::Finish { driver, at } => m.finish(r, offer, driver, at),
                RideCommand::UpdatePickup { point } => m.update_pickup(r, point),
                RideCommand::RelayDriverPosition {
                    driver,
                    point,
                    heading,
                    kmh,
                } => m.relay_driver_position(r, offer, driver, point, heading, kmh),
            })
            .unwrap_or(Err(CommandRejected::UnknownRide(ride)))
            .map(|directives| (entity, directives)),
    };

    match result {
        Ok((entity, directives)) => {
            match decision {
                Some(true) => {
                    coord.ctx.telemetry.rides_accepted += 1;
                    info!(ride = %ride, "offer accepted");
                }
                Some(false) => {
                    coord.ctx.telemetry.offers_declined += 1;
                    info!(ride = %ride, "offer declined");
                }
                None if !routine => info!(ride = %ride, command = name, "ride command applied"),
                None => {}
            }
            if let Some(reply) = queued.reply {
                coord
                    .ctx
                    .reply(reply, ReplyPayload::Command(CommandOutcome::Applied));
            }
            coord.run(entity, directives);
        }
        Err(rejection) => {
            match rejection {
                CommandRejected::StaleDecision { .. } => {
                    coord.ctx.telemetry.stale_decisions += 1;
                    info!(ride = %ride, reason = %rejection, "stale decision ignored");
                }
                _ if routine => debug!(ride = %ride, command = name, reason = %rejection, "ride command skipped"),
                _ => {
                    coord.ctx.telemetry.rejected_commands += 1;
                    warn!(ride = %ride, command = name, reason = %rejection, "ride command rejected");
                }
            }
            if let Some(reply) = queued.reply {
                coord
                    .ctx
                    .reply(reply, ReplyPayload::Command(CommandOutcome::Rejected));
            }
        }
    }
}
