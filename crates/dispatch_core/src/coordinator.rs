//! Offer coordinator: the per-ride search / offer / accept state machine.
//!
//! The machine is pure. Each operation mutates the ride's components and
//! returns [Directive]s describing the I/O to perform (gather candidates, send
//! an offer, notify a participant, persist, arm a timer). The dispatch systems
//! execute the directives, so every transition here is testable without a
//! world or a network.
//!
//! Exactly one driver is asked at a time: `Offer::offered_to` is set when an
//! offer goes out and cleared on decline, timeout, delivery failure or
//! acceptance. Timer events carry the attempt number they were armed for;
//! an event whose attempt is not the cursor's current one is stale.

use std::collections::HashMap;

use bevy_ecs::prelude::{Entity, Resource};
use thiserror::Error;

use crate::config::DispatchConfig;
use crate::ecs::{
    CancellationOutcome, ConnectionId, GeoPoint, Offer, ParticipantPid, Ride, RidePid, RideStatus,
    Role, SearchCursor,
};
use crate::collaborators::Pendency;
use crate::router::AckPurpose;
use crate::selector::{Candidate, CandidateQuery};
use crate::wire::{PositionUpdate, WireEvent};

/// Rides owned by this node.
#[derive(Debug, Default, Resource)]
pub struct RideIndex {
    rides: HashMap<RidePid, Entity>,
}

impl RideIndex {
    pub fn insert(&mut self, ride: RidePid, entity: Entity) {
        self.rides.insert(ride, entity);
    }

    pub fn remove(&mut self, ride: RidePid) -> Option<Entity> {
        self.rides.remove(&ride)
    }

    pub fn get(&self, ride: RidePid) -> Option<Entity> {
        self.rides.get(&ride).copied()
    }

    pub fn contains(&self, ride: RidePid) -> bool {
        self.rides.contains_key(&ride)
    }

    pub fn len(&self) -> usize {
        self.rides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rides.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    GatherCandidates(CandidateQuery),
    SendOffer {
        ride: RidePid,
        rider: ConnectionId,
        candidate: Candidate,
        attempt: u32,
        deadline: u64,
    },
    ScheduleIteration {
        ride: RidePid,
        at: u64,
    },
    Notify {
        to: ConnectionId,
        event: WireEvent,
        ack: Option<AckPurpose>,
    },
    IssuePendency(Pendency),
    Persist(Ride),
    /// Drop the search bookkeeping; the ride stopped searching.
    ReleaseSearch,
    /// Ride reached a terminal status; forget it.
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandRejected {
    #[error("decision from {driver} is not for the current offer")]
    StaleDecision { driver: ConnectionId },

    #[error("{by} is not a party of this ride")]
    NotAParty { by: ConnectionId },

    #[error("not allowed while the ride is {0:?}")]
    InvalidStatus(RideStatus),

    #[error("ride {0} is not dispatched by this node")]
    UnknownRide(RidePid),
}

/// Transition functions for one point in time.
#[derive(Debug, Clone, Copy)]
pub struct OfferCoordinator {
    config: DispatchConfig,
    now: u64,
}

impl OfferCoordinator {
    pub fn new(config: DispatchConfig, now: u64) -> Self {
        Self { config, now }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Start searching right away.
    pub fn begin(&self, ride: &mut Ride, cursor: &mut SearchCursor) -> Vec<Directive> {
        ride.status = RideStatus::Searching;
        cursor.started_at = self.now;
        cursor.tick_ends_at = self.now;
        vec![
            Directive::Persist(ride.clone()),
            Directive::ScheduleIteration {
                ride: ride.pid,
                at: self.now,
            },
        ]
    }

    /// Run search iteration `cursor.iteration`, or exhaust the ride when none are left.
    pub fn iterate(
        &self,
        ride: &mut Ride,
        offer: &mut Offer,
        cursor: &mut SearchCursor,
    ) -> Vec<Directive> {
        if ride.status != RideStatus::Searching
            || cursor.gathering.is_some()
            || offer.offered_to.is_some()
        {
            return Vec::new();
        }
        if cursor.iteration >= self.config.max_iteration {
            return self.exhaust(ride, cursor);
        }
        let radius_m = self.config.radius_for_iteration(cursor.iteration);
        offer.iteration = cursor.iteration;
        offer.radius_m = radius_m;
        cursor.tick_ends_at = self.now.saturating_add(self.config.iteration_interval_ms);
        cursor.candidates.clear();
        let query = CandidateQuery {
            ride: ride.pid,
            pickup: ride.pickup,
            radius_m,
            ignored: offer.ignored.clone(),
            requirements: ride.requirements.clone(),
            too_away_m: self.config.too_away_m,
        };
        cursor.query = Some(query.clone());
        vec![Directive::GatherCandidates(query)]
    }

    /// Candidates of the current iteration are known, nearest first.
    pub fn candidates_ready(
        &self,
        ride: &Ride,
        offer: &mut Offer,
        cursor: &mut SearchCursor,
        candidates: Vec<Candidate>,
    ) -> Vec<Directive> {
        cursor.gathering = None;
        if ride.status != RideStatus::Searching || offer.offered_to.is_some() {
            return Vec::new();
        }
        cursor.candidates = candidates
            .into_iter()
            .filter(|c| !offer.ignored.contains(&c.connection))
            .collect();
        self.offer_next(ride, offer, cursor)
    }

    fn offer_next(&self, ride: &Ride, offer: &mut Offer, cursor: &mut SearchCursor) -> Vec<Directive> {
        let next = loop {
            match cursor.candidates.pop_front() {
                Some(c) if offer.ignored.contains(&c.connection) => continue,
                other => break other,
            }
        };
        let Some(candidate) = next else {
            cursor.iteration += 1;
            return vec![Directive::ScheduleIteration {
                ride: ride.pid,
                at: self.now.max(cursor.tick_ends_at),
            }];
        };
        cursor.attempt += 1;
        let deadline = self.now.saturating_add(self.config.driver_response_timeout_ms);
        offer.offered_to = Some(candidate.connection);
        offer.response_deadline = Some(deadline);
        offer.offers_sent += 1;
        vec![Directive::SendOffer {
            ride: ride.pid,
            rider: ride.rider_connection,
            candidate,
            attempt: cursor.attempt,
            deadline,
        }]
    }

    /// The offer could not be written to the driver; counts as a decline.
    pub fn delivery_failed(
        &self,
        ride: &Ride,
        offer: &mut Offer,
        cursor: &mut SearchCursor,
        driver: ConnectionId,
        attempt: u32,
    ) -> Vec<Directive> {
        if ride.status != RideStatus::Searching
            || cursor.attempt != attempt
            || offer.offered_to != Some(driver)
        {
            return Vec::new();
        }
        self.miss(ride, offer, cursor, driver)
    }

    /// The candidate of `attempt` was no longer free when the offer went out.
    /// It is skipped without joining the ignore set, so a later iteration may
    /// offer it again.
    pub fn candidate_unavailable(
        &self,
        ride: &Ride,
        offer: &mut Offer,
        cursor: &mut SearchCursor,
        driver: ConnectionId,
        attempt: u32,
    ) -> Vec<Directive> {
        if ride.status != RideStatus::Searching
            || cursor.attempt != attempt
            || offer.offered_to != Some(driver)
        {
            return Vec::new();
        }
        offer.offered_to = None;
        offer.response_deadline = None;
        offer.offers_sent = offer.offers_sent.saturating_sub(1);
        self.continue_iteration(ride, offer, cursor)
    }

    /// The response deadline armed for `attempt` fired.
    pub fn deadline_elapsed(
        &self,
        ride: &Ride,
        offer: &mut Offer,
        cursor: &mut SearchCursor,
        attempt: u32,
    ) -> Vec<Directive> {
        if ride.status != RideStatus::Searching || cursor.attempt != attempt {
            return Vec::new();
        }
        match offer.offered_to {
            Some(driver) => self.miss(ride, offer, cursor, driver),
            None => Vec::new(),
        }
    }

    /// Driver's answer to the current offer.
    pub fn decision(
        &self,
        ride: &mut Ride,
        offer: &mut Offer,
        cursor: Option<&mut SearchCursor>,
        driver: ConnectionId,
        driver_pid: ParticipantPid,
        accepted: bool,
    ) -> Result<Vec<Directive>, CommandRejected> {
        let stale = CommandRejected::StaleDecision { driver };
        if ride.status != RideStatus::Searching
            || offer.offered_to != Some(driver)
            || offer.is_accepted()
        {
            return Err(stale);
        }
        let Some(cursor) = cursor else {
            return Err(stale);
        };
        if accepted {
            Ok(self.accept(ride, offer, driver, driver_pid))
        } else {
            Ok(self.miss(ride, offer, cursor, driver))
        }
    }

    fn miss(
        &self,
        ride: &Ride,
        offer: &mut Offer,
        cursor: &mut SearchCursor,
        driver: ConnectionId,
    ) -> Vec<Directive> {
        offer.ignored.insert(driver);
        offer.offered_to = None;
        offer.response_deadline = None;
        self.continue_iteration(ride, offer, cursor)
    }

    /// Next candidate while the tick lasts, otherwise the next iteration.
    fn continue_iteration(
        &self,
        ride: &Ride,
        offer: &mut Offer,
        cursor: &mut SearchCursor,
    ) -> Vec<Directive> {
        if self.now < cursor.tick_ends_at {
            self.offer_next(ride, offer, cursor)
        } else {
            cursor.iteration += 1;
            vec![Directive::ScheduleIteration {
                ride: ride.pid,
                at: self.now,
            }]
        }
    }

    fn accept(
        &self,
        ride: &mut Ride,
        offer: &mut Offer,
        driver: ConnectionId,
        driver_pid: ParticipantPid,
    ) -> Vec<Directive> {
        offer.accepted_at = Some(self.now);
        offer.driver = Some(driver);
        offer.offered_to = None;
        offer.response_deadline = None;
        ride.status = RideStatus::Accepted;
        vec![
            Directive::Persist(ride.clone()),
            Directive::ReleaseSearch,
            Directive::Notify {
                to: ride.rider_connection,
                event: WireEvent::VoyagerRideAccepted {
                    ride: ride.pid,
                    driver: driver_pid,
                    timestamp: self.now,
                },
                ack: Some(AckPurpose::RiderAccepted { ride: ride.pid }),
            },
            Directive::Notify {
                to: driver,
                event: WireEvent::DriverRideAccepted {
                    ride: ride.pid,
                    timestamp: self.now,
                },
                ack: None,
            },
        ]
    }

    fn exhaust(&self, ride: &mut Ride, cursor: &SearchCursor) -> Vec<Directive> {
        ride.status = RideStatus::NoDriverFound;
        let iterations = u16::try_from(cursor.iteration).unwrap_or(u16::MAX);
        vec![
            Directive::Persist(ride.clone()),
            Directive::ReleaseSearch,
            Directive::Notify {
                to: ride.rider_connection,
                event: WireEvent::NoDriverFound {
                    ride: ride.pid,
                    iterations,
                },
                ack: None,
            },
            Directive::Finish,
        ]
    }

    /// Cancel on behalf of `by`. Terminal rides are left untouched.
    pub fn cancel(
        &self,
        ride: &mut Ride,
        offer: &mut Offer,
        by: ConnectionId,
        role: Role,
        participant: ParticipantPid,
    ) -> Result<Vec<Directive>, CommandRejected> {
        if ride.status.is_terminal() {
            return Ok(Vec::new());
        }
        match ride.status {
            RideStatus::Created | RideStatus::Searching => {
                if role != Role::Rider || by != ride.rider_connection {
                    return Err(CommandRejected::NotAParty { by });
                }
                let outcome = CancellationOutcome::Safe;
                ride.status = RideStatus::Canceled;
                ride.cancellation = Some(outcome);
                let mut directives = vec![Directive::Persist(ride.clone()), Directive::ReleaseSearch];
                if let Some(driver) = offer.offered_to.take() {
                    offer.response_deadline = None;
                    directives.push(self.canceled_notice(ride, driver, outcome, role));
                }
                directives.push(self.canceled_notice(ride, ride.rider_connection, outcome, role));
                directives.push(Directive::Finish);
                Ok(directives)
            }
            RideStatus::Accepted => {
                let is_rider = role == Role::Rider && by == ride.rider_connection;
                let is_driver = role == Role::Driver && offer.driver == Some(by);
                if !is_rider && !is_driver {
                    return Err(CommandRejected::NotAParty { by });
                }
                let accepted_at = offer.accepted_at.unwrap_or(self.now);
                let elapsed = self.now.saturating_sub(accepted_at);
                let outcome = if elapsed < self.config.safe_cancelation_window_ms {
                    CancellationOutcome::Safe
                } else {
                    CancellationOutcome::PendencyIssued
                };
                ride.status = RideStatus::Canceled;
                ride.cancellation = Some(outcome);
                let mut directives = vec![Directive::Persist(ride.clone())];
                if outcome == CancellationOutcome::PendencyIssued {
                    directives.push(Directive::IssuePendency(Pendency {
                        ride: ride.pid,
                        party: participant,
                        role,
                        raised_at: self.now,
                        accepted_at,
                    }));
                }
                if let Some(driver) = offer.driver {
                    directives.push(self.canceled_notice(ride, driver, outcome, role));
                }
                directives.push(self.canceled_notice(ride, ride.rider_connection, outcome, role));
                directives.push(Directive::Finish);
                Ok(directives)
            }
            status => Err(CommandRejected::InvalidStatus(status)),
        }
    }

    fn canceled_notice(
        &self,
        ride: &Ride,
        to: ConnectionId,
        outcome: CancellationOutcome,
        by: Role,
    ) -> Directive {
        Directive::Notify {
            to,
            event: WireEvent::RideCanceled {
                ride: ride.pid,
                outcome,
                by,
            },
            ack: None,
        }
    }

    /// The assigned driver picked the rider up.
    pub fn start(
        &self,
        ride: &mut Ride,
        offer: &Offer,
        driver: ConnectionId,
        at: GeoPoint,
    ) -> Result<Vec<Directive>, CommandRejected> {
        if ride.status != RideStatus::Accepted {
            return Err(CommandRejected::InvalidStatus(ride.status));
        }
        if offer.driver != Some(driver) {
            return Err(CommandRejected::NotAParty { by: driver });
        }
        ride.status = RideStatus::Running;
        Ok(vec![
            Directive::Persist(ride.clone()),
            Directive::Notify {
                to: ride.rider_connection,
                event: WireEvent::StartRide { ride: ride.pid, at },
                ack: None,
            },
        ])
    }

    pub fn finish(
        &self,
        ride: &mut Ride,
        offer: &Offer,
        driver: ConnectionId,
        at: GeoPoint,
    ) -> Result<Vec<Directive>, CommandRejected> {
        if ride.status != RideStatus::Running {
            return Err(CommandRejected::InvalidStatus(ride.status));
        }
        if offer.driver != Some(driver) {
            return Err(CommandRejected::NotAParty { by: driver });
        }
        ride.status = RideStatus::Completed;
        Ok(vec![
            Directive::Persist(ride.clone()),
            Directive::Notify {
                to: ride.rider_connection,
                event: WireEvent::FinishRide { ride: ride.pid, at },
                ack: None,
            },
            Directive::Finish,
        ])
    }

    /// Rider moved before a driver was found; later iterations search around the new point.
    pub fn update_pickup(&self, ride: &mut Ride, point: GeoPoint) -> Result<Vec<Directive>, CommandRejected> {
        if ride.status != RideStatus::Searching {
            return Err(CommandRejected::InvalidStatus(ride.status));
        }
        ride.pickup = point;
        Ok(vec![Directive::Persist(ride.clone())])
    }

    /// Forward the assigned driver's position to the rider.
    pub fn relay_driver_position(
        &self,
        ride: &Ride,
        offer: &Offer,
        driver: ConnectionId,
        point: GeoPoint,
        heading: u16,
        kmh: u16,
    ) -> Result<Vec<Directive>, CommandRejected> {
        if !matches!(ride.status, RideStatus::Accepted | RideStatus::Running) {
            return Err(CommandRejected::InvalidStatus(ride.status));
        }
        if offer.driver != Some(driver) {
            return Err(CommandRejected::NotAParty { by: driver });
        }
        Ok(vec![Directive::Notify {
            to: ride.rider_connection,
            event: WireEvent::Position(PositionUpdate {
                point,
                heading,
                kmh,
                ignore: Vec::new(),
                ride: Some(ride.pid),
            }),
            ack: None,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{NodeId, PayMethod, RideRequirements, RideType};

    const RIDER: ConnectionId = ConnectionId(100);
    const D1: ConnectionId = ConnectionId(1);
    const D2: ConnectionId = ConnectionId(2);

    struct Fixture {
        config: DispatchConfig,
        ride: Ride,
        offer: Offer,
        cursor: SearchCursor,
    }

    impl Fixture {
        fn new() -> Self {
            let ride = Ride {
                pid: RidePid(1),
                status: RideStatus::Created,
                pickup: GeoPoint::new(0.0, 0.0),
                dropoff: GeoPoint::new(0.01, 0.01),
                rider_connection: RIDER,
                requirements: RideRequirements {
                    pay_method: PayMethod::Card,
                    ride_type: RideType::Standard,
                    drop_district: None,
                },
                cancellation: None,
            };
            let config = DispatchConfig::default();
            let offer = Offer::new(ride.pid, RIDER, config.initial_radius_m, 0);
            Self {
                config,
                ride,
                offer,
                cursor: SearchCursor::default(),
            }
        }

        fn at(&self, now: u64) -> OfferCoordinator {
            OfferCoordinator::new(self.config, now)
        }

        fn begin(&mut self, now: u64) -> Vec<Directive> {
            let m = self.at(now);
            m.begin(&mut self.ride, &mut self.cursor)
        }

        fn iterate(&mut self, now: u64) -> Vec<Directive> {
            let m = self.at(now);
            m.iterate(&mut self.ride, &mut self.offer, &mut self.cursor)
        }

        fn ready(&mut self, now: u64, candidates: Vec<Candidate>) -> Vec<Directive> {
            let m = self.at(now);
            m.candidates_ready(&self.ride, &mut self.offer, &mut self.cursor, candidates)
        }

        fn timeout(&mut self, now: u64, attempt: u32) -> Vec<Directive> {
            let m = self.at(now);
            m.deadline_elapsed(&self.ride, &mut self.offer, &mut self.cursor, attempt)
        }

        fn decide(
            &mut self,
            now: u64,
            driver: ConnectionId,
            accepted: bool,
        ) -> Result<Vec<Directive>, CommandRejected> {
            let m = self.at(now);
            m.decision(
                &mut self.ride,
                &mut self.offer,
                Some(&mut self.cursor),
                driver,
                ParticipantPid(driver.0 + 1_000),
                accepted,
            )
        }

        fn cancel_as_rider(&mut self, now: u64) -> Result<Vec<Directive>, CommandRejected> {
            let m = self.at(now);
            m.cancel(&mut self.ride, &mut self.offer, RIDER, Role::Rider, ParticipantPid(7))
        }
    }

    fn cand(connection: ConnectionId, distance_m: u32) -> Candidate {
        Candidate {
            connection,
            node: NodeId(1),
            distance_m,
        }
    }

    fn query_radius(directives: &[Directive]) -> Option<u32> {
        directives.iter().find_map(|d| match d {
            Directive::GatherCandidates(q) => Some(q.radius_m),
            _ => None,
        })
    }

    fn offered(directives: &[Directive]) -> Option<(ConnectionId, u32, u64)> {
        directives.iter().find_map(|d| match d {
            Directive::SendOffer {
                candidate,
                attempt,
                deadline,
                ..
            } => Some((candidate.connection, *attempt, *deadline)),
            _ => None,
        })
    }

    fn next_iteration_at(directives: &[Directive]) -> Option<u64> {
        directives.iter().find_map(|d| match d {
            Directive::ScheduleIteration { at, .. } => Some(*at),
            _ => None,
        })
    }

    #[test]
    fn begin_persists_and_schedules_first_iteration_now() {
        let mut f = Fixture::new();
        let directives = f.begin(500);
        assert_eq!(f.ride.status, RideStatus::Searching);
        assert!(matches!(directives[0], Directive::Persist(ref r) if r.status == RideStatus::Searching));
        assert_eq!(next_iteration_at(&directives), Some(500));
    }

    #[test]
    fn radius_expands_per_iteration_and_caps() {
        let mut f = Fixture::new();
        f.begin(0);
        let mut radii = Vec::new();
        for i in 0..6u64 {
            let now = i * 1_000;
            radii.push(query_radius(&f.iterate(now)).expect("query"));
            assert_eq!(next_iteration_at(&f.ready(now, Vec::new())), Some(now + 1_000));
        }
        assert_eq!(radii, vec![1000, 1200, 1400, 1600, 1800, 1800]);
    }

    #[test]
    fn only_nearest_candidate_is_offered() {
        let mut f = Fixture::new();
        f.begin(0);
        f.iterate(0);
        let directives = f.ready(0, vec![cand(D1, 300), cand(D2, 600)]);
        assert_eq!(offered(&directives), Some((D1, 1, 13_000)));
        assert_eq!(f.offer.offered_to, Some(D1));
        assert_eq!(f.cursor.candidates.len(), 1);

        // An iteration tick while an offer is outstanding does nothing.
        assert!(f.iterate(1_000).is_empty());
    }

    #[test]
    fn decline_within_tick_offers_next_candidate_of_same_iteration() {
        let mut f = Fixture::new();
        f.begin(0);
        f.iterate(0);
        f.ready(0, vec![cand(D1, 300), cand(D2, 600)]);
        let directives = f.decide(400, D1, false).expect("current offeree");
        assert_eq!(offered(&directives), Some((D2, 2, 13_400)));
        assert!(f.offer.ignored.contains(&D1));
        assert_eq!(f.cursor.iteration, 0);
    }

    #[test]
    fn busy_candidate_is_skipped_but_not_ignored() {
        let mut f = Fixture::new();
        f.begin(0);
        f.iterate(0);
        f.ready(0, vec![cand(D1, 300), cand(D2, 600)]);
        let m = f.at(0);
        let directives = m.candidate_unavailable(&f.ride, &mut f.offer, &mut f.cursor, D1, 1);
        assert_eq!(offered(&directives), Some((D2, 2, 13_000)));
        assert!(!f.offer.ignored.contains(&D1));
        assert_eq!(f.offer.offers_sent, 1);

        // D2 busy as well: nobody left, wait for the next tick.
        let directives = m.candidate_unavailable(&f.ride, &mut f.offer, &mut f.cursor, D2, 2);
        assert_eq!(next_iteration_at(&directives), Some(1_000));
        assert!(f.offer.offered_to.is_none());
        assert_eq!(f.offer.offers_sent, 0);

        // A stale attempt changes nothing.
        assert!(m
            .candidate_unavailable(&f.ride, &mut f.offer, &mut f.cursor, D2, 2)
            .is_empty());
    }

    #[test]
    fn timeout_after_tick_moves_to_next_iteration_immediately() {
        let mut f = Fixture::new();
        f.begin(0);
        f.iterate(0);
        f.ready(0, vec![cand(D1, 900)]);
        let directives = f.timeout(13_000, 1);
        assert_eq!(next_iteration_at(&directives), Some(13_000));
        assert_eq!(f.cursor.iteration, 1);
        assert!(f.offer.offered_to.is_none());
    }

    #[test]
    fn stale_deadline_is_ignored() {
        let mut f = Fixture::new();
        f.begin(0);
        f.iterate(0);
        f.ready(0, vec![cand(D1, 300), cand(D2, 600)]);
        f.decide(100, D1, false).expect("decline");
        // Deadline armed for attempt 1 fires after D2 got attempt 2.
        assert!(f.timeout(13_000, 1).is_empty());
        assert_eq!(f.offer.offered_to, Some(D2));
    }

    #[test]
    fn accept_only_from_current_offeree_and_only_once() {
        let mut f = Fixture::new();
        f.begin(0);
        f.iterate(0);
        f.ready(0, vec![cand(D1, 300), cand(D2, 600)]);

        assert_eq!(
            f.decide(10, D2, true),
            Err(CommandRejected::StaleDecision { driver: D2 })
        );
        let directives = f.decide(20, D1, true).expect("accept");
        assert_eq!(f.ride.status, RideStatus::Accepted);
        assert_eq!(f.offer.accepted_at, Some(20));
        assert_eq!(f.offer.driver, Some(D1));
        assert!(f.offer.offered_to.is_none());
        assert!(directives.contains(&Directive::ReleaseSearch));
        assert!(directives.iter().any(|d| matches!(
            d,
            Directive::Notify {
                to,
                event: WireEvent::VoyagerRideAccepted { driver, .. },
                ack: Some(AckPurpose::RiderAccepted { .. }),
            } if *to == RIDER && *driver == ParticipantPid(1_001)
        )));

        assert!(f.decide(30, D1, true).is_err(), "duplicate accept");
        assert!(f.decide(30, D1, false).is_err(), "decline after accept");
    }

    #[test]
    fn ignored_driver_is_never_offered_again() {
        let mut f = Fixture::new();
        f.begin(0);
        f.iterate(0);
        f.ready(0, vec![cand(D1, 300)]);
        f.timeout(13_000, 1);

        f.iterate(13_000);
        // A stale remote list may still report D1; it must be filtered out.
        let directives = f.ready(13_000, vec![cand(D1, 300), cand(D2, 1_100)]);
        assert_eq!(offered(&directives).map(|o| o.0), Some(D2));
        assert!(f.iterate(13_000).is_empty());
    }

    #[test]
    fn exhaustion_notifies_rider_once() {
        let mut f = Fixture::new();
        f.config.max_iteration = 3;
        f.begin(0);
        for i in 0..3u64 {
            f.iterate(i * 1_000);
            f.ready(i * 1_000, Vec::new());
        }
        let directives = f.iterate(3_000);
        assert_eq!(f.ride.status, RideStatus::NoDriverFound);
        let notices: Vec<_> = directives
            .iter()
            .filter(|d| matches!(d, Directive::Notify { event: WireEvent::NoDriverFound { iterations: 3, .. }, .. }))
            .collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(directives.last(), Some(&Directive::Finish));
        assert!(f.iterate(4_000).is_empty(), "terminal ride stays quiet");
    }

    fn accepted_at(now: u64) -> Fixture {
        let mut f = Fixture::new();
        f.begin(0);
        f.iterate(0);
        f.ready(0, vec![cand(D1, 300)]);
        f.decide(now, D1, true).expect("accept");
        f
    }

    #[test]
    fn cancel_inside_window_is_safe() {
        let mut f = accepted_at(1_000);
        let directives = f.cancel_as_rider(1_000 + 179_999).expect("cancel");
        assert_eq!(f.ride.cancellation, Some(CancellationOutcome::Safe));
        assert!(!directives.iter().any(|d| matches!(d, Directive::IssuePendency(_))));
    }

    #[test]
    fn cancel_after_window_issues_pendency() {
        let mut f = accepted_at(1_000);
        let directives = f.cancel_as_rider(1_000 + 180_001).expect("cancel");
        assert_eq!(f.ride.status, RideStatus::Canceled);
        assert_eq!(f.ride.cancellation, Some(CancellationOutcome::PendencyIssued));
        let pendency = directives
            .iter()
            .find_map(|d| match d {
                Directive::IssuePendency(p) => Some(p.clone()),
                _ => None,
            })
            .expect("pendency");
        assert_eq!(pendency.party, ParticipantPid(7));
        assert_eq!(pendency.accepted_at, 1_000);
        // Both parties are told.
        let told: Vec<ConnectionId> = directives
            .iter()
            .filter_map(|d| match d {
                Directive::Notify { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(told, vec![D1, RIDER]);
    }

    #[test]
    fn cancel_exactly_at_window_boundary_is_chargeable() {
        let mut f = accepted_at(0);
        f.cancel_as_rider(180_000).expect("cancel");
        assert_eq!(f.ride.cancellation, Some(CancellationOutcome::PendencyIssued));
    }

    #[test]
    fn cancel_before_acceptance_releases_offered_driver() {
        let mut f = Fixture::new();
        f.begin(0);
        f.iterate(0);
        f.ready(0, vec![cand(D1, 300)]);
        let directives = f.cancel_as_rider(500).expect("cancel");
        assert_eq!(f.ride.cancellation, Some(CancellationOutcome::Safe));
        assert!(f.offer.offered_to.is_none());
        assert!(directives.iter().any(|d| matches!(
            d,
            Directive::Notify { to, event: WireEvent::RideCanceled { .. }, .. } if *to == D1
        )));
        // Late accept from D1 is stale.
        assert!(f.decide(600, D1, true).is_err());
    }

    #[test]
    fn driver_cannot_cancel_a_searching_ride() {
        let mut f = Fixture::new();
        f.begin(0);
        let m = f.at(10);
        assert_eq!(
            m.cancel(&mut f.ride, &mut f.offer, D1, Role::Driver, ParticipantPid(1)),
            Err(CommandRejected::NotAParty { by: D1 })
        );
    }

    #[test]
    fn start_and_finish_by_assigned_driver_only() {
        let mut f = accepted_at(0);
        let m = f.at(10);
        let at = GeoPoint::new(0.0, 0.0);
        assert!(m.start(&mut f.ride, &f.offer, D2, at).is_err());
        assert!(m.finish(&mut f.ride, &f.offer, D1, at).is_err(), "not running yet");
        m.start(&mut f.ride, &f.offer, D1, at).expect("start");
        assert_eq!(f.ride.status, RideStatus::Running);
        assert_eq!(
            m.cancel(&mut f.ride, &mut f.offer, RIDER, Role::Rider, ParticipantPid(7)),
            Err(CommandRejected::InvalidStatus(RideStatus::Running))
        );
        let directives = m.finish(&mut f.ride, &f.offer, D1, at).expect("finish");
        assert_eq!(f.ride.status, RideStatus::Completed);
        assert_eq!(directives.last(), Some(&Directive::Finish));
    }

    #[test]
    fn pickup_moves_only_while_searching() {
        let mut f = Fixture::new();
        f.begin(0);
        let m = f.at(0);
        let moved = GeoPoint::new(0.001, 0.0);
        m.update_pickup(&mut f.ride, moved).expect("searching");
        assert_eq!(f.ride.pickup, moved);
        let q = f.iterate(0);
        assert!(matches!(&q[0], Directive::GatherCandidates(query) if query.pickup == moved));

        let mut accepted = accepted_at(0);
        assert!(m.update_pickup(&mut accepted.ride, moved).is_err());
    }
}
