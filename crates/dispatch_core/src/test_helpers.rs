//! Test helpers for common test setup and utilities.
//!
//! Shared by unit tests, integration tests, benches and the demo example.

use std::sync::Arc;

use crate::collaborators::{
    Collaborators, InMemoryRideRepository, RecordingBilling, SessionIdentity, StaticSessions,
};
use crate::ecs::{
    ConnectionId, GeoPoint, ParticipantPid, PayMethod, Ride, RidePid, RideRequirements,
    RideStatus, RideType, Role,
};
use crate::wire::{DriverSetup, PositionUpdate, WireEvent};

/// Metres per degree of latitude on the haversine sphere.
pub const METRES_PER_DEGREE: f64 = 111_194.93;

/// A pickup point in central São Paulo used across tests.
pub const TEST_PICKUP: GeoPoint = GeoPoint::new(-23.5505, -46.6333);

/// `metres` due north of `origin`.
pub fn point_north_of(origin: GeoPoint, metres: f64) -> GeoPoint {
    GeoPoint::new(origin.lat + metres / METRES_PER_DEGREE, origin.lng)
}

/// In-memory collaborators with handles kept for assertions.
#[derive(Debug, Clone, Default)]
pub struct TestCollaborators {
    pub sessions: Arc<StaticSessions>,
    pub rides: Arc<InMemoryRideRepository>,
    pub billing: Arc<RecordingBilling>,
}

impl TestCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(self.sessions.clone(), self.rides.clone(), self.billing.clone())
    }

    /// Register `token` for participant `participant` allowed to connect as `role`.
    pub fn grant(&self, token: &str, participant: u64, role: Role) {
        self.sessions.insert(
            token,
            SessionIdentity {
                participant: ParticipantPid(participant),
                roles: vec![role],
            },
        );
    }

    /// Persist a freshly booked ride for `rider` at `pickup`.
    pub fn book(&self, pid: u64, rider: ConnectionId, pickup: GeoPoint) -> RidePid {
        let ride = test_ride(pid, rider, pickup);
        let pid = ride.pid;
        self.rides.insert(ride);
        pid
    }
}

/// A `Created` cash / standard ride without a drop district.
pub fn test_ride(pid: u64, rider: ConnectionId, pickup: GeoPoint) -> Ride {
    Ride {
        pid: RidePid(pid),
        status: RideStatus::Created,
        pickup,
        dropoff: point_north_of(pickup, 5_000.0),
        rider_connection: rider,
        requirements: RideRequirements {
            pay_method: PayMethod::Cash,
            ride_type: RideType::Standard,
            drop_district: None,
        },
        cancellation: None,
    }
}

/// # Panics
///
/// Panics if `event` cannot be encoded.
pub fn frame(event: &WireEvent) -> Vec<u8> {
    event.encode().expect("test event should encode")
}

/// `DriverSetup` at `point` accepting every pay method and ride type.
pub fn setup_frame(point: GeoPoint) -> Vec<u8> {
    frame(&WireEvent::DriverSetup(DriverSetup {
        point,
        pay_methods: vec![PayMethod::Cash, PayMethod::Card, PayMethod::Wallet],
        ride_types: vec![RideType::Standard, RideType::Comfort, RideType::Moto],
        drop_districts: Vec::new(),
        vehicle_id: 1,
    }))
}

pub fn offer_response_frame(ride: RidePid, accepted: bool) -> Vec<u8> {
    frame(&WireEvent::OfferResponse { ride, accepted })
}

pub fn cancel_frame(ride: RidePid) -> Vec<u8> {
    frame(&WireEvent::CancelRide { ride })
}

pub fn position_frame(point: GeoPoint, ride: Option<RidePid>) -> Vec<u8> {
    frame(&WireEvent::Position(PositionUpdate {
        point,
        heading: 90,
        kmh: 30,
        ignore: Vec::new(),
        ride,
    }))
}

/// Decode every frame, skipping anything malformed.
pub fn decode_all(frames: &[Vec<u8>]) -> Vec<WireEvent> {
    frames
        .iter()
        .filter_map(|f| WireEvent::decode(f).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::rounded_distance_m;

    #[test]
    fn point_north_of_keeps_the_distance() {
        let p = point_north_of(TEST_PICKUP, 900.0);
        assert_eq!(rounded_distance_m(TEST_PICKUP, p), 900);
    }

    #[test]
    fn frames_decode_back() {
        let ride = RidePid(3);
        assert_eq!(
            decode_all(&[offer_response_frame(ride, true), cancel_frame(ride)]),
            vec![
                WireEvent::OfferResponse {
                    ride,
                    accepted: true
                },
                WireEvent::CancelRide { ride },
            ]
        );
    }
}
