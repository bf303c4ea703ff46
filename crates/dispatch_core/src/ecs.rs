use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;

use bevy_ecs::prelude::Component;
use serde::{Deserialize, Serialize};

use crate::registry::SocketHandle;
use crate::selector::{Candidate, CandidateQuery};

/// Identifier of one live socket connection. Unique across the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{:016x}", self.0)
    }
}

/// Public identifier of a ride, assigned by the booking service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RidePid(pub u64);

impl fmt::Display for RidePid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ride-{}", self.0)
    }
}

/// Public identifier of a participant (driver or rider account).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantPid(pub u64);

impl fmt::Display for ParticipantPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "participant-{}", self.0)
    }
}

/// Identity of one connection-serving process in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{:x}", self.0)
    }
}

/// Correlation id of a cross-node request; only meaningful on the origin node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Rider,
    Driver,
}

impl Role {
    pub fn code(self) -> u8 {
        match self {
            Role::Rider => 0,
            Role::Driver => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Role::Rider),
            1 => Some(Role::Driver),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Rider => f.write_str("rider"),
            Role::Driver => f.write_str("driver"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PayMethod {
    Cash,
    Card,
    Wallet,
}

impl PayMethod {
    pub fn code(self) -> u8 {
        match self {
            PayMethod::Cash => 0,
            PayMethod::Card => 1,
            PayMethod::Wallet => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PayMethod::Cash),
            1 => Some(PayMethod::Card),
            2 => Some(PayMethod::Wallet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RideType {
    Standard,
    Comfort,
    Moto,
}

impl RideType {
    pub fn code(self) -> u8 {
        match self {
            RideType::Standard => 0,
            RideType::Comfort => 1,
            RideType::Moto => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RideType::Standard),
            1 => Some(RideType::Comfort),
            2 => Some(RideType::Moto),
            _ => None,
        }
    }
}

/// What a ride asks of a driver besides proximity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideRequirements {
    pub pay_method: PayMethod,
    pub ride_type: RideType,
    /// District of the dropoff, when the booking service resolved one.
    pub drop_district: Option<String>,
}

/// Driver-declared preferences sent with `DriverSetup`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub accepted_pay_methods: Vec<PayMethod>,
    pub accepted_ride_types: Vec<RideType>,
    /// Empty means the driver takes any district.
    pub accepted_drop_districts: Vec<String>,
}

impl DriverConfig {
    pub fn accepts(&self, requirements: &RideRequirements) -> bool {
        if !self.accepted_pay_methods.contains(&requirements.pay_method) {
            return false;
        }
        if !self.accepted_ride_types.contains(&requirements.ride_type) {
            return false;
        }
        match &requirements.drop_district {
            Some(district) if !self.accepted_drop_districts.is_empty() => {
                self.accepted_drop_districts.iter().any(|d| d == district)
            }
            _ => true,
        }
    }
}

/// Dispatch lifecycle of a driver connection.
///
/// A freshly connected driver is `Searching` until its first `DriverSetup`
/// arrives; only `Idle` drivers (or `Offered` ones whose hold expired) are
/// candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchState {
    Idle,
    Searching,
    Offered,
    PickingUp,
    Running,
}

/// Live socket connection owned by this node.
#[derive(Debug, Clone, Component)]
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub participant: ParticipantPid,
    pub node: NodeId,
    pub socket: SocketHandle,
}

#[derive(Debug, Clone, PartialEq, Component)]
pub struct DriverState {
    pub connection: ConnectionId,
    pub position: Option<GeoPoint>,
    /// Degrees clockwise from north.
    pub heading: u16,
    pub speed_kmh: u16,
    pub dispatch_state: DispatchState,
    pub current_ride: Option<RidePid>,
    /// While `Offered`, the driver is held for one ride until this time.
    pub offer_hold_until: Option<u64>,
    pub config: DriverConfig,
    pub vehicle_id: Option<u64>,
    /// Rides the driver asked never to be offered again.
    pub ignored_rides: HashSet<RidePid>,
}

impl DriverState {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            position: None,
            heading: 0,
            speed_kmh: 0,
            dispatch_state: DispatchState::Searching,
            current_ride: None,
            offer_hold_until: None,
            config: DriverConfig::default(),
            vehicle_id: None,
            ignored_rides: HashSet::new(),
        }
    }

    pub fn is_available(&self, now: u64) -> bool {
        match self.dispatch_state {
            DispatchState::Idle => true,
            DispatchState::Offered => self.offer_hold_until.is_some_and(|until| now >= until),
            _ => false,
        }
    }

    pub fn hold_for_offer(&mut self, ride: RidePid, until: u64) {
        self.dispatch_state = DispatchState::Offered;
        self.current_ride = Some(ride);
        self.offer_hold_until = Some(until);
    }

    pub fn assign(&mut self, ride: RidePid, state: DispatchState) {
        self.dispatch_state = state;
        self.current_ride = Some(ride);
        self.offer_hold_until = None;
    }

    pub fn release(&mut self) {
        self.dispatch_state = DispatchState::Idle;
        self.current_ride = None;
        self.offer_hold_until = None;
    }
}

#[derive(Debug, Clone, PartialEq, Component)]
pub struct RiderState {
    pub connection: ConnectionId,
    pub position: Option<GeoPoint>,
    pub open_rides: Vec<RidePid>,
}

impl RiderState {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            position: None,
            open_rides: Vec::new(),
        }
    }

    pub fn open(&mut self, ride: RidePid) {
        if !self.open_rides.contains(&ride) {
            self.open_rides.push(ride);
        }
    }

    pub fn close(&mut self, ride: RidePid) {
        self.open_rides.retain(|r| *r != ride);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RideStatus {
    Created,
    Searching,
    Accepted,
    Running,
    Completed,
    Canceled,
    NoDriverFound,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RideStatus::Completed | RideStatus::Canceled | RideStatus::NoDriverFound
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationOutcome {
    /// Inside the grace window (or before acceptance): no charge.
    #[serde(rename = "safe")]
    Safe,
    /// A chargeable pendency was raised against the canceling party.
    #[serde(rename = "pendencie-issued")]
    PendencyIssued,
}

impl CancellationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CancellationOutcome::Safe => "safe",
            CancellationOutcome::PendencyIssued => "pendencie-issued",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            CancellationOutcome::Safe => 0,
            CancellationOutcome::PendencyIssued => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CancellationOutcome::Safe),
            1 => Some(CancellationOutcome::PendencyIssued),
            _ => None,
        }
    }
}

/// Ride record as persisted by the booking service and mirrored on the owner node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Component)]
pub struct Ride {
    pub pid: RidePid,
    pub status: RideStatus,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub rider_connection: ConnectionId,
    pub requirements: RideRequirements,
    pub cancellation: Option<CancellationOutcome>,
}

/// Which single driver is currently being asked to take a ride.
#[derive(Debug, Clone, PartialEq, Component)]
pub struct Offer {
    pub ride: RidePid,
    pub requester: ConnectionId,
    pub iteration: u32,
    pub radius_m: u32,
    pub ignored: BTreeSet<ConnectionId>,
    pub offered_to: Option<ConnectionId>,
    pub response_deadline: Option<u64>,
    pub driver: Option<ConnectionId>,
    pub accepted_at: Option<u64>,
    pub requested_at: u64,
    /// Offers sent so far, every iteration included.
    pub offers_sent: u32,
}

impl Offer {
    pub fn new(ride: RidePid, requester: ConnectionId, radius_m: u32, requested_at: u64) -> Self {
        Self {
            ride,
            requester,
            iteration: 0,
            radius_m,
            ignored: BTreeSet::new(),
            offered_to: None,
            response_deadline: None,
            driver: None,
            accepted_at: None,
            requested_at,
            offers_sent: 0,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted_at.is_some()
    }
}

/// Search bookkeeping that only exists while a ride is `Searching`.
#[derive(Debug, Clone, Default, PartialEq, Component)]
pub struct SearchCursor {
    /// Iterations executed so far.
    pub iteration: u32,
    pub tick_ends_at: u64,
    /// Query of the current iteration; local candidates are re-checked
    /// against it right before they are offered.
    pub query: Option<CandidateQuery>,
    /// Remaining candidates of the current iteration, nearest first.
    pub candidates: VecDeque<Candidate>,
    /// Bumped on every offer; deadline events carry it to detect staleness.
    pub attempt: u32,
    pub gathering: Option<RequestId>,
    pub started_at: u64,
}
