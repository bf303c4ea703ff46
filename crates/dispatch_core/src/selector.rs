//! Candidate selection: which drivers may be offered a ride, nearest first.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ecs::{ConnectionId, DriverState, GeoPoint, NodeId, RidePid, RideRequirements};
use crate::spatial::rounded_distance_m;

/// One eligible driver, possibly connected to another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub connection: ConnectionId,
    pub node: NodeId,
    /// Rounded great-circle distance to the pickup.
    pub distance_m: u32,
}

impl Candidate {
    fn order(&self, other: &Self) -> Ordering {
        self.distance_m
            .cmp(&other.distance_m)
            .then_with(|| self.connection.cmp(&other.connection))
    }
}

/// Everything a node needs to compute its local candidates for a ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub ride: RidePid,
    pub pickup: GeoPoint,
    pub radius_m: u32,
    pub ignored: BTreeSet<ConnectionId>,
    pub requirements: RideRequirements,
    pub too_away_m: u32,
}

/// Distance to the pickup when `driver` may be offered the ride, `None` otherwise.
pub fn eligible_distance(query: &CandidateQuery, driver: &DriverState, now: u64) -> Option<u32> {
    if !driver.is_available(now) {
        return None;
    }
    if query.ignored.contains(&driver.connection) || driver.ignored_rides.contains(&query.ride) {
        return None;
    }
    if !driver.config.accepts(&query.requirements) {
        return None;
    }
    let position = driver.position?;
    let distance = rounded_distance_m(query.pickup, position);
    (distance <= query.radius_m && distance <= query.too_away_m).then_some(distance)
}

/// Eligible drivers among `drivers`, ascending distance, ties by connection id.
pub fn select<'a, I>(query: &CandidateQuery, drivers: I, node: NodeId, now: u64) -> Vec<Candidate>
where
    I: IntoIterator<Item = &'a DriverState>,
{
    let mut candidates: Vec<Candidate> = drivers
        .into_iter()
        .filter_map(|driver| {
            eligible_distance(query, driver, now).map(|distance_m| Candidate {
                connection: driver.connection,
                node,
                distance_m,
            })
        })
        .collect();
    candidates.sort_by(Candidate::order);
    candidates
}

/// Merge candidate lists gathered from several nodes into one ordered list.
/// A connection reported twice keeps its first (nearest) entry.
pub fn merge(lists: impl IntoIterator<Item = Vec<Candidate>>) -> Vec<Candidate> {
    let mut merged: Vec<Candidate> = lists.into_iter().flatten().collect();
    merged.sort_by(Candidate::order);
    let mut seen = BTreeSet::new();
    merged.retain(|c| seen.insert(c.connection));
    merged
}
