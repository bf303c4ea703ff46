//! Spatial operations: great-circle distance and an H3 bucket index of drivers.
//!
//! This module provides:
//!
//! - **Distance**: haversine on a spherical earth (radius 6371 km), in metres
//! - **SpatialIndex**: H3 cell → driver entity buckets used to pre-filter
//!   candidate searches before the exact distance check
//!
//! Buckets use resolution 8 (~460 m edge), coarse enough that a 2 km search
//! touches a few hundred cells.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;

use bevy_ecs::prelude::{Entity, Resource};
use h3o::{CellIndex, LatLng, Resolution};
use lru::LruCache;

use crate::ecs::GeoPoint;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

const INDEX_RESOLUTION: Resolution = Resolution::Eight;
/// Average hexagon edge length at [INDEX_RESOLUTION].
const INDEX_EDGE_M: f64 = 461.354_684;
const DISK_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(1_024) {
    Some(size) => size,
    None => unreachable!(),
};

/// Great-circle distance in metres.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lng.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Distance rounded to the nearest metre, as used for eligibility comparisons.
pub fn rounded_distance_m(a: GeoPoint, b: GeoPoint) -> u32 {
    let metres = haversine_m(a, b).round();
    if metres >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        metres as u32
    }
}

fn cell_of(point: GeoPoint) -> Option<CellIndex> {
    LatLng::new(point.lat, point.lng)
        .ok()
        .map(|ll| ll.to_cell(INDEX_RESOLUTION))
}

/// Grid distance (rings) that safely covers `radius_m` around any cell centre.
fn rings_for_radius(radius_m: u32) -> u32 {
    // Each ring adds at least ~1.5 edges; halve that to absorb H3 cell distortion.
    ((f64::from(radius_m) + INDEX_EDGE_M) / (0.75 * INDEX_EDGE_M)).ceil() as u32
}

/// Driver entities bucketed by H3 cell.
///
/// Maintained incrementally by the spatial index system as driver positions
/// change; drivers without a known position are not indexed.
#[derive(Resource)]
pub struct SpatialIndex {
    drivers_by_cell: HashMap<CellIndex, Vec<Entity>>,
    driver_entity_to_cell: HashMap<Entity, CellIndex>,
    disk_cache: LruCache<(CellIndex, u32), Vec<CellIndex>>,
}

impl fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("cells", &self.drivers_by_cell.len())
            .field("drivers", &self.driver_entity_to_cell.len())
            .finish()
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self {
            drivers_by_cell: HashMap::new(),
            driver_entity_to_cell: HashMap::new(),
            disk_cache: LruCache::new(DISK_CACHE_SIZE),
        }
    }

    /// Index or re-index a driver at `point`.
    pub fn upsert_driver(&mut self, entity: Entity, point: GeoPoint) {
        let Some(cell) = cell_of(point) else {
            self.remove_driver(entity);
            return;
        };
        match self.driver_entity_to_cell.get(&entity) {
            Some(old) if *old == cell => return,
            Some(_) => self.remove_driver(entity),
            None => {}
        }
        self.drivers_by_cell.entry(cell).or_default().push(entity);
        self.driver_entity_to_cell.insert(entity, cell);
    }

    pub fn remove_driver(&mut self, entity: Entity) {
        if let Some(cell) = self.driver_entity_to_cell.remove(&entity) {
            if let Some(entities) = self.drivers_by_cell.get_mut(&cell) {
                entities.retain(|&e| e != entity);
                if entities.is_empty() {
                    self.drivers_by_cell.remove(&cell);
                }
            }
        }
    }

    pub fn driver_cell(&self, entity: Entity) -> Option<CellIndex> {
        self.driver_entity_to_cell.get(&entity).copied()
    }

    pub fn len(&self) -> usize {
        self.driver_entity_to_cell.len()
    }

    pub fn is_empty(&self) -> bool {
        self.driver_entity_to_cell.is_empty()
    }

    /// Drivers whose bucket may lie within `radius_m` of `point`. Superset of
    /// the true answer; `None` when `point` cannot be indexed.
    pub fn drivers_near(&mut self, point: GeoPoint, radius_m: u32) -> Option<Vec<Entity>> {
        let origin = cell_of(point)?;
        let k = rings_for_radius(radius_m);
        let cells = self
            .disk_cache
            .get_or_insert((origin, k), || origin.grid_disk::<Vec<_>>(k))
            .clone();
        let mut result = Vec::new();
        for cell in &cells {
            if let Some(entities) = self.drivers_by_cell.get(cell) {
                result.extend(entities.iter().copied());
            }
        }
        Some(result)
    }

    pub fn clear(&mut self) {
        self.drivers_by_cell.clear();
        self.driver_entity_to_cell.clear();
    }
}
