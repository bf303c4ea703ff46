//! Keeps [SpatialIndex] in step with driver positions.

use bevy_ecs::prelude::{Changed, Entity, Query, RemovedComponents, ResMut};

use crate::ecs::DriverState;
use crate::spatial::SpatialIndex;

/// Re-buckets drivers whose state changed and drops despawned ones.
/// Runs after every event, after deferred commands were applied.
pub fn spatial_index_system(
    mut spatial_index: ResMut<SpatialIndex>,
    changed: Query<(Entity, &DriverState), Changed<DriverState>>,
    mut removed: RemovedComponents<DriverState>,
) {
    if changed.is_empty() && removed.is_empty() {
        return;
    }
    for (entity, driver) in changed.iter() {
        match driver.position {
            Some(point) => spatial_index.upsert_driver(entity, point),
            None => spatial_index.remove_driver(entity),
        }
    }
    for entity in removed.read() {
        spatial_index.remove_driver(entity);
    }
}
