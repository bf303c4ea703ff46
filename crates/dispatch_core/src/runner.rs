//! Node runner: advances the clock and routes events into the ECS.
//!
//! Clock progression and event routing happen here, outside systems. Each step
//! pops the next event from [SimulationClock], inserts it as [CurrentEvent],
//! then runs the schedule. Exactly one event system reacts to each event.

use bevy_ecs::prelude::{Res, Schedule, World};
use bevy_ecs::schedule::{apply_deferred, IntoSystemConfigs};

use crate::clock::{CurrentEvent, EventKind, SimulationClock};
use crate::systems::{
    dispatch::{
        offer_deadline_system, ride_command_system, ride_requested_system,
        search_iteration_system,
    },
    envelope::envelope_received_system,
    gateway::frame_received_system,
    requests::{request_deadline_system, request_resolved_system},
    spatial_index::spatial_index_system,
};

/// Run condition: the current event is of `kind`.
pub fn on_event(kind: EventKind) -> impl FnMut(Option<Res<CurrentEvent>>) -> bool + Clone {
    move |event: Option<Res<CurrentEvent>>| event.map(|e| e.0.kind == kind).unwrap_or(false)
}

/// Builds the node schedule: one system per event kind, then [apply_deferred]
/// so spawned and despawned rides are visible to the next event, then the
/// spatial index refresh.
pub fn dispatch_schedule() -> Schedule {
    let mut schedule = Schedule::default();
    schedule.add_systems(
        (
            ride_requested_system.run_if(on_event(EventKind::RideRequested)),
            frame_received_system.run_if(on_event(EventKind::FrameReceived)),
            envelope_received_system.run_if(on_event(EventKind::EnvelopeReceived)),
            ride_command_system.run_if(on_event(EventKind::RideCommandQueued)),
            search_iteration_system.run_if(on_event(EventKind::SearchIteration)),
            offer_deadline_system.run_if(on_event(EventKind::OfferDeadline)),
            request_deadline_system.run_if(on_event(EventKind::RequestDeadline)),
            request_resolved_system.run_if(on_event(EventKind::RequestResolved)),
            apply_deferred,
            spatial_index_system,
        )
            .chain(),
    );
    schedule
}

/// Runs one step: pops the next event, inserts it as [CurrentEvent], then runs the schedule.
/// Returns `false` when the clock is empty.
pub fn run_next_event(world: &mut World, schedule: &mut Schedule) -> bool {
    let event = match world.resource_mut::<SimulationClock>().pop_next() {
        Some(e) => e,
        None => return false,
    };
    world.insert_resource(CurrentEvent(event));
    schedule.run(world);
    world.clear_trackers();
    true
}

/// Processes every event due at or before `until`, then moves the clock to `until`.
/// Returns the number of events processed.
pub fn run_until(world: &mut World, schedule: &mut Schedule, until: u64) -> usize {
    let mut steps = 0;
    loop {
        let due = world
            .resource::<SimulationClock>()
            .next_event_time()
            .is_some_and(|ts| ts <= until);
        if !due || !run_next_event(world, schedule) {
            break;
        }
        steps += 1;
    }
    world.resource_mut::<SimulationClock>().advance_to(until);
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::EventSubject;
    use crate::ecs::RidePid;

    #[test]
    fn run_until_stops_at_the_horizon() {
        let mut world = World::new();
        world.insert_resource(SimulationClock::default());
        let mut schedule = Schedule::default();
        {
            let mut clock = world.resource_mut::<SimulationClock>();
            clock.schedule_at(10, EventKind::SearchIteration, Some(EventSubject::Ride(RidePid(1))));
            clock.schedule_at(20, EventKind::SearchIteration, Some(EventSubject::Ride(RidePid(1))));
        }

        assert_eq!(run_until(&mut world, &mut schedule, 15), 1);
        let clock = world.resource::<SimulationClock>();
        assert_eq!(clock.now(), 15);
        assert_eq!(clock.next_event_time(), Some(20));
    }

    #[derive(Default, bevy_ecs::prelude::Resource)]
    struct Hits(u32);

    #[test]
    fn on_event_matches_kind_only() {
        let mut world = World::new();
        world.insert_resource(SimulationClock::default());
        world.init_resource::<Hits>();
        {
            let mut clock = world.resource_mut::<SimulationClock>();
            clock.schedule_now(EventKind::OfferDeadline, None);
            clock.schedule_now(EventKind::SearchIteration, None);
        }
        let mut schedule = Schedule::default();
        schedule.add_systems(
            (|mut hits: bevy_ecs::prelude::ResMut<Hits>| hits.0 += 1)
                .run_if(on_event(EventKind::OfferDeadline)),
        );

        assert!(run_next_event(&mut world, &mut schedule));
        assert!(run_next_event(&mut world, &mut schedule));
        assert!(!run_next_event(&mut world, &mut schedule));
        assert_eq!(world.resource::<Hits>().0, 1);
    }
}
