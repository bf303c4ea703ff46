//! One dispatch node: a world, its schedule and the facade the connection
//! server calls into.
//!
//! Every input (socket frame, broker envelope, dispatch request) is queued
//! and turned into a clock event; nothing touches dispatch state outside the
//! schedule except connection bookkeeping.

use std::sync::Arc;

use bevy_ecs::prelude::{Mut, Resource, Schedule, World};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::broker::{Broker, Subscription};
use crate::clock::{EventKind, EventSubject, SimulationClock};
use crate::collaborators::Collaborators;
use crate::config::NodeConfig;
use crate::context::{DispatchRequests, EnvelopeInbox, FrameInbox, RideCommandQueue};
use crate::coordinator::RideIndex;
use crate::ecs::{
    Connection, ConnectionId, DriverState, NodeId, Offer, Ride, RidePid, RideStatus, RiderState,
    Role,
};
use crate::error::DispatchError;
use crate::registry::{ConnectionRegistry, RegisteredConnection, SocketHandle};
use crate::router::NodeRouter;
use crate::runner::{dispatch_schedule, run_next_event, run_until};
use crate::spatial::SpatialIndex;
use crate::telemetry::DispatchTelemetry;

/// Seeded source of connection identifiers.
#[derive(Debug, Resource)]
pub struct IdAllocator {
    rng: StdRng,
}

impl IdAllocator {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn node_id(&mut self) -> NodeId {
        NodeId(self.rng.gen_range(1..u64::MAX))
    }

    /// A connection id not present in `registry`.
    pub fn connection_id(&mut self, registry: &ConnectionRegistry) -> ConnectionId {
        loop {
            let id = ConnectionId(self.rng.gen());
            if !registry.contains(id) {
                return id;
            }
        }
    }
}

pub struct DispatchNode {
    world: World,
    schedule: Schedule,
}

impl DispatchNode {
    pub fn new(
        config: NodeConfig,
        broker: Arc<dyn Broker>,
        collaborators: Collaborators,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let mut ids = IdAllocator::seeded(config.seed);
        let node_id = config.node_id.unwrap_or_else(|| ids.node_id());

        let mut world = World::new();
        world.insert_resource(SimulationClock::default());
        world.insert_resource(NodeRouter::new(node_id, broker, &config));
        world.insert_resource(config.dispatch);
        world.insert_resource(collaborators);
        world.insert_resource(ids);
        world.init_resource::<ConnectionRegistry>();
        world.init_resource::<RideIndex>();
        world.init_resource::<SpatialIndex>();
        world.init_resource::<DispatchTelemetry>();
        world.init_resource::<FrameInbox>();
        world.init_resource::<EnvelopeInbox>();
        world.init_resource::<DispatchRequests>();
        world.init_resource::<RideCommandQueue>();

        info!(node = %node_id, "dispatch node ready");
        Ok(Self {
            world,
            schedule: dispatch_schedule(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.world.resource::<NodeRouter>().node_id()
    }

    /// Accept a client connection after verifying its session token.
    pub fn connect(
        &mut self,
        token: &str,
        role: Role,
        socket: SocketHandle,
    ) -> Result<ConnectionId, DispatchError> {
        let identity = self.world.resource::<Collaborators>().sessions.verify(token)?;
        if !identity.roles.contains(&role) {
            return Err(DispatchError::RoleNotPermitted(role));
        }
        let node = self.node_id();
        let id = self
            .world
            .resource_scope(|world, mut ids: Mut<IdAllocator>| {
                ids.connection_id(world.resource::<ConnectionRegistry>())
            });
        let connection = Connection {
            id,
            role,
            participant: identity.participant,
            node,
            socket,
        };
        let entity = match role {
            Role::Driver => self.world.spawn((connection, DriverState::new(id))).id(),
            Role::Rider => self.world.spawn((connection, RiderState::new(id))).id(),
        };
        self.world.resource_mut::<ConnectionRegistry>().register(
            id,
            RegisteredConnection {
                entity,
                role,
                participant: identity.participant,
            },
        );
        info!(node = %node, connection = %id, %role, participant = %identity.participant, "connected");
        Ok(id)
    }

    /// Forget a connection. Rides it took part in are left to their owners.
    pub fn disconnect(&mut self, connection: ConnectionId) -> Result<(), DispatchError> {
        let entry = self
            .world
            .resource_mut::<ConnectionRegistry>()
            .unregister(connection)
            .ok_or(DispatchError::UnknownConnection(connection))?;
        self.world
            .resource_mut::<SpatialIndex>()
            .remove_driver(entry.entity);
        self.world.despawn(entry.entity);
        info!(node = %self.node_id(), connection = %connection, "disconnected");
        Ok(())
    }

    /// Queue a frame read from `connection`'s socket.
    pub fn receive_frame(&mut self, connection: ConnectionId, frame: Vec<u8>) {
        self.world.resource_mut::<FrameInbox>().push(connection, frame);
        self.world
            .resource_mut::<SimulationClock>()
            .schedule_now(EventKind::FrameReceived, Some(EventSubject::Connection(connection)));
    }

    /// Queue an envelope drained from the broker.
    pub fn receive_envelope(&mut self, bytes: Vec<u8>) {
        self.world.resource_mut::<EnvelopeInbox>().push(bytes);
        self.world
            .resource_mut::<SimulationClock>()
            .schedule_now(EventKind::EnvelopeReceived, None);
    }

    /// Drain `subscription` into the envelope inbox. Returns the number of envelopes queued.
    pub fn pump(&mut self, subscription: &mut dyn Subscription) -> usize {
        let envelopes = subscription.drain();
        let count = envelopes.len();
        for bytes in envelopes {
            self.receive_envelope(bytes);
        }
        count
    }

    /// Become the owner of a persisted ride and start searching for a driver.
    pub fn start_dispatch(&mut self, ride: RidePid) -> Result<(), DispatchError> {
        if let Some(current) = self.ride(ride) {
            return Err(DispatchError::RideNotDispatchable {
                ride,
                status: current.status,
            });
        }
        let record = self.world.resource::<Collaborators>().rides.find(ride)?;
        if record.status != RideStatus::Created {
            return Err(DispatchError::RideNotDispatchable {
                ride,
                status: record.status,
            });
        }
        self.world.resource_mut::<DispatchRequests>().push(record);
        self.world
            .resource_mut::<SimulationClock>()
            .schedule_now(EventKind::RideRequested, Some(EventSubject::Ride(ride)));
        Ok(())
    }

    pub fn now(&self) -> u64 {
        self.world.resource::<SimulationClock>().now()
    }

    pub fn next_event_time(&self) -> Option<u64> {
        self.world.resource::<SimulationClock>().next_event_time()
    }

    /// Move idle time forward; pending events are never skipped.
    pub fn advance_to(&mut self, timestamp: u64) {
        self.world
            .resource_mut::<SimulationClock>()
            .advance_to(timestamp);
    }

    pub fn run_next_event(&mut self) -> bool {
        run_next_event(&mut self.world, &mut self.schedule)
    }

    /// Process every event due up to `until`. Returns the number processed.
    pub fn run_until(&mut self, until: u64) -> usize {
        run_until(&mut self.world, &mut self.schedule, until)
    }

    pub fn ride(&self, ride: RidePid) -> Option<&Ride> {
        let entity = self.world.resource::<RideIndex>().get(ride)?;
        self.world.get::<Ride>(entity)
    }

    pub fn offer(&self, ride: RidePid) -> Option<&Offer> {
        let entity = self.world.resource::<RideIndex>().get(ride)?;
        self.world.get::<Offer>(entity)
    }

    pub fn owns_ride(&self, ride: RidePid) -> bool {
        self.world.resource::<RideIndex>().contains(ride)
    }

    pub fn driver(&self, connection: ConnectionId) -> Option<&DriverState> {
        let entity = self.registry().get(connection)?.entity;
        self.world.get::<DriverState>(entity)
    }

    pub fn rider(&self, connection: ConnectionId) -> Option<&RiderState> {
        let entity = self.registry().get(connection)?.entity;
        self.world.get::<RiderState>(entity)
    }

    pub fn telemetry(&self) -> &DispatchTelemetry {
        self.world.resource::<DispatchTelemetry>()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.world.resource::<ConnectionRegistry>()
    }

    pub fn pending_requests(&self) -> usize {
        self.world.resource::<NodeRouter>().pending_len()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }
}
