//! Run a three-node cluster with drivers spread around one pickup area and
//! dispatch a batch of rides, then print what happened to each ride.
//!
//! Run with: RUST_LOG=dispatch_core=info cargo run -p dispatch_core --example cluster_run

use dispatch_core::cluster::LocalCluster;
use dispatch_core::config::NodeConfig;
use dispatch_core::ecs::{ConnectionId, Role};
use dispatch_core::registry::MemorySocket;
use dispatch_core::test_helpers::{
    offer_response_frame, point_north_of, setup_frame, TestCollaborators, TEST_PICKUP,
};
use dispatch_core::wire::WireEvent;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    const NODES: usize = 3;
    const DRIVERS: u64 = 24;
    const RIDES: u64 = 12;
    const HORIZON_MS: u64 = 10 * 60 * 1000;

    let collaborators = TestCollaborators::new();
    let mut cluster = LocalCluster::new(
        NODES,
        NodeConfig::default().with_seed(123),
        collaborators.collaborators(),
    )
    .expect("default config is valid");

    let mut drivers = Vec::new();
    for i in 0..DRIVERS {
        let token = format!("driver-{i}");
        collaborators.grant(&token, i + 1, Role::Driver);
        let socket = MemorySocket::new(ConnectionId(i + 1));
        let node = (i as usize) % NODES;
        let connection = cluster
            .node_mut(node)
            .connect(&token, Role::Driver, socket.handle())
            .expect("granted token");
        let point = point_north_of(TEST_PICKUP, 150.0 * (i + 1) as f64);
        cluster.node_mut(node).receive_frame(connection, setup_frame(point));
        drivers.push((node, connection, socket));
    }

    collaborators.grant("rider", 10_000, Role::Rider);
    let rider_socket = MemorySocket::new(ConnectionId(10_000));
    let rider = cluster
        .node_mut(0)
        .connect("rider", Role::Rider, rider_socket.handle())
        .expect("granted token");

    let mut rides = Vec::new();
    for pid in 1..=RIDES {
        let ride = collaborators.book(pid, rider, TEST_PICKUP);
        cluster
            .node_mut((pid as usize) % NODES)
            .start_dispatch(ride)
            .expect("freshly booked ride");
        rides.push(ride);
    }

    // Every other driver accepts whatever it is offered, one second later.
    let mut answered = 0usize;
    let mut steps = 0usize;
    while cluster.now() < HORIZON_MS && cluster.step() {
        steps += 1;
        for (i, (node, connection, socket)) in drivers.iter().enumerate() {
            for frame in socket.take_frames() {
                if let Ok(WireEvent::Offer { ride }) = WireEvent::decode(&frame) {
                    let accept = i % 2 == 0;
                    cluster
                        .node_mut(*node)
                        .receive_frame(*connection, offer_response_frame(ride, accept));
                    answered += 1;
                }
            }
        }
    }

    println!("--- Cluster run ({NODES} nodes, {DRIVERS} drivers, {RIDES} rides, seed 123) ---");
    println!("Steps executed: {steps}");
    println!("Offers answered: {answered}");
    println!("Simulation time: {} s", cluster.now() / 1000);
    for index in 0..cluster.len() {
        let node = cluster.node(index);
        let t = node.telemetry();
        println!(
            "  node {} offers_sent={} declined={} timed_out={} accepted={} exhausted={} acked={} ack_timeouts={}",
            node.node_id(),
            t.offers_sent,
            t.offers_declined,
            t.offers_timed_out,
            t.rides_accepted,
            t.rides_exhausted,
            t.requests_acked,
            t.requests_timed_out,
        );
    }

    println!("\nRides:");
    for ride in rides {
        let owner = (0..cluster.len()).find(|&i| cluster.node(i).owns_ride(ride));
        match owner.and_then(|i| cluster.node(i).offer(ride)) {
            Some(offer) => println!(
                "  {ride}  status={:?} driver={:?} accepted_at={:?} offers={}",
                owner.and_then(|i| cluster.node(i).ride(ride)).map(|r| r.status),
                offer.driver,
                offer.accepted_at,
                offer.offers_sent,
            ),
            None => println!(
                "  {ride}  finished as {:?}",
                collaborators.rides.get(ride).map(|r| r.status)
            ),
        }
    }
}
