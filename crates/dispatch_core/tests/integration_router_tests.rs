mod support;

use dispatch_core::ecs::{DispatchState, RideStatus};
use dispatch_core::test_helpers::{offer_response_frame, point_north_of, position_frame, TEST_PICKUP};
use dispatch_core::wire::WireEvent;

use support::cluster::TestCluster;

#[test]
fn remote_rider_gets_acceptance_once_and_it_is_acknowledged_once() {
    let mut t = TestCluster::new(2);
    let rider = t.rider(1);
    let driver = t.driver(0, point_north_of(TEST_PICKUP, 500.0));
    let ride = t.dispatch(0, 1, &rider);

    t.run_until(2_000);
    t.send(&driver, offer_response_frame(ride, true));
    t.run_until(10_000);

    assert_eq!(
        rider.count(|e| matches!(e, WireEvent::VoyagerRideAccepted { .. })),
        1
    );
    let owner = t.node(0);
    // Local driver transition plus the remote rider acknowledgement.
    assert_eq!(owner.telemetry().requests_acked, 2);
    assert_eq!(owner.telemetry().requests_timed_out, 0);
    assert_eq!(owner.pending_requests(), 0);
}

#[test]
fn acknowledgement_times_out_once_when_nobody_owns_the_connection() {
    let mut t = TestCluster::new(2);
    let rider = t.rider(1);
    let driver = t.driver(0, point_north_of(TEST_PICKUP, 500.0));
    let ride = t.dispatch(0, 1, &rider);

    t.node_mut(1)
        .disconnect(rider.connection)
        .expect("rider was connected");
    t.run_until(2_000);
    t.send(&driver, offer_response_frame(ride, true));
    t.settle();
    assert_eq!(t.node(0).pending_requests(), 1);

    t.run_until(2_000 + 2_999);
    assert_eq!(t.node(0).telemetry().requests_timed_out, 0);
    t.run_until(2_000 + 3_000);
    assert_eq!(t.node(0).telemetry().requests_timed_out, 1);
    t.run_until(60_000);
    assert_eq!(t.node(0).telemetry().requests_timed_out, 1);
    assert_eq!(t.node(0).pending_requests(), 0);
    assert_eq!(
        t.node(0).ride(ride).map(|r| r.status),
        Some(RideStatus::Accepted),
        "a lost notification does not undo the acceptance"
    );
}

#[test]
fn own_envelopes_are_suppressed() {
    let mut t = TestCluster::new(1);
    let rider = t.rider(0);
    t.dispatch(0, 1, &rider);

    let telemetry = t.node(0).telemetry();
    assert!(telemetry.envelopes_suppressed >= 1);
    assert_eq!(t.node(0).pending_requests(), 0, "no peers, nothing to wait for");
}

#[test]
fn broker_outage_degrades_to_local_candidates() {
    let mut t = TestCluster::new(2);
    let rider = t.rider(0);
    let local = t.driver(0, point_north_of(TEST_PICKUP, 900.0));
    let remote = t.driver(1, point_north_of(TEST_PICKUP, 200.0));
    t.cluster.broker().set_available(false);

    let ride = t.dispatch(0, 1, &rider);

    assert_eq!(local.offers(), vec![ride]);
    assert!(remote.offers().is_empty());
    assert!(t.node(0).telemetry().transport_failures >= 1);
}

#[test]
fn remote_candidates_are_merged_with_local_ones_by_distance() {
    let mut t = TestCluster::new(3);
    let rider = t.rider(0);
    let far_local = t.driver(0, point_north_of(TEST_PICKUP, 800.0));
    let near_remote = t.driver(2, point_north_of(TEST_PICKUP, 300.0));
    let mid_remote = t.driver(1, point_north_of(TEST_PICKUP, 500.0));

    let ride = t.dispatch(0, 1, &rider);
    assert_eq!(near_remote.offers(), vec![ride]);
    assert!(mid_remote.offers().is_empty());

    t.run_until(200);
    t.send(&near_remote, offer_response_frame(ride, false));
    t.run_until(300);
    assert_eq!(mid_remote.offers(), vec![ride]);
    assert!(far_local.offers().is_empty());
}

#[test]
fn driver_position_is_relayed_to_the_rider_of_its_ride() {
    let mut t = TestCluster::new(2);
    let rider = t.rider(0);
    let driver = t.driver(1, point_north_of(TEST_PICKUP, 500.0));
    let ride = t.dispatch(0, 1, &rider);
    t.send(&driver, offer_response_frame(ride, true));
    t.settle();

    let moved = point_north_of(TEST_PICKUP, 400.0);
    t.run_until(3_000);
    t.send(&driver, position_frame(moved, Some(ride)));
    t.settle();

    let relayed: Vec<_> = rider
        .events()
        .into_iter()
        .filter_map(|e| match e {
            WireEvent::Position(update) => Some(update),
            _ => None,
        })
        .collect();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].point, moved);
    assert_eq!(relayed[0].ride, Some(ride));
}

#[test]
fn rider_position_moves_the_pickup_of_a_searching_ride() {
    let mut t = TestCluster::new(2);
    let rider = t.rider(1);
    let ride = t.dispatch(0, 1, &rider);

    let moved = point_north_of(TEST_PICKUP, 250.0);
    t.run_until(1_500);
    t.send(&rider, position_frame(moved, Some(ride)));
    t.settle();

    assert_eq!(t.node(0).ride(ride).map(|r| r.pickup), Some(moved));
}

#[test]
fn remote_driver_taken_meanwhile_refuses_and_the_next_candidate_is_offered() {
    let mut t = TestCluster::new(2);
    let rider = t.rider(0);
    let other_rider = t.rider(1);
    let local = t.driver(0, point_north_of(TEST_PICKUP, 900.0));
    let remote = t.driver(1, point_north_of(TEST_PICKUP, 300.0));

    let ride = t.start(0, 1, &rider);
    // Query out, candidates back.
    t.step_until_published(2);

    // Node 1 hands its driver to a ride of its own before the offer arrives.
    t.cluster.broker().set_available(false);
    let taken = t.collaborators.book(2, other_rider.connection, TEST_PICKUP);
    t.node_mut(1).start_dispatch(taken).expect("ride is dispatchable");
    let now = t.now();
    t.node_mut(1).run_until(now);
    assert_eq!(remote.offers(), vec![taken]);
    t.cluster.broker().set_available(true);

    t.settle();

    assert_eq!(remote.offers(), vec![taken]);
    assert_eq!(local.offers(), vec![ride]);
    let offer = t.node(0).offer(ride).expect("offer");
    assert_eq!(offer.offered_to, Some(local.connection));
    assert!(!offer.ignored.contains(&remote.connection));
    assert_eq!(t.node(0).telemetry().delivery_failures, 0);
    assert_eq!(
        t.node(1).driver(remote.connection).map(|d| (d.dispatch_state, d.current_ride)),
        Some((DispatchState::Offered, Some(taken)))
    );
}

#[test]
fn broker_outage_after_gathering_moves_the_offer_to_a_local_candidate() {
    let mut t = TestCluster::new(2);
    let rider = t.rider(0);
    let local = t.driver(0, point_north_of(TEST_PICKUP, 900.0));
    let remote = t.driver(1, point_north_of(TEST_PICKUP, 300.0));

    let ride = t.start(0, 1, &rider);
    t.step_until_published(2);
    t.cluster.broker().set_available(false);
    t.settle();

    assert!(remote.offers().is_empty());
    assert_eq!(local.offers(), vec![ride]);
    let node = t.node(0);
    assert_eq!(node.telemetry().delivery_failures, 1);
    let offer = node.offer(ride).expect("offer");
    assert_eq!(offer.offered_to, Some(local.connection));
    assert!(offer.ignored.contains(&remote.connection));
    assert_eq!(node.ride(ride).map(|r| r.status), Some(RideStatus::Searching));
}

#[test]
fn remote_offer_to_a_vanished_driver_fails_when_its_ack_times_out() {
    let mut t = TestCluster::new(2);
    let rider = t.rider(0);
    let local = t.driver(0, point_north_of(TEST_PICKUP, 900.0));
    let remote = t.driver(1, point_north_of(TEST_PICKUP, 300.0));

    let ride = t.start(0, 1, &rider);
    t.step_until_published(2);
    t.node_mut(1)
        .disconnect(remote.connection)
        .expect("driver is connected");
    t.settle();
    assert_eq!(
        t.node(0).offer(ride).and_then(|o| o.offered_to),
        Some(remote.connection)
    );

    t.run_until(2_999);
    assert!(local.offers().is_empty());

    t.run_until(3_000);
    assert_eq!(local.offers(), vec![ride]);
    let node = t.node(0);
    assert_eq!(node.telemetry().delivery_failures, 1);
    assert_eq!(node.telemetry().requests_timed_out, 1);
    assert!(node
        .offer(ride)
        .is_some_and(|o| o.ignored.contains(&remote.connection)));
}
