//! Reconnect recovery tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code

mod common;

use common::Harness;
use ride_dispatch::CancelRequest;
use ride_dispatch_core::cancellation::CancellationReason;
use ride_dispatch_core::phase::TripPhase;
use ride_dispatch_core::ride::RouteLeg;
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::store::RideRequestStore;
use ride_dispatch_core::types::{DriverId, Location, Party, PassengerId, Role};

#[tokio::test]
async fn nothing_to_recover_without_rides() {
    let harness = Harness::new(1);

    assert_eq!(harness.service.recover_for_passenger(PassengerId::new()).await, Ok(None));
    assert_eq!(harness.service.recover_for_driver(DriverId::new()).await, Ok(None));
}

#[tokio::test]
async fn searching_passenger_lands_back_in_searching() {
    let harness = Harness::new(1);
    let passenger_id = PassengerId::new();
    let ride = harness.request_for(passenger_id).await;

    let view = harness
        .service
        .recover_for_passenger(passenger_id)
        .await
        .unwrap()
        .expect("live ride");

    assert_eq!(view.ride_id, ride.id);
    assert_eq!(view.viewer, Role::Passenger);
    assert_eq!(view.phase, TripPhase::Searching { since: ride.created_at });
    assert_eq!(view.counterpart, None);
    assert_eq!(view.missing_route, None);

    // Drivers only recover rides they hold
    assert_eq!(harness.service.recover_for_driver(harness.drivers[0]).await, Ok(None));
}

#[tokio::test]
async fn both_sides_recover_the_same_ride_with_a_missing_route() {
    let harness = Harness::new(1);
    let (ride, driver) = harness.accepted().await;

    let passenger_view = harness
        .service
        .recover_for_passenger(ride.passenger_id)
        .await
        .unwrap()
        .unwrap();
    let driver_view = harness.service.recover_for_driver(driver).await.unwrap().unwrap();

    assert_eq!(passenger_view.ride_id, driver_view.ride_id);
    assert_eq!(passenger_view.version, driver_view.version);
    assert_eq!(passenger_view.counterpart, Some(Party::Driver(driver)));
    assert_eq!(driver_view.counterpart, Some(Party::Passenger(ride.passenger_id)));
    assert!(matches!(passenger_view.phase, TripPhase::DriverAssigned { .. }));
    assert_eq!(passenger_view.missing_route, Some(RouteLeg::ToOrigin));

    // The client asks for the route it lacks; the next recovery has it
    harness
        .service
        .ensure_route(
            Party::Driver(driver),
            ride.id,
            RouteLeg::ToOrigin,
            Some(Location::new(40.4200, -3.7050, "Calle Mayor")),
        )
        .await
        .unwrap();
    let refreshed = harness.service.recover_for_driver(driver).await.unwrap().unwrap();
    assert_eq!(refreshed.missing_route, None);
    assert!(refreshed.route_to_origin.is_some());
}

#[tokio::test]
async fn recovery_is_read_only_and_repeatable() {
    let harness = Harness::new(1);
    let (ride, driver) = harness.accepted().await;
    for target in [RideStatus::DriverAtOrigin, RideStatus::TripStarted] {
        harness
            .service
            .advance_phase(driver, ride.id, target, None)
            .await
            .unwrap();
    }
    harness.service.settle().await;
    let before = harness.store.get(ride.id).await.unwrap();

    let first = harness.service.recover_for_driver(driver).await.unwrap();
    let second = harness.service.recover_for_driver(driver).await.unwrap();

    assert_eq!(first, second);
    let view = first.unwrap();
    assert!(matches!(view.phase, TripPhase::OnTrip { started_at: Some(_) }));
    assert_eq!(view.version, before.version);
    assert_eq!(harness.store.get(ride.id).await.unwrap(), before);
}

#[tokio::test]
async fn finished_rides_are_not_recovered() {
    let harness = Harness::new(1);
    let (completed, driver) = harness.accepted().await;
    for target in [
        RideStatus::DriverAtOrigin,
        RideStatus::TripStarted,
        RideStatus::TripCompleted,
    ] {
        harness
            .service
            .advance_phase(driver, completed.id, target, None)
            .await
            .unwrap();
    }

    let cancelled = harness.request().await;
    harness
        .service
        .cancel(
            Party::Passenger(cancelled.passenger_id),
            cancelled.id,
            CancelRequest::new(CancellationReason::ChangedMind),
        )
        .await
        .unwrap();

    assert_eq!(harness.service.recover_for_driver(driver).await, Ok(None));
    assert_eq!(harness.service.recover_for_passenger(completed.passenger_id).await, Ok(None));
    assert_eq!(harness.service.recover_for_passenger(cancelled.passenger_id).await, Ok(None));
}

#[tokio::test]
async fn restarted_service_recovers_from_the_shared_store() {
    let before = Harness::new(1);
    let (ride, driver) = before.accepted().await;
    before.service.shutdown();

    let after = Harness::over(before.store.clone(), before.clock.clone(), 0);
    let view = after.service.recover_for_driver(driver).await.unwrap().unwrap();

    assert_eq!(view.ride_id, ride.id);
    assert_eq!(view.status, RideStatus::Accepted);
}
