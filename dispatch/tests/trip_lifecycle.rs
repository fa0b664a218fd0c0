//! Trip phase tests: the driver-driven path from acceptance to completion.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code

mod common;

use common::Harness;
use ride_dispatch::CancelRequest;
use ride_dispatch_core::cancellation::CancellationReason;
use ride_dispatch_core::collaborators::RoutingError;
use ride_dispatch_core::error::RideError;
use ride_dispatch_core::geo::Polyline;
use ride_dispatch_core::ride::RouteLeg;
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::store::RideRequestStore;
use ride_dispatch_core::types::{DriverId, Location, Party, PassengerId};
use ride_dispatch_testing::{ScriptedRoutingProvider, fixtures};
use std::sync::Arc;

fn driver_position() -> Location {
    Location::new(40.4200, -3.7050, "Calle Mayor")
}

#[tokio::test]
async fn accepted_ride_runs_to_completion_at_the_quoted_fare() {
    let harness = Harness::new(1);
    let (ride, driver) = harness.accepted().await;

    let at_origin = harness
        .service
        .advance_phase(driver, ride.id, RideStatus::DriverAtOrigin, None)
        .await
        .unwrap();
    assert!(at_origin.driver_arrived_at_origin_at.is_some());

    let started = harness
        .service
        .advance_phase(driver, ride.id, RideStatus::TripStarted, None)
        .await
        .unwrap();
    assert!(started.trip_started_at.is_some());

    let completed = harness
        .service
        .advance_phase(driver, ride.id, RideStatus::TripCompleted, None)
        .await
        .unwrap();
    assert_eq!(completed.status, RideStatus::TripCompleted);
    assert_eq!(completed.actual_fare, Some(completed.estimated_fare));
    assert_eq!(completed.actual_fare, Some(fixtures::FARE));
    assert!(completed.completed_at.is_some());

    harness.service.settle().await;
    assert_eq!(
        harness.store.status_history(ride.id),
        vec![
            RideStatus::Pending,
            RideStatus::Accepted,
            RideStatus::DriverAtOrigin,
            RideStatus::TripStarted,
            RideStatus::TripCompleted,
        ]
    );

    // Completion is irreversible: a late cancel conflicts but is still logged
    let late = harness
        .service
        .cancel(
            Party::Passenger(ride.passenger_id),
            ride.id,
            CancelRequest::new(CancellationReason::ChangedMind),
        )
        .await;
    assert_eq!(
        late,
        Err(RideError::Conflict {
            ride_id: ride.id,
            current: RideStatus::TripCompleted,
        })
    );
    let log = harness.log.all();
    assert_eq!(log.len(), 1);
    assert!(!log[0].applied);
    assert_eq!(harness.store.get(ride.id).await.unwrap().status, RideStatus::TripCompleted);
}

#[tokio::test]
async fn full_path_caches_both_routes() {
    let harness = Harness::new(1);
    let (ride, driver) = harness.accepted().await;

    harness
        .service
        .advance_phase(driver, ride.id, RideStatus::DriverEnRouteToOrigin, Some(driver_position()))
        .await
        .unwrap();
    harness.service.settle().await;
    let en_route = harness.store.get(ride.id).await.unwrap();
    assert_eq!(en_route.status, RideStatus::DriverEnRouteToOrigin);
    assert!(en_route.route_to_origin.is_some());

    for target in [RideStatus::DriverAtOrigin, RideStatus::TripStarted] {
        harness
            .service
            .advance_phase(driver, ride.id, target, None)
            .await
            .unwrap();
    }
    harness.service.settle().await;
    let on_trip = harness.store.get(ride.id).await.unwrap();
    assert_eq!(on_trip.status, RideStatus::TripStarted);
    assert!(on_trip.route_to_destination.is_some());

    for target in [RideStatus::DriverAtDestination, RideStatus::TripCompleted] {
        harness
            .service
            .advance_phase(driver, ride.id, target, None)
            .await
            .unwrap();
    }
    let done = harness.store.get(ride.id).await.unwrap();
    assert_eq!(done.status, RideStatus::TripCompleted);
    assert!(done.driver_arrived_at_destination_at.is_some());
}

#[tokio::test]
async fn routing_outage_falls_back_to_straight_line() {
    let routing = Arc::new(ScriptedRoutingProvider::failing(RoutingError::Timeout));
    let harness = Harness::new(1).with_env(|env| env.with_routing(routing.clone()));
    let (ride, driver) = harness.accepted().await;

    harness
        .service
        .advance_phase(driver, ride.id, RideStatus::DriverEnRouteToOrigin, Some(driver_position()))
        .await
        .unwrap();
    harness.service.settle().await;

    let stored = harness.store.get(ride.id).await.unwrap();
    assert_eq!(
        stored.route_to_origin,
        Some(Polyline::straight_line(&driver_position(), &ride.origin))
    );
    // One attempt plus one retry
    assert_eq!(routing.call_count(), 2);
}

#[tokio::test]
async fn provider_route_is_cached_verbatim() {
    let routing = Arc::new(ScriptedRoutingProvider::succeeding(Polyline::new("_p~iF~ps|U_ulLnnqC")));
    let harness = Harness::new(1).with_env(|env| env.with_routing(routing.clone()));
    let (ride, driver) = harness.accepted().await;

    for target in [RideStatus::DriverAtOrigin, RideStatus::TripStarted] {
        harness
            .service
            .advance_phase(driver, ride.id, target, None)
            .await
            .unwrap();
    }
    harness.service.settle().await;

    let stored = harness.store.get(ride.id).await.unwrap();
    assert_eq!(stored.route_to_destination, Some(Polyline::new("_p~iF~ps|U_ulLnnqC")));
    assert_eq!(routing.calls(), vec![(ride.origin.clone(), ride.destination.clone())]);
}

#[tokio::test]
async fn skipping_a_required_phase_conflicts() {
    let harness = Harness::new(1);
    let (ride, driver) = harness.accepted().await;

    let outcome = harness
        .service
        .advance_phase(driver, ride.id, RideStatus::DriverAtDestination, None)
        .await;

    assert_eq!(
        outcome,
        Err(RideError::Conflict {
            ride_id: ride.id,
            current: RideStatus::Accepted,
        })
    );
}

#[tokio::test]
async fn only_the_assigned_driver_advances() {
    let harness = Harness::new(1);
    let (ride, _) = harness.accepted().await;

    let outcome = harness
        .service
        .advance_phase(DriverId::new(), ride.id, RideStatus::DriverAtOrigin, None)
        .await;

    assert!(matches!(outcome, Err(RideError::ValidationFailure(_))));
}

#[tokio::test]
async fn non_phase_targets_are_rejected() {
    let harness = Harness::new(1);
    let (ride, driver) = harness.accepted().await;

    let outcome = harness
        .service
        .advance_phase(driver, ride.id, RideStatus::CancelledByDriver, None)
        .await;

    assert!(matches!(outcome, Err(RideError::ValidationFailure(_))));
}

#[tokio::test]
async fn advance_after_passenger_cancel_conflicts() {
    let harness = Harness::new(1);
    let (ride, driver) = harness.accepted().await;
    harness
        .service
        .cancel(
            Party::Passenger(ride.passenger_id),
            ride.id,
            CancelRequest::new(CancellationReason::WaitTooLong),
        )
        .await
        .unwrap();

    let outcome = harness
        .service
        .advance_phase(driver, ride.id, RideStatus::DriverEnRouteToOrigin, None)
        .await;

    assert!(outcome.unwrap_err().is_conflict());
}

#[tokio::test]
async fn missing_route_can_be_requested_lazily() {
    let harness = Harness::new(1);
    let (ride, driver) = harness.accepted().await;

    let needs_position = harness
        .service
        .ensure_route(Party::Driver(driver), ride.id, RouteLeg::ToOrigin, None)
        .await;
    assert!(matches!(needs_position, Err(RideError::ValidationFailure(_))));

    let with_route = harness
        .service
        .ensure_route(
            Party::Passenger(ride.passenger_id),
            ride.id,
            RouteLeg::ToOrigin,
            Some(driver_position()),
        )
        .await
        .unwrap();
    assert!(with_route.route_to_origin.is_some());

    let stranger = harness
        .service
        .ensure_route(
            Party::Passenger(PassengerId::new()),
            ride.id,
            RouteLeg::ToDestination,
            None,
        )
        .await;
    assert!(matches!(stranger, Err(RideError::ValidationFailure(_))));
}
