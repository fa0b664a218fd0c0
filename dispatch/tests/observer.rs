//! Ride observer tests: push delivery, polling fallback and ordering.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code

mod common;

use common::Harness;
use futures::StreamExt;
use ride_dispatch::CancelRequest;
use ride_dispatch::config::ObserverConfig;
use ride_dispatch::{RideObserver, RideWatch};
use ride_dispatch_core::cancellation::CancellationReason;
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::types::{Party, RideId};
use std::time::Duration;

fn observer(harness: &Harness, poll_window: Duration) -> RideObserver {
    RideObserver::new(
        harness.store.clone(),
        harness.store.clone(),
        ObserverConfig {
            poll_interval: Duration::from_millis(20),
            poll_window,
        },
    )
}

async fn next(watch: &mut RideWatch) -> Option<RideRequest> {
    tokio::time::timeout(Duration::from_secs(5), watch.next())
        .await
        .expect("watch stalled")
}

async fn cancel_by_passenger(harness: &Harness, ride: &RideRequest) {
    harness
        .service
        .cancel(
            Party::Passenger(ride.passenger_id),
            ride.id,
            CancelRequest::new(CancellationReason::ChangedMind),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn push_feed_delivers_each_change_then_ends() {
    let harness = Harness::new(1);
    let ride = harness.request().await;
    let mut watch = observer(&harness, Duration::from_secs(3600)).watch(ride.id);

    let first = next(&mut watch).await.unwrap();
    assert_eq!(first.status, RideStatus::Pending);
    assert_eq!(first.version, 1);

    let driver = harness.drivers[0];
    harness.service.accept(driver, ride.id).await.unwrap();
    let accepted = next(&mut watch).await.unwrap();
    assert_eq!(accepted.status, RideStatus::Accepted);
    assert_eq!(accepted.driver_id, Some(driver));

    harness
        .service
        .advance_phase(driver, ride.id, RideStatus::DriverAtOrigin, None)
        .await
        .unwrap();
    assert_eq!(next(&mut watch).await.unwrap().status, RideStatus::DriverAtOrigin);

    cancel_by_passenger(&harness, &ride).await;
    let last = next(&mut watch).await.unwrap();
    assert_eq!(last.status, RideStatus::CancelledByPassenger);

    assert!(next(&mut watch).await.is_none(), "terminal snapshot ends the watch");
}

#[tokio::test(start_paused = true)]
async fn polls_while_the_feed_is_down() {
    let harness = Harness::new(1);
    harness.store.set_feed_available(false);
    let ride = harness.request().await;
    let mut watch = observer(&harness, Duration::from_secs(3600)).watch(ride.id);

    assert_eq!(next(&mut watch).await.unwrap().status, RideStatus::Pending);

    harness.service.accept(harness.drivers[0], ride.id).await.unwrap();
    assert_eq!(next(&mut watch).await.unwrap().status, RideStatus::Accepted);

    cancel_by_passenger(&harness, &ride).await;
    assert_eq!(next(&mut watch).await.unwrap().status, RideStatus::CancelledByPassenger);
    assert!(next(&mut watch).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn ended_feed_falls_back_to_polling_and_resubscribes() {
    let harness = Harness::new(1);
    let ride = harness.request().await;
    let mut watch = observer(&harness, Duration::from_millis(100)).watch(ride.id);
    assert_eq!(next(&mut watch).await.unwrap().status, RideStatus::Pending);

    harness.store.drop_subscribers();
    harness.service.accept(harness.drivers[0], ride.id).await.unwrap();
    assert_eq!(next(&mut watch).await.unwrap().status, RideStatus::Accepted);

    // Past the poll window the watcher is back on the push feed
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness
        .service
        .advance_phase(harness.drivers[0], ride.id, RideStatus::DriverAtOrigin, None)
        .await
        .unwrap();
    assert_eq!(next(&mut watch).await.unwrap().status, RideStatus::DriverAtOrigin);

    cancel_by_passenger(&harness, &ride).await;
    assert_eq!(next(&mut watch).await.unwrap().status, RideStatus::CancelledByPassenger);
    assert!(next(&mut watch).await.is_none());
}

#[tokio::test]
async fn snapshots_never_go_backwards() {
    let harness = Harness::new(1);
    let (ride, driver) = harness.accepted().await;
    let mut watch = observer(&harness, Duration::from_secs(3600)).watch(ride.id);

    let writer = {
        let service = harness.service.clone();
        tokio::spawn(async move {
            for target in [
                RideStatus::DriverEnRouteToOrigin,
                RideStatus::DriverAtOrigin,
                RideStatus::TripStarted,
                RideStatus::DriverAtDestination,
                RideStatus::TripCompleted,
            ] {
                service
                    .advance_phase(driver, ride.id, target, None)
                    .await
                    .unwrap();
            }
        })
    };

    let mut seen = Vec::new();
    while let Some(snapshot) = next(&mut watch).await {
        seen.push(snapshot);
    }
    writer.await.unwrap();

    assert!(
        seen.windows(2).all(|pair| pair[0].version < pair[1].version),
        "versions strictly increase"
    );
    assert!(
        seen.windows(2).all(|pair| pair[0].status.rank() <= pair[1].status.rank()),
        "statuses never regress"
    );
    assert_eq!(seen.last().unwrap().status, RideStatus::TripCompleted);
}

#[tokio::test]
async fn changes_to_other_rides_are_not_delivered() {
    let harness = Harness::new(2);
    let watched = harness.request().await;
    let other = harness.request().await;
    let mut watch = observer(&harness, Duration::from_secs(3600)).watch(watched.id);
    assert_eq!(next(&mut watch).await.unwrap().id, watched.id);

    harness.service.accept(harness.drivers[0], other.id).await.unwrap();

    let mut pending = tokio_test::task::spawn(watch.next());
    tokio_test::assert_pending!(pending.poll(), "no snapshot for an unrelated change");
    drop(pending);

    harness.service.accept(harness.drivers[1], watched.id).await.unwrap();
    assert_eq!(next(&mut watch).await.unwrap().status, RideStatus::Accepted);
}

#[tokio::test]
async fn unknown_ride_ends_immediately() {
    let harness = Harness::new(0);
    let mut watch = observer(&harness, Duration::from_secs(3600)).watch(RideId::new());

    assert!(next(&mut watch).await.is_none());
}
