//! Acceptance race tests.
//!
//! Many drivers accept the same ride at once; exactly one wins.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code

mod common;

use common::Harness;
use futures::future::join_all;
use ride_dispatch_core::error::RideError;
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::store::RideRequestStore;
use ride_dispatch_core::types::{DriverId, Money, Party, PassengerId};
use ride_dispatch_testing::fixtures;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_of_many_concurrent_accepts_wins() {
    let harness = Harness::new(0);
    let ride = harness.request().await;
    let drivers: Vec<DriverId> = (0..16).map(|_| DriverId::new()).collect();

    let attempts = drivers.iter().map(|&driver_id| {
        let service = harness.service.clone();
        let ride_id = ride.id;
        tokio::spawn(async move { (driver_id, service.accept(driver_id, ride_id).await) })
    });
    let outcomes: Vec<_> = join_all(attempts).await.into_iter().map(Result::unwrap).collect();

    let winners: Vec<DriverId> = outcomes
        .iter()
        .filter(|(_, outcome)| outcome.is_ok())
        .map(|(driver_id, _)| *driver_id)
        .collect();
    assert_eq!(winners.len(), 1, "exactly one accept must succeed");

    for (_, outcome) in outcomes.iter().filter(|(_, outcome)| outcome.is_err()) {
        assert!(
            matches!(
                outcome,
                Err(RideError::Conflict {
                    current: RideStatus::Accepted,
                    ..
                })
            ),
            "losers see an already-taken conflict, got {outcome:?}"
        );
    }

    let stored = harness.store.get(ride.id).await.unwrap();
    assert_eq!(stored.status, RideStatus::Accepted);
    assert_eq!(stored.driver_id, Some(winners[0]));
    assert_eq!(
        harness.store.status_history(ride.id),
        vec![RideStatus::Pending, RideStatus::Accepted]
    );
}

#[tokio::test]
async fn two_drivers_race_for_a_hundred_unit_ride() {
    let harness = Harness::new(2);
    let ride = harness.request().await;
    assert_eq!(ride.estimated_fare, Money::from_units(100));
    assert_eq!(ride.status, RideStatus::Pending);

    let (first, second) = tokio::join!(
        harness.service.accept(harness.drivers[0], ride.id),
        harness.service.accept(harness.drivers[1], ride.id),
    );

    let (winner, loser) = match (first, second) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        other => panic!("expected one winner and one loser, got {other:?}"),
    };
    assert!(lost_race(&loser));
    assert!(harness.drivers.contains(&winner.driver_id.unwrap()));
    assert!(winner.accepted_at.is_some());
    assert_eq!(winner.estimated_fare, Money::from_units(100));
    assert_eq!(winner.version, 2);
}

#[tokio::test]
async fn late_accept_after_win_is_already_taken() {
    let harness = Harness::new(2);
    let (ride, _) = harness.accepted().await;

    let late = harness.service.accept(harness.drivers[1], ride.id).await;

    assert!(matches!(late, Err(RideError::Conflict { .. })));
    assert!(late.unwrap_err().is_conflict());
}

#[tokio::test]
async fn accept_of_unknown_ride_is_not_found() {
    let harness = Harness::new(1);
    let missing = fixtures::pending_ride(PassengerId::new());

    let outcome = harness.service.accept(harness.drivers[0], missing.id).await;

    assert_eq!(outcome, Err(RideError::NotFound(missing.id)));
}

#[tokio::test]
async fn passenger_cannot_accept_own_ride() {
    let harness = Harness::new(0);
    let passenger_id = PassengerId::new();
    let ride = harness.request_for(passenger_id).await;
    let same_person = DriverId::from_uuid(*passenger_id.as_uuid());

    let outcome = harness.service.accept(same_person, ride.id).await;

    assert!(matches!(outcome, Err(RideError::ValidationFailure(_))));
    assert_eq!(harness.store.get(ride.id).await.unwrap().status, RideStatus::Pending);
}

#[tokio::test]
async fn creation_offers_ride_to_every_eligible_driver() {
    let harness = Harness::new(3);
    harness.notifier.make_unreachable(harness.drivers[2]);

    let ride = harness.request().await;
    harness.service.settle().await;

    let mut recipients = harness.notifier.recipients(ride.id);
    recipients.sort_unstable();
    let mut expected = harness.drivers[..2].to_vec();
    expected.sort_unstable();
    assert_eq!(recipients, expected);
    assert_eq!(harness.notifier.attempts(), 3);

    // A failed delivery never touches the ride
    assert_eq!(harness.store.get(ride.id).await.unwrap().status, RideStatus::Pending);
}

#[tokio::test]
async fn second_live_request_for_same_passenger_is_rejected() {
    let harness = Harness::new(0);
    let passenger_id = PassengerId::new();
    harness.request_for(passenger_id).await;

    let again = harness.service.create(fixtures::payload(passenger_id)).await;

    assert!(matches!(again, Err(RideError::ValidationFailure(_))));
    assert_eq!(harness.store.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_one_passenger_create_one_ride() {
    let harness = Harness::new(0);
    let passenger_id = PassengerId::new();

    let (first, second) = tokio::join!(
        harness.service.create(fixtures::payload(passenger_id)),
        harness.service.create(fixtures::payload(passenger_id)),
    );
    let attempts = (0..8).map(|_| {
        let service = harness.service.clone();
        tokio::spawn(async move { service.create(fixtures::payload(passenger_id)).await })
    });
    let mut outcomes: Vec<_> = join_all(attempts).await.into_iter().map(Result::unwrap).collect();
    outcomes.extend([first, second]);

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    for outcome in outcomes.iter().filter(|outcome| outcome.is_err()) {
        assert!(
            matches!(outcome, Err(RideError::ValidationFailure(_))),
            "a second live ride is a validation failure, got {outcome:?}"
        );
    }
    assert_eq!(harness.store.rides_for(Party::Passenger(passenger_id)).len(), 1);
}

fn lost_race(error: &RideError) -> bool {
    matches!(
        error,
        RideError::Conflict {
            current: RideStatus::Accepted,
            ..
        }
    )
}
