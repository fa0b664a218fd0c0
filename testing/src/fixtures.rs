//! Ready-made rides, payloads and records for tests.

use crate::mocks::test_clock;
use ride_dispatch_core::cancellation::{CancellationReason, CancellationRecord};
use ride_dispatch_core::collaborators::RideOffer;
use ride_dispatch_core::environment::Clock;
use ride_dispatch_core::ride::{NewRideRequest, RideRequest};
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::types::{
    Location, Money, Party, PassengerId, RideId, ServiceCategory,
};
use uuid::Uuid;

/// Estimated fare used by every fixture ride
pub const FARE: Money = Money::from_units(100);

/// Pickup point (Puerta del Sol, Madrid)
#[must_use]
pub fn origin() -> Location {
    Location::new(40.4168, -3.7038, "Puerta del Sol, Madrid")
}

/// Drop-off point (Atocha station, Madrid)
#[must_use]
pub fn destination() -> Location {
    Location::new(40.4066, -3.6892, "Estacion de Atocha, Madrid")
}

/// Creation payload with a quoted fare of [`FARE`]
#[must_use]
pub fn payload(passenger_id: PassengerId) -> NewRideRequest {
    NewRideRequest {
        passenger_id,
        rider: None,
        origin: origin(),
        destination: destination(),
        service_category: ServiceCategory::new("standard"),
        estimated_fare: Some(FARE),
        correlation_id: None,
    }
}

/// A `pending` ride created at the test clock's instant
#[must_use]
pub fn pending_ride(passenger_id: PassengerId) -> RideRequest {
    RideRequest::new_pending(RideId::new(), payload(passenger_id), FARE, test_clock().now())
}

/// The offer a driver would receive for `ride`
#[must_use]
pub fn offer(ride: &RideRequest) -> RideOffer {
    RideOffer {
        ride_id: ride.id,
        origin: ride.origin.clone(),
        destination: ride.destination.clone(),
        service_category: ride.service_category.clone(),
        estimated_fare: ride.estimated_fare,
        created_at: ride.created_at,
    }
}

/// A passenger cancellation entry for `ride_id`
#[must_use]
pub fn cancellation(ride_id: RideId, applied: bool) -> CancellationRecord {
    CancellationRecord {
        id: Uuid::new_v4(),
        ride_id,
        canceller: Party::Passenger(PassengerId::new()),
        reason: CancellationReason::ChangedMind,
        free_text: None,
        status_at_cancel: RideStatus::Pending,
        driver_at_cancel: None,
        applied,
        recorded_at: test_clock().now(),
    }
}
