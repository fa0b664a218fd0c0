//! The `RideRequest` aggregate, its creation payload, write patches and
//! conditional-update predicates.

use crate::geo::Polyline;
use crate::status::RideStatus;
use crate::types::{CorrelationId, DriverId, Location, Money, PassengerId, RideId, ServiceCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Contact details when a ride is booked on someone else's behalf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThirdPartyRider {
    /// Rider's name
    pub name: String,
    /// Rider's phone number
    pub phone: String,
}

/// Payload submitted by the passenger flow to create a ride.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewRideRequest {
    /// Passenger who owns the request
    pub passenger_id: PassengerId,
    /// Someone else riding on the passenger's account
    pub rider: Option<ThirdPartyRider>,
    /// Pickup point
    pub origin: Location,
    /// Drop-off point
    pub destination: Location,
    /// Service category key
    pub service_category: ServiceCategory,
    /// Client-side estimate; filled from the fare policy when absent
    pub estimated_fare: Option<Money>,
    /// Correlation id of the optimistic client record, if any
    pub correlation_id: Option<CorrelationId>,
}

impl NewRideRequest {
    /// Checks the payload before any store write.
    ///
    /// # Errors
    ///
    /// Returns a human readable reason for the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        for (label, location) in [("origin", &self.origin), ("destination", &self.destination)] {
            if !location.has_valid_coordinates() {
                return Err(format!("{label} coordinates are out of range"));
            }
            if location.address.trim().is_empty() {
                return Err(format!("{label} address is empty"));
            }
        }

        #[allow(clippy::float_cmp)] // identical input coordinates, not computed values
        let same_point =
            self.origin.lat == self.destination.lat && self.origin.lng == self.destination.lng;
        if same_point {
            return Err("origin and destination are the same point".to_string());
        }

        if self.service_category.as_str().trim().is_empty() {
            return Err("service category is empty".to_string());
        }

        if let Some(fare) = self.estimated_fare {
            if !fare.is_positive() {
                return Err(format!("estimated fare must be positive (got {fare})"));
            }
        }

        if let Some(rider) = &self.rider {
            if rider.name.trim().is_empty() || rider.phone.trim().is_empty() {
                return Err("third-party rider needs both a name and a phone".to_string());
            }
        }

        Ok(())
    }
}

/// The ride request aggregate: the only shared mutable record in the system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    /// Opaque id
    pub id: RideId,
    /// When the request was created
    pub created_at: DateTime<Utc>,
    /// Passenger who owns the request
    pub passenger_id: PassengerId,
    /// Third-party rider name
    pub rider_name: Option<String>,
    /// Third-party rider phone
    pub rider_phone: Option<String>,
    /// Assigned driver; set only on the accepted path
    pub driver_id: Option<DriverId>,
    /// Driver that held the ride when it was cancelled or timed out
    pub released_driver_id: Option<DriverId>,
    /// Pickup point
    pub origin: Location,
    /// Drop-off point
    pub destination: Location,
    /// Service category key
    pub service_category: ServiceCategory,
    /// Fare quoted at creation
    pub estimated_fare: Money,
    /// Fare frozen at completion
    pub actual_fare: Option<Money>,
    /// Current lifecycle status
    pub status: RideStatus,
    /// When a driver won the acceptance race
    pub accepted_at: Option<DateTime<Utc>>,
    /// When the driver reported arrival at the pickup point
    pub driver_arrived_at_origin_at: Option<DateTime<Utc>>,
    /// When the passenger was picked up
    pub trip_started_at: Option<DateTime<Utc>>,
    /// When the driver reported arrival at the drop-off point
    pub driver_arrived_at_destination_at: Option<DateTime<Utc>>,
    /// When the trip was completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped on every successful write
    pub updated_at: DateTime<Utc>,
    /// Write counter, starting at 1 on creation and bumped with every write
    pub version: u64,
    /// Cached route from the driver's position to the pickup point
    pub route_to_origin: Option<Polyline>,
    /// Cached route from pickup to drop-off
    pub route_to_destination: Option<Polyline>,
    /// Correlation id carried over from the creation payload
    pub correlation_id: Option<CorrelationId>,
}

impl RideRequest {
    /// Builds a fresh `pending` record from a validated payload.
    #[must_use]
    pub fn new_pending(
        id: RideId,
        payload: NewRideRequest,
        estimated_fare: Money,
        now: DateTime<Utc>,
    ) -> Self {
        let (rider_name, rider_phone) = payload
            .rider
            .map_or((None, None), |rider| (Some(rider.name), Some(rider.phone)));

        Self {
            id,
            created_at: now,
            passenger_id: payload.passenger_id,
            rider_name,
            rider_phone,
            driver_id: None,
            released_driver_id: None,
            origin: payload.origin,
            destination: payload.destination,
            service_category: payload.service_category,
            estimated_fare,
            actual_fare: None,
            status: RideStatus::Pending,
            accepted_at: None,
            driver_arrived_at_origin_at: None,
            trip_started_at: None,
            driver_arrived_at_destination_at: None,
            completed_at: None,
            updated_at: now,
            version: 1,
            route_to_origin: None,
            route_to_destination: None,
            correlation_id: payload.correlation_id,
        }
    }

    /// Rebuilds the creation payload, used when a passenger retries.
    #[must_use]
    pub fn to_payload(&self) -> NewRideRequest {
        let rider = match (&self.rider_name, &self.rider_phone) {
            (Some(name), Some(phone)) => Some(ThirdPartyRider {
                name: name.clone(),
                phone: phone.clone(),
            }),
            _ => None,
        };

        NewRideRequest {
            passenger_id: self.passenger_id,
            rider,
            origin: self.origin.clone(),
            destination: self.destination.clone(),
            service_category: self.service_category.clone(),
            estimated_fare: Some(self.estimated_fare),
            correlation_id: None,
        }
    }

    /// Applies a patch and bumps `updated_at` and `version`.
    ///
    /// Callers must have checked the predicate first; this never fails.
    pub fn apply(&mut self, patch: &RidePatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if patch.clear_driver {
            self.released_driver_id = self.driver_id.take();
        } else if let Some(driver_id) = patch.driver_id {
            self.driver_id = Some(driver_id);
        }
        if let Some(at) = patch.accepted_at {
            self.accepted_at = Some(at);
        }
        if let Some(at) = patch.driver_arrived_at_origin_at {
            self.driver_arrived_at_origin_at = Some(at);
        }
        if let Some(at) = patch.trip_started_at {
            self.trip_started_at = Some(at);
        }
        if let Some(at) = patch.driver_arrived_at_destination_at {
            self.driver_arrived_at_destination_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
        if let Some(fare) = patch.actual_fare {
            self.actual_fare = Some(fare);
        }
        if let Some(route) = &patch.route_to_origin {
            self.route_to_origin = Some(route.clone());
        }
        if let Some(route) = &patch.route_to_destination {
            self.route_to_destination = Some(route.clone());
        }
        self.updated_at = now;
        self.version += 1;
    }

    /// Whether `driver_id` holds the ride now, or held it when it was
    /// cancelled or timed out.
    #[must_use]
    pub fn held_by(&self, driver_id: DriverId) -> bool {
        self.driver_id.or(self.released_driver_id) == Some(driver_id)
    }

    /// Whether this record is still live.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Checks the driver/status invariant.
    ///
    /// # Errors
    ///
    /// Returns a description of the violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.status.requires_driver() && self.driver_id.is_none() {
            return Err(format!("status {} requires a driver", self.status));
        }
        if self.status.forbids_driver() && self.driver_id.is_some() {
            return Err(format!("status {} must not carry a driver", self.status));
        }
        if self.released_driver_id.is_some() && !self.status.is_terminal() {
            return Err(format!("status {} cannot have released its driver", self.status));
        }
        if self.status == RideStatus::TripCompleted && self.actual_fare.is_none() {
            return Err("completed ride has no actual fare".to_string());
        }
        Ok(())
    }
}

/// Partial update applied by a conditional write.
///
/// Only `Some` fields are written. The one field ever cleared is
/// `driver_id`, and only when `clear_driver` is set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RidePatch {
    pub status: Option<RideStatus>,
    pub driver_id: Option<DriverId>,
    pub clear_driver: bool,
    pub accepted_at: Option<DateTime<Utc>>,
    pub driver_arrived_at_origin_at: Option<DateTime<Utc>>,
    pub trip_started_at: Option<DateTime<Utc>>,
    pub driver_arrived_at_destination_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub actual_fare: Option<Money>,
    pub route_to_origin: Option<Polyline>,
    pub route_to_destination: Option<Polyline>,
}

impl RidePatch {
    /// A patch that only moves the status.
    #[must_use]
    pub fn status(status: RideStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// The patch written by the winning acceptance.
    #[must_use]
    pub fn accept(driver_id: DriverId, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(RideStatus::Accepted),
            driver_id: Some(driver_id),
            accepted_at: Some(now),
            ..Self::default()
        }
    }

    /// Ends the ride off the accepted path (cancelled, timed out) and drops
    /// the assigned driver, if any.
    #[must_use]
    pub fn release(status: RideStatus) -> Self {
        Self {
            status: Some(status),
            clear_driver: true,
            ..Self::default()
        }
    }

    /// Status change plus whichever lifecycle timestamp belongs to it.
    #[must_use]
    pub fn advance(status: RideStatus, now: DateTime<Utc>) -> Self {
        let mut patch = Self::status(status);
        match status {
            RideStatus::DriverAtOrigin => patch.driver_arrived_at_origin_at = Some(now),
            RideStatus::TripStarted => patch.trip_started_at = Some(now),
            RideStatus::DriverAtDestination => patch.driver_arrived_at_destination_at = Some(now),
            RideStatus::TripCompleted => patch.completed_at = Some(now),
            _ => {},
        }
        patch
    }

    /// Caches a route polyline without touching the status.
    #[must_use]
    pub fn route(leg: RouteLeg, polyline: Polyline) -> Self {
        match leg {
            RouteLeg::ToOrigin => Self {
                route_to_origin: Some(polyline),
                ..Self::default()
            },
            RouteLeg::ToDestination => Self {
                route_to_destination: Some(polyline),
                ..Self::default()
            },
        }
    }

    /// Sets the frozen fare.
    #[must_use]
    pub const fn with_actual_fare(mut self, fare: Money) -> Self {
        self.actual_fare = Some(fare);
        self
    }
}

/// Which cached route a polyline belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteLeg {
    /// Driver to pickup point
    ToOrigin,
    /// Pickup point to drop-off point
    ToDestination,
}

/// Expectation on `driver_id` in a conditional update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverExpectation {
    /// No constraint
    Any,
    /// `driver_id IS NULL`
    Unassigned,
    /// `driver_id == id`
    Is(DriverId),
}

/// The expected-state half of a conditional update.
///
/// Predicates are plain data so every backend evaluates them atomically with
/// the write: under a single lock in memory, inside the `WHERE` clause in SQL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RidePredicate {
    statuses: SmallVec<[RideStatus; 6]>,
    driver: DriverExpectation,
}

impl RidePredicate {
    /// Status must equal `status`.
    #[must_use]
    pub fn status_is(status: RideStatus) -> Self {
        Self::status_in([status])
    }

    /// Status must be one of `statuses`.
    #[must_use]
    pub fn status_in(statuses: impl IntoIterator<Item = RideStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            driver: DriverExpectation::Any,
        }
    }

    /// Status must be any non-terminal status.
    #[must_use]
    pub fn any_open() -> Self {
        Self::status_in(RideStatus::OPEN)
    }

    /// Additionally require `driver_id IS NULL`.
    #[must_use]
    pub const fn driver_unassigned(mut self) -> Self {
        self.driver = DriverExpectation::Unassigned;
        self
    }

    /// Additionally require `driver_id == driver_id`.
    #[must_use]
    pub const fn driver_is(mut self, driver_id: DriverId) -> Self {
        self.driver = DriverExpectation::Is(driver_id);
        self
    }

    /// Allowed statuses
    #[must_use]
    pub fn statuses(&self) -> &[RideStatus] {
        &self.statuses
    }

    /// Driver expectation
    #[must_use]
    pub const fn driver(&self) -> DriverExpectation {
        self.driver
    }

    /// Evaluates the predicate against a stored record.
    ///
    /// Terminal records never match, whatever the predicate says.
    #[must_use]
    pub fn matches(&self, ride: &RideRequest) -> bool {
        if ride.status.is_terminal() || !self.statuses.contains(&ride.status) {
            return false;
        }
        match self.driver {
            DriverExpectation::Any => true,
            DriverExpectation::Unassigned => ride.driver_id.is_none(),
            DriverExpectation::Is(expected) => ride.driver_id == Some(expected),
        }
    }
}

impl std::fmt::Display for RidePredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let statuses: Vec<&str> = self.statuses.iter().map(|s| s.as_str()).collect();
        write!(f, "status in [{}]", statuses.join(", "))?;
        match self.driver {
            DriverExpectation::Any => Ok(()),
            DriverExpectation::Unassigned => write!(f, " and driver is unassigned"),
            DriverExpectation::Is(id) => write!(f, " and driver is {id}"),
        }
    }
}
