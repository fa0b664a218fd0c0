//! Client-facing trip phase and the read-only `ActiveTripView`.
//!
//! [`TripPhase::derive`] is the one total mapping from a stored record to a
//! phase. Live change handling and reconnect recovery both go through it, so
//! a client that reloads mid-trip lands in exactly the phase it would have
//! reached by following notifications.

use crate::geo::Polyline;
use crate::ride::{RideRequest, RouteLeg};
use crate::status::RideStatus;
use crate::types::{Location, Money, Party, RideId, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage of a ride as shown to either party.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TripPhase {
    /// Waiting for a driver to accept
    Searching {
        /// When the request was created
        since: DateTime<Utc>,
    },
    /// A driver accepted and has not set off yet
    DriverAssigned {
        /// When the driver accepted
        accepted_at: Option<DateTime<Utc>>,
    },
    /// Driver is heading to the pickup point
    DriverEnRoute {
        /// When the driver accepted
        accepted_at: Option<DateTime<Utc>>,
    },
    /// Driver is waiting at the pickup point
    DriverWaiting {
        /// When the driver arrived
        arrived_at: Option<DateTime<Utc>>,
    },
    /// Passenger on board
    OnTrip {
        /// When the trip started
        started_at: Option<DateTime<Utc>>,
    },
    /// Driver reached the drop-off point
    AtDestination {
        /// When the driver arrived
        arrived_at: Option<DateTime<Utc>>,
    },
    /// Trip finished
    Completed {
        /// Fare charged
        fare: Money,
    },
    /// One side cancelled
    Cancelled {
        /// Who cancelled
        by: Role,
    },
    /// Nobody accepted in time
    NoDriversFound,
    /// Passenger did not show up at the pickup point
    PassengerNoShow,
}

impl TripPhase {
    /// Derives the phase from status plus timestamp presence.
    ///
    /// Total over every stored record. A later lifecycle timestamp wins over
    /// an earlier status, so a record whose marker write raced a status read
    /// still lands in the furthest phase it provably reached.
    #[must_use]
    pub fn derive(ride: &RideRequest) -> Self {
        match ride.status {
            RideStatus::Pending => Self::Searching {
                since: ride.created_at,
            },
            RideStatus::Accepted | RideStatus::DriverEnRouteToOrigin
                if ride.driver_arrived_at_origin_at.is_some() =>
            {
                Self::DriverWaiting {
                    arrived_at: ride.driver_arrived_at_origin_at,
                }
            },
            RideStatus::Accepted => Self::DriverAssigned {
                accepted_at: ride.accepted_at,
            },
            RideStatus::DriverEnRouteToOrigin => Self::DriverEnRoute {
                accepted_at: ride.accepted_at,
            },
            RideStatus::DriverAtOrigin => Self::DriverWaiting {
                arrived_at: ride.driver_arrived_at_origin_at,
            },
            RideStatus::TripStarted if ride.driver_arrived_at_destination_at.is_some() => {
                Self::AtDestination {
                    arrived_at: ride.driver_arrived_at_destination_at,
                }
            },
            RideStatus::TripStarted => Self::OnTrip {
                started_at: ride.trip_started_at,
            },
            RideStatus::DriverAtDestination => Self::AtDestination {
                arrived_at: ride.driver_arrived_at_destination_at,
            },
            RideStatus::TripCompleted => Self::Completed {
                fare: ride.actual_fare.unwrap_or(ride.estimated_fare),
            },
            RideStatus::CancelledByPassenger => Self::Cancelled {
                by: Role::Passenger,
            },
            RideStatus::CancelledByDriver => Self::Cancelled { by: Role::Driver },
            RideStatus::NoDriversAvailable => Self::NoDriversFound,
            RideStatus::TimedOutPassenger => Self::PassengerNoShow,
        }
    }

    /// Whether the phase is final
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Cancelled { .. } | Self::NoDriversFound | Self::PassengerNoShow
        )
    }

    /// The cached route this phase needs on screen, if any.
    #[must_use]
    pub const fn route_needed(&self) -> Option<RouteLeg> {
        match self {
            Self::DriverAssigned { .. } | Self::DriverEnRoute { .. } => Some(RouteLeg::ToOrigin),
            Self::OnTrip { .. } => Some(RouteLeg::ToDestination),
            _ => None,
        }
    }
}

/// Read-only snapshot of a ride from one party's point of view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveTripView {
    /// The ride
    pub ride_id: RideId,
    /// Who the view is for
    pub viewer: Role,
    /// Raw stored status
    pub status: RideStatus,
    /// Derived phase
    pub phase: TripPhase,
    /// The other side of the trip, once known
    pub counterpart: Option<Party>,
    /// Pickup point
    pub origin: Location,
    /// Drop-off point
    pub destination: Location,
    /// Cached route to the pickup point
    pub route_to_origin: Option<Polyline>,
    /// Cached route to the drop-off point
    pub route_to_destination: Option<Polyline>,
    /// Actual fare once frozen, otherwise the estimate
    pub fare: Money,
    /// Timestamp of the record the view was built from
    pub updated_at: DateTime<Utc>,
    /// Version of the record the view was built from
    pub version: u64,
    /// Route the current phase needs but the record does not have cached yet
    pub missing_route: Option<RouteLeg>,
}

impl ActiveTripView {
    /// Builds the view for `viewer`.
    #[must_use]
    pub fn from_ride(ride: &RideRequest, viewer: Role) -> Self {
        let phase = TripPhase::derive(ride);
        let counterpart = match viewer {
            Role::Passenger => ride.driver_id.map(Party::Driver),
            Role::Driver => Some(Party::Passenger(ride.passenger_id)),
        };
        let missing_route = phase.route_needed().filter(|leg| match leg {
            RouteLeg::ToOrigin => ride.route_to_origin.is_none(),
            RouteLeg::ToDestination => ride.route_to_destination.is_none(),
        });

        Self {
            ride_id: ride.id,
            viewer,
            status: ride.status,
            phase,
            counterpart,
            origin: ride.origin.clone(),
            destination: ride.destination.clone(),
            route_to_origin: ride.route_to_origin.clone(),
            route_to_destination: ride.route_to_destination.clone(),
            fare: ride.actual_fare.unwrap_or(ride.estimated_fare),
            updated_at: ride.updated_at,
            version: ride.version,
            missing_route,
        }
    }

    /// View for the ride's passenger
    #[must_use]
    pub fn for_passenger(ride: &RideRequest) -> Self {
        Self::from_ride(ride, Role::Passenger)
    }

    /// View for the ride's driver
    #[must_use]
    pub fn for_driver(ride: &RideRequest) -> Self {
        Self::from_ride(ride, Role::Driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ride::{NewRideRequest, RidePatch};
    use crate::types::{DriverId, PassengerId, ServiceCategory};

    fn ride() -> RideRequest {
        let payload = NewRideRequest {
            passenger_id: PassengerId::new(),
            rider: None,
            origin: Location::new(48.8566, 2.3522, "Hotel de Ville"),
            destination: Location::new(48.8584, 2.2945, "Tour Eiffel"),
            service_category: ServiceCategory::new("standard"),
            estimated_fare: Some(Money::from_units(100)),
            correlation_id: None,
        };
        RideRequest::new_pending(RideId::new(), payload, Money::from_units(100), Utc::now())
    }

    #[test]
    fn every_status_maps_to_a_phase() {
        let base = ride();
        for status in RideStatus::ALL {
            let mut r = base.clone();
            r.status = status;
            let phase = TripPhase::derive(&r);
            assert_eq!(phase.is_final(), status.is_terminal(), "{status}");
        }
    }

    #[test]
    fn arrival_timestamp_outranks_stale_status() {
        let mut r = ride();
        r.apply(&RidePatch::accept(DriverId::new(), Utc::now()), Utc::now());
        r.driver_arrived_at_origin_at = Some(Utc::now());
        assert!(matches!(TripPhase::derive(&r), TripPhase::DriverWaiting { .. }));
    }

    #[test]
    fn passenger_view_names_driver() {
        let mut r = ride();
        let driver = DriverId::new();
        r.apply(&RidePatch::accept(driver, Utc::now()), Utc::now());

        let view = ActiveTripView::for_passenger(&r);
        assert_eq!(view.counterpart, Some(Party::Driver(driver)));
        assert_eq!(view.missing_route, Some(RouteLeg::ToOrigin));

        let view = ActiveTripView::for_driver(&r);
        assert_eq!(view.counterpart, Some(Party::Passenger(r.passenger_id)));
    }

    #[test]
    fn completed_view_shows_actual_fare() {
        let mut r = ride();
        r.status = RideStatus::TripCompleted;
        r.actual_fare = Some(Money::from_units(90));
        let view = ActiveTripView::for_passenger(&r);
        assert_eq!(view.fare, Money::from_units(90));
        assert_eq!(view.phase, TripPhase::Completed { fare: Money::from_units(90) });
    }
}
