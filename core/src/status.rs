//! The ride status state machine.
//!
//! ```text
//! pending → accepted → driver_en_route_to_origin → driver_at_origin
//!         → trip_started → driver_at_destination → trip_completed
//! ```
//!
//! `driver_en_route_to_origin`, `driver_at_origin` and `driver_at_destination`
//! are optional markers: a driver may go straight from `accepted` to
//! `trip_started`, or from `trip_started` to `trip_completed`. The four side
//! exits (`cancelled_by_passenger`, `cancelled_by_driver`,
//! `no_drivers_available`, `timed_out_passenger`) are terminal and reachable
//! from any non-terminal status. Operations narrow that further through their
//! conditional-update predicates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Persisted status of a ride request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    /// Waiting for any driver to accept
    Pending,
    /// A driver won the acceptance race
    Accepted,
    /// Driver is heading to the pickup point
    DriverEnRouteToOrigin,
    /// Driver is waiting at the pickup point
    DriverAtOrigin,
    /// Passenger on board
    TripStarted,
    /// Driver reached the drop-off point
    DriverAtDestination,
    /// Trip finished and fare frozen
    TripCompleted,
    /// Passenger cancelled
    CancelledByPassenger,
    /// Assigned driver cancelled
    CancelledByDriver,
    /// Nobody accepted within the passenger wait window
    NoDriversAvailable,
    /// Passenger never showed up at the pickup point
    TimedOutPassenger,
}

impl RideStatus {
    /// Every status, in state machine order.
    pub const ALL: [Self; 11] = [
        Self::Pending,
        Self::Accepted,
        Self::DriverEnRouteToOrigin,
        Self::DriverAtOrigin,
        Self::TripStarted,
        Self::DriverAtDestination,
        Self::TripCompleted,
        Self::CancelledByPassenger,
        Self::CancelledByDriver,
        Self::NoDriversAvailable,
        Self::TimedOutPassenger,
    ];

    /// Statuses that are not terminal.
    pub const OPEN: [Self; 6] = [
        Self::Pending,
        Self::Accepted,
        Self::DriverEnRouteToOrigin,
        Self::DriverAtOrigin,
        Self::TripStarted,
        Self::DriverAtDestination,
    ];

    /// Statuses during which a driver is assigned and the trip is live.
    pub const ASSIGNED: [Self; 5] = [
        Self::Accepted,
        Self::DriverEnRouteToOrigin,
        Self::DriverAtOrigin,
        Self::TripStarted,
        Self::DriverAtDestination,
    ];

    /// Position along the state machine. Committed statuses of one ride are
    /// strictly increasing in rank; all terminal side exits share the top rank.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Accepted => 1,
            Self::DriverEnRouteToOrigin => 2,
            Self::DriverAtOrigin => 3,
            Self::TripStarted => 4,
            Self::DriverAtDestination => 5,
            Self::TripCompleted => 6,
            Self::CancelledByPassenger
            | Self::CancelledByDriver
            | Self::NoDriversAvailable
            | Self::TimedOutPassenger => 7,
        }
    }

    /// Terminal statuses accept no further writes.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::TripCompleted
                | Self::CancelledByPassenger
                | Self::CancelledByDriver
                | Self::NoDriversAvailable
                | Self::TimedOutPassenger
        )
    }

    /// Statuses on the accepted path, which always carry a driver id.
    #[must_use]
    pub const fn requires_driver(self) -> bool {
        matches!(
            self,
            Self::Accepted
                | Self::DriverEnRouteToOrigin
                | Self::DriverAtOrigin
                | Self::TripStarted
                | Self::DriverAtDestination
                | Self::TripCompleted
        )
    }

    /// Statuses that must never carry a driver id: everything off the
    /// accepted path, including rides cancelled or abandoned after acceptance.
    #[must_use]
    pub const fn forbids_driver(self) -> bool {
        !self.requires_driver()
    }

    /// Whether `self → next` is an edge of the state machine.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use RideStatus::{
            Accepted, CancelledByDriver, CancelledByPassenger, DriverAtDestination,
            DriverAtOrigin, DriverEnRouteToOrigin, NoDriversAvailable, Pending, TimedOutPassenger,
            TripCompleted, TripStarted,
        };

        if self.is_terminal() {
            return false;
        }

        match next {
            CancelledByPassenger | CancelledByDriver | NoDriversAvailable | TimedOutPassenger => {
                true
            },
            Accepted => matches!(self, Pending),
            DriverEnRouteToOrigin => matches!(self, Accepted),
            DriverAtOrigin => matches!(self, Accepted | DriverEnRouteToOrigin),
            TripStarted => matches!(self, Accepted | DriverEnRouteToOrigin | DriverAtOrigin),
            DriverAtDestination => matches!(self, TripStarted),
            TripCompleted => matches!(self, TripStarted | DriverAtDestination),
            Pending => false,
        }
    }

    /// Every status from which `target` may be entered.
    ///
    /// Used to build the expected-status half of a conditional update.
    #[must_use]
    pub fn predecessors(target: Self) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(target))
            .collect()
    }

    /// Stable snake_case name used in storage, logs and notifications
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::DriverEnRouteToOrigin => "driver_en_route_to_origin",
            Self::DriverAtOrigin => "driver_at_origin",
            Self::TripStarted => "trip_started",
            Self::DriverAtDestination => "driver_at_destination",
            Self::TripCompleted => "trip_completed",
            Self::CancelledByPassenger => "cancelled_by_passenger",
            Self::CancelledByDriver => "cancelled_by_driver",
            Self::NoDriversAvailable => "no_drivers_available",
            Self::TimedOutPassenger => "timed_out_passenger",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown ride status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for RideStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
