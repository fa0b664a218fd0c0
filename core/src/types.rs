//! Value objects shared by every ride dispatch component.
//!
//! Identifiers are UUID newtypes so a passenger id can never be passed where a
//! driver id is expected. Money is kept in integer minor units.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a ride request
    RideId
);

uuid_id!(
    /// Unique identifier for a passenger account
    PassengerId
);

uuid_id!(
    /// Unique identifier for a driver account
    DriverId
);

uuid_id!(
    /// Correlates an optimistic client-side request with the record the store
    /// eventually commits for it.
    CorrelationId
);

/// Service category a ride is booked under (e.g. `"standard"`, `"xl"`).
///
/// Categories are owned by the fare policy collaborator; this subsystem only
/// carries the key around.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceCategory(String);

impl ServiceCategory {
    /// Creates a category key
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw category key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Parties
// ============================================================================

/// Which side of the trip a party is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The person who requested the ride
    Passenger,
    /// A driver who may accept or is serving the ride
    Driver,
}

impl Role {
    /// Stable lowercase name used in storage and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passenger => "passenger",
            Self::Driver => "driver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passenger" => Ok(Self::Passenger),
            "driver" => Ok(Self::Driver),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A party id paired with its role.
///
/// Used where either side may act, e.g. cancellation or recovery lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Party {
    /// A passenger
    Passenger(PassengerId),
    /// A driver
    Driver(DriverId),
}

impl Party {
    /// The role of this party
    #[must_use]
    pub const fn role(&self) -> Role {
        match self {
            Self::Passenger(_) => Role::Passenger,
            Self::Driver(_) => Role::Driver,
        }
    }

    /// The raw UUID regardless of role
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        match self {
            Self::Passenger(id) => id.as_uuid(),
            Self::Driver(id) => id.as_uuid(),
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role(), self.as_uuid())
    }
}

/// Authenticated caller identity, as supplied by the auth/session provider.
///
/// This subsystem trusts the identity it is given; it only uses it to key
/// conditional-update predicates.
pub type Caller = Party;

// ============================================================================
// Money
// ============================================================================

/// Fare amount in minor currency units (cents).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Creates an amount from minor units
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Creates an amount from whole currency units
    #[must_use]
    pub const fn from_units(units: i64) -> Self {
        Self(units * 100)
    }

    /// Amount in minor units
    #[must_use]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// True for strictly positive amounts
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// A pickup or drop-off location.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lng: f64,
    /// Human readable address as resolved by the geocoder
    pub address: String,
}

impl Location {
    /// Creates a location
    #[must_use]
    pub fn new(lat: f64, lng: f64, address: impl Into<String>) -> Self {
        Self {
            lat,
            lng,
            address: address.into(),
        }
    }

    /// Whether the coordinates are finite and within WGS84 bounds
    #[must_use]
    pub fn has_valid_coordinates(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}
