//! Append-only cancellation log.
//!
//! A ride holds at most one entry per cancelling party. The first
//! cancellation changes the ride's status and its entry carries
//! `applied = true`; the other party may still leave a log-only entry when it
//! lost the race, and a repeat by the same party adds nothing.

use crate::status::RideStatus;
use crate::store::StoreFuture;
use crate::types::{DriverId, Party, RideId, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Why a party cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// Passenger no longer needs the ride
    ChangedMind,
    /// Waiting for a driver took too long
    WaitTooLong,
    /// Assigned driver is too far away
    DriverTooFar,
    /// Pickup point was wrong
    WrongPickup,
    /// Vehicle problem on the driver's side
    VehicleIssue,
    /// Either party felt unsafe
    SafetyConcern,
    /// Anything else; requires free text
    Other,
}

impl CancellationReason {
    /// Every reason code
    pub const ALL: [Self; 7] = [
        Self::ChangedMind,
        Self::WaitTooLong,
        Self::DriverTooFar,
        Self::WrongPickup,
        Self::VehicleIssue,
        Self::SafetyConcern,
        Self::Other,
    ];

    /// Stable snake_case code
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChangedMind => "changed_mind",
            Self::WaitTooLong => "wait_too_long",
            Self::DriverTooFar => "driver_too_far",
            Self::WrongPickup => "wrong_pickup",
            Self::VehicleIssue => "vehicle_issue",
            Self::SafetyConcern => "safety_concern",
            Self::Other => "other",
        }
    }

    /// Whether the reason is only meaningful with free text
    #[must_use]
    pub const fn requires_free_text(self) -> bool {
        matches!(self, Self::Other)
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancellationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| format!("unknown cancellation reason: {s}"))
    }
}

/// One entry in the cancellation log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRecord {
    /// Entry id
    pub id: Uuid,
    /// Ride the attempt was made on
    pub ride_id: RideId,
    /// Who cancelled
    pub canceller: Party,
    /// Reason code
    pub reason: CancellationReason,
    /// Optional explanation
    pub free_text: Option<String>,
    /// Ride status observed when the attempt was made
    pub status_at_cancel: RideStatus,
    /// Driver holding the ride when it was cancelled, if any
    pub driver_at_cancel: Option<DriverId>,
    /// Whether this attempt performed the status change
    pub applied: bool,
    /// When the attempt was made
    pub recorded_at: DateTime<Utc>,
}

impl CancellationRecord {
    /// Role of the canceller
    #[must_use]
    pub const fn role(&self) -> Role {
        self.canceller.role()
    }
}

/// Append-only storage for cancellation attempts.
pub trait CancellationLog: Send + Sync {
    /// Append `record` unless the log already holds an entry from the same
    /// canceller for the same ride. Never overwrites.
    ///
    /// Returns the stored entry: `record` itself, or the earlier one that
    /// kept it out.
    ///
    /// # Errors
    ///
    /// - `Database`: backend failure
    fn append(&self, record: CancellationRecord) -> StoreFuture<'_, CancellationRecord>;

    /// Every record for `ride_id`, in append order.
    ///
    /// # Errors
    ///
    /// - `Database`: backend failure
    fn list_for_ride(&self, ride_id: RideId) -> StoreFuture<'_, Vec<CancellationRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_other_needs_text() {
        for reason in CancellationReason::ALL {
            assert_eq!(reason.requires_free_text(), reason == CancellationReason::Other);
        }
    }

    #[test]
    fn reason_codes_parse() {
        assert_eq!(
            "vehicle_issue".parse::<CancellationReason>(),
            Ok(CancellationReason::VehicleIssue)
        );
        assert!("bored".parse::<CancellationReason>().is_err());
    }
}
