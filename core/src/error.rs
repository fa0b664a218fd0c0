//! Error taxonomy surfaced by ride operations.

use crate::status::RideStatus;
use crate::store::RideStoreError;
use crate::types::RideId;
use thiserror::Error;

/// Errors returned by ride dispatch operations.
///
/// `Conflict` and `NotFound` are expected outcomes of racing writers and are
/// recovered locally. `TransportFailure` is logged and degraded.
/// `ValidationFailure` is raised before any write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RideError {
    /// The ride moved on before this write landed
    #[error("Ride {ride_id} is already {current}")]
    Conflict {
        /// The ride
        ride_id: RideId,
        /// Status found in the store
        current: RideStatus,
    },

    /// No such ride
    #[error("Ride not found: {0}")]
    NotFound(RideId),

    /// A collaborator could not be reached
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The request was rejected before touching the store
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    /// The store itself failed
    #[error("Storage error: {0}")]
    Storage(String),
}

impl RideError {
    /// Conflict or not found. Both mean "someone else got there first".
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::NotFound(_))
    }

    /// Shorthand for a validation failure
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailure(reason.into())
    }
}

impl From<RideStoreError> for RideError {
    fn from(error: RideStoreError) -> Self {
        match error {
            RideStoreError::Conflict { ride_id, current } => Self::Conflict { ride_id, current },
            RideStoreError::NotFound(id) => Self::NotFound(id),
            RideStoreError::InvalidWrite(reason) => Self::ValidationFailure(reason),
            RideStoreError::LiveRideExists(passenger) => {
                Self::ValidationFailure(format!("passenger {passenger} already has a live ride"))
            },
            RideStoreError::AlreadyExists(id) => {
                Self::Storage(format!("ride {id} already exists"))
            },
            RideStoreError::Database(msg) | RideStoreError::Serialization(msg) => {
                Self::Storage(msg)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_counts_as_conflict() {
        let id = RideId::new();
        assert!(RideError::from(RideStoreError::NotFound(id)).is_conflict());
        assert!(
            RideError::from(RideStoreError::Conflict {
                ride_id: id,
                current: RideStatus::Accepted
            })
            .is_conflict()
        );
        assert!(!RideError::from(RideStoreError::Database("down".into())).is_conflict());
    }

    #[test]
    fn second_live_ride_is_a_validation_failure() {
        let passenger = crate::types::PassengerId::new();
        assert!(matches!(
            RideError::from(RideStoreError::LiveRideExists(passenger)),
            RideError::ValidationFailure(_)
        ));
    }
}
