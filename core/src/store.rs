//! Ride request store trait and change feed.
//!
//! The store is the single source of truth for a ride. Every mutation goes
//! through [`RideRequestStore::conditional_update`]: the caller states what it
//! expects the stored record to look like ([`RidePredicate`]) and the store
//! applies the [`RidePatch`] only if that expectation still holds, atomically
//! with the check. There is no unconditional write path.
//!
//! # Implementations
//!
//! - `PostgresRideStore` (in `ride-dispatch-postgres`): one `UPDATE … WHERE …
//!   RETURNING` per write, `LISTEN/NOTIFY` change feed
//! - `InMemoryRideStore` (in `ride-dispatch-testing`): one mutex per store,
//!   broadcast change feed
//!
//! # Example
//!
//! ```no_run
//! use ride_dispatch_core::ride::{RidePatch, RidePredicate};
//! use ride_dispatch_core::status::RideStatus;
//! use ride_dispatch_core::store::{RideRequestStore, RideStoreError};
//! use ride_dispatch_core::types::{DriverId, RideId};
//! use chrono::Utc;
//!
//! async fn accept<S: RideRequestStore>(store: &S, id: RideId, driver: DriverId) -> Result<(), RideStoreError> {
//!     let expected = RidePredicate::status_is(RideStatus::Pending).driver_unassigned();
//!     store.conditional_update(id, expected, RidePatch::accept(driver, Utc::now())).await?;
//!     Ok(())
//! }
//! ```

use crate::ride::{DriverExpectation, RidePatch, RidePredicate, RideRequest};
use crate::status::RideStatus;
use crate::types::{Party, PassengerId, RideId};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during ride store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RideStoreError {
    /// The stored record no longer satisfies the caller's expectation.
    ///
    /// This is the normal outcome of losing a race and is never fatal.
    #[error("Conflict on ride {ride_id}: stored status is {current}")]
    Conflict {
        /// The ride that was being updated
        ride_id: RideId,
        /// Status found in the store
        current: RideStatus,
    },

    /// No ride with this id.
    #[error("Ride not found: {0}")]
    NotFound(RideId),

    /// A ride with this id already exists.
    #[error("Ride already exists: {0}")]
    AlreadyExists(RideId),

    /// The passenger already has a non-terminal ride.
    #[error("Passenger {0} already has a live ride")]
    LiveRideExists(PassengerId),

    /// The write could never succeed, whatever the stored state.
    #[error("Invalid write: {0}")]
    InvalidWrite(String),

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Row could not be decoded into a ride.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RideStoreError>> + Send + 'a>>;

/// Durable record of ride requests.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the store can be shared as
/// `Arc<dyn RideRequestStore>` and captured by effects.
pub trait RideRequestStore: Send + Sync {
    /// Insert a freshly built `pending` ride.
    ///
    /// The check that the passenger has no other live ride is atomic with
    /// the insert.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists`: the id is taken
    /// - `LiveRideExists`: the passenger already has a non-terminal ride
    /// - `InvalidWrite`: the record is not `pending` or violates the driver invariant
    /// - `Database`: backend failure
    fn create(&self, ride: RideRequest) -> StoreFuture<'_, RideRequest>;

    /// Apply `patch` if and only if the stored record satisfies `expected`.
    ///
    /// The check and the write are one atomic step. On success the patch is
    /// applied with a bumped `updated_at` and `version` and the new record is
    /// returned. Terminal records never satisfy any predicate.
    ///
    /// # Errors
    ///
    /// - `Conflict`: the record moved on; carries the status found
    /// - `NotFound`: unknown id
    /// - `InvalidWrite`: the predicate/patch pair can never be a legal transition
    /// - `Database`: backend failure
    fn conditional_update(
        &self,
        id: RideId,
        expected: RidePredicate,
        patch: RidePatch,
    ) -> StoreFuture<'_, RideRequest>;

    /// Read one ride.
    ///
    /// # Errors
    ///
    /// - `NotFound`: unknown id
    /// - `Database`: backend failure
    fn get(&self, id: RideId) -> StoreFuture<'_, RideRequest>;

    /// The most recently created non-terminal ride involving `party`.
    ///
    /// # Errors
    ///
    /// - `Database`: backend failure
    fn find_active_for(&self, party: Party) -> StoreFuture<'_, Option<RideRequest>>;

    /// Up to `limit` pending rides, oldest first.
    ///
    /// # Errors
    ///
    /// - `Database`: backend failure
    fn list_pending(&self, limit: usize) -> StoreFuture<'_, Vec<RideRequest>>;
}

/// Checks a conditional write that can be rejected without reading the store.
///
/// A patch that moves the status must be a state machine edge from every
/// status the predicate allows, only a write that expects an unassigned
/// driver may set `driver_id`, and only a move off the accepted path may
/// clear it.
///
/// # Errors
///
/// Returns `InvalidWrite` describing the problem.
pub fn validate_write(expected: &RidePredicate, patch: &RidePatch) -> Result<(), RideStoreError> {
    if expected.statuses().is_empty() {
        return Err(RideStoreError::InvalidWrite(
            "predicate allows no status".to_string(),
        ));
    }

    if let Some(next) = patch.status {
        if let Some(from) = expected
            .statuses()
            .iter()
            .find(|from| !from.can_transition_to(next))
        {
            return Err(RideStoreError::InvalidWrite(format!(
                "{from} -> {next} is not a legal transition"
            )));
        }
    }

    if patch.driver_id.is_some() && expected.driver() != DriverExpectation::Unassigned {
        return Err(RideStoreError::InvalidWrite(
            "driver may only be assigned to an unassigned ride".to_string(),
        ));
    }

    let leaves_accepted_path = patch.status.is_some_and(RideStatus::forbids_driver);
    if patch.clear_driver && (patch.driver_id.is_some() || !leaves_accepted_path) {
        return Err(RideStoreError::InvalidWrite(
            "driver may only be released by a move off the accepted path".to_string(),
        ));
    }

    Ok(())
}

/// Checks a record about to be inserted by `create`.
///
/// # Errors
///
/// Returns `InvalidWrite` describing the problem.
pub fn validate_new(ride: &RideRequest) -> Result<(), RideStoreError> {
    if ride.status != RideStatus::Pending {
        return Err(RideStoreError::InvalidWrite(format!(
            "new rides start pending, got {}",
            ride.status
        )));
    }
    ride.check_invariants().map_err(RideStoreError::InvalidWrite)
}

// ============================================================================
// Change feed
// ============================================================================

/// Emitted after every successful write. Observers refetch the record on
/// every notice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideChange {
    /// The ride that changed
    pub ride_id: RideId,
    /// Status after the write
    pub status: RideStatus,
    /// Version after the write
    pub version: u64,
}

/// One item of a change subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeNotice {
    /// A ride changed
    Changed(RideChange),
    /// The subscriber fell behind and `n` notices were dropped
    Lagged(u64),
}

/// Stream of change notices.
pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeNotice> + Send>>;

/// Push notification source for ride changes.
///
/// Delivery is best effort: notices may be duplicated, reordered or dropped
/// (reported as [`ChangeNotice::Lagged`]), and the stream may end. Consumers
/// must re-derive from a fresh read.
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to changes of every ride.
    ///
    /// # Errors
    ///
    /// - `Database`: the feed is unavailable
    fn subscribe(&self) -> StoreFuture<'_, ChangeStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DriverId;
    use chrono::Utc;

    #[test]
    fn accept_write_is_valid() {
        let expected = RidePredicate::status_is(RideStatus::Pending).driver_unassigned();
        let patch = RidePatch::accept(DriverId::new(), Utc::now());
        assert!(validate_write(&expected, &patch).is_ok());
    }

    #[test]
    fn assigning_without_unassigned_expectation_is_rejected() {
        let expected = RidePredicate::status_is(RideStatus::Pending);
        let patch = RidePatch::accept(DriverId::new(), Utc::now());
        assert!(matches!(
            validate_write(&expected, &patch),
            Err(RideStoreError::InvalidWrite(_))
        ));
    }

    #[test]
    fn skipping_required_status_is_rejected() {
        let expected = RidePredicate::status_in([RideStatus::Accepted, RideStatus::TripStarted]);
        let patch = RidePatch::advance(RideStatus::DriverAtDestination, Utc::now());
        assert!(validate_write(&expected, &patch).is_err());
    }

    #[test]
    fn route_only_patch_accepts_any_open_predicate() {
        let expected = RidePredicate::any_open();
        let patch = RidePatch::route(
            crate::ride::RouteLeg::ToOrigin,
            crate::geo::Polyline::new("abc"),
        );
        assert!(validate_write(&expected, &patch).is_ok());
    }

    #[test]
    fn release_must_leave_the_accepted_path() {
        let expected = RidePredicate::status_is(RideStatus::Accepted);
        assert!(validate_write(&expected, &RidePatch::release(RideStatus::CancelledByPassenger)).is_ok());

        let mut keeps_driver = RidePatch::advance(RideStatus::DriverAtOrigin, Utc::now());
        keeps_driver.clear_driver = true;
        assert!(matches!(
            validate_write(&expected, &keeps_driver),
            Err(RideStoreError::InvalidWrite(_))
        ));
    }

    #[test]
    fn empty_predicate_is_rejected() {
        let expected = RidePredicate::status_in(std::iter::empty());
        assert!(validate_write(&expected, &RidePatch::default()).is_err());
    }
}
