//! Traits for the external systems ride dispatch talks to.
//!
//! None of these are owned by this workspace. Routing and push delivery are
//! best effort: a failure degrades the experience but never fails a ride.

use crate::geo::Polyline;
use crate::types::{DriverId, Location, Money, RideId, ServiceCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

// ============================================================================
// Routing
// ============================================================================

/// Errors from the routing provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Provider unreachable or returned an error status
    #[error("Routing provider unavailable: {0}")]
    Unavailable(String),

    /// Provider did not answer in time
    #[error("Routing request timed out")]
    Timeout,

    /// Provider answered but found no route
    #[error("No route between the given points")]
    NoRoute,

    /// Response could not be decoded
    #[error("Invalid routing response: {0}")]
    InvalidResponse(String),
}

impl RoutingError {
    /// Whether another attempt may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Computes a driving route between two points.
pub trait RoutingProvider: Send + Sync {
    /// Route from `from` to `to` as an encoded polyline.
    ///
    /// # Errors
    ///
    /// Any [`RoutingError`]; callers fall back to a straight line.
    fn route(
        &self,
        from: Location,
        to: Location,
    ) -> Pin<Box<dyn Future<Output = Result<Polyline, RoutingError>> + Send + '_>>;
}

// ============================================================================
// Push notifications
// ============================================================================

/// Errors from the push transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// No device registered for the driver
    #[error("Driver {0} has no registered device")]
    Unreachable(DriverId),

    /// Transport failed
    #[error("Push transport failed: {0}")]
    Transport(String),
}

/// Offer pushed to every eligible driver when a ride is created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RideOffer {
    /// The ride on offer
    pub ride_id: RideId,
    /// Pickup point
    pub origin: Location,
    /// Drop-off point
    pub destination: Location,
    /// Service category
    pub service_category: ServiceCategory,
    /// Quoted fare
    pub estimated_fare: Money,
    /// When the ride was requested
    pub created_at: DateTime<Utc>,
}

/// Fire-and-forget push transport.
pub trait PushNotifier: Send + Sync {
    /// Deliver `offer` to `driver_id`. No acknowledgement from the device is
    /// awaited.
    ///
    /// # Errors
    ///
    /// Any [`NotifyError`]; callers log and count it.
    fn notify(
        &self,
        driver_id: DriverId,
        offer: RideOffer,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>>;
}

// ============================================================================
// Driver directory
// ============================================================================

/// Directory lookup failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Driver directory unavailable: {0}")]
pub struct DirectoryError(pub String);

/// What the directory knows about a driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverProfile {
    /// Driver id
    pub driver_id: DriverId,
    /// Currently accepting rides
    pub online: bool,
    /// Documents checked
    pub verified: bool,
}

impl DriverProfile {
    /// Online and verified
    #[must_use]
    pub const fn is_eligible(&self) -> bool {
        self.online && self.verified
    }
}

/// Source of driver availability.
pub trait DriverDirectory: Send + Sync {
    /// Every driver the directory knows about.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] when the directory cannot be read.
    fn drivers(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DriverProfile>, DirectoryError>> + Send + '_>>;
}

// ============================================================================
// Fare policy
// ============================================================================

/// Prices a ride at creation time.
pub trait FarePolicy: Send + Sync {
    /// Fare for `category` between the two points, or `None` when the
    /// category is not priced.
    fn estimate(
        &self,
        category: &ServiceCategory,
        origin: &Location,
        destination: &Location,
    ) -> Option<Money>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_needs_both_flags() {
        let mut profile = DriverProfile {
            driver_id: DriverId::new(),
            online: true,
            verified: false,
        };
        assert!(!profile.is_eligible());
        profile.verified = true;
        assert!(profile.is_eligible());
    }

    #[test]
    fn only_connectivity_errors_are_transient() {
        assert!(RoutingError::Timeout.is_transient());
        assert!(RoutingError::Unavailable("503".into()).is_transient());
        assert!(!RoutingError::NoRoute.is_transient());
    }
}
