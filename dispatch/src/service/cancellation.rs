//! Cancellation by either party, logged once per party.

use super::RideService;
use ride_dispatch_core::cancellation::{CancellationReason, CancellationRecord};
use ride_dispatch_core::error::RideError;
use ride_dispatch_core::ride::{RidePatch, RidePredicate, RideRequest};
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::types::{Party, RideId};
use ride_dispatch_runtime::metrics::RideMetrics;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conditional writes attempted before giving up on a ride that keeps moving
const MAX_CANCEL_ATTEMPTS: usize = 3;

/// What a party submits to cancel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Reason code
    pub reason: CancellationReason,
    /// Required for [`CancellationReason::Other`]
    pub free_text: Option<String>,
}

impl CancelRequest {
    /// A request with just a reason code
    #[must_use]
    pub const fn new(reason: CancellationReason) -> Self {
        Self {
            reason,
            free_text: None,
        }
    }

    /// Attach free text
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.free_text = Some(text.into());
        self
    }

    fn validate(&self) -> Result<(), RideError> {
        let has_text = self.free_text.as_deref().is_some_and(|t| !t.trim().is_empty());
        if self.reason.requires_free_text() && !has_text {
            return Err(RideError::validation(format!(
                "reason {} needs a description",
                self.reason.as_str()
            )));
        }
        Ok(())
    }
}

impl RideService {
    /// Cancel `ride_id` on behalf of `caller`.
    ///
    /// Only the first cancellation moves the ride to `cancelled_by_passenger`
    /// / `cancelled_by_driver` and releases its driver; its log entry says so
    /// with `applied`. A ride keeps at most one log entry per party.
    ///
    /// - A party repeating its own cancellation gets its earlier entry back
    ///   and nothing is appended.
    /// - A party that lost the race to the other party's cancellation gets a
    ///   non-applied entry, which is logged.
    /// - A party that finds the ride ended any other way (completed, expired,
    ///   no-show) gets [`RideError::Conflict`]; its entry is still logged.
    ///
    /// Once the status write commits the cancellation stands: a failed log
    /// append is reported in the logs, not to the caller.
    ///
    /// # Errors
    ///
    /// - [`RideError::ValidationFailure`]: missing free text, or the caller is
    ///   neither the ride's passenger nor its assigned driver
    /// - [`RideError::Conflict`]: the ride already ended without a cancellation
    /// - [`RideError::NotFound`]: no such ride
    /// - [`RideError::Storage`]: backend failure before anything was committed
    pub async fn cancel(
        &self,
        caller: Party,
        ride_id: RideId,
        request: CancelRequest,
    ) -> Result<CancellationRecord, RideError> {
        request.validate()?;

        let mut ride = self.env.store.get(ride_id).await?;
        if ride.status.is_terminal() {
            if let Some(earlier) = self.logged_by(caller, ride_id).await? {
                return outcome(&ride, earlier);
            }
        }
        authorize(caller, &ride)?;

        let target = match caller {
            Party::Passenger(_) => RideStatus::CancelledByPassenger,
            Party::Driver(_) => RideStatus::CancelledByDriver,
        };

        let mut applied = false;
        let mut status_at_cancel = ride.status;
        for _ in 0..MAX_CANCEL_ATTEMPTS {
            if ride.status.is_terminal() {
                break;
            }
            status_at_cancel = ride.status;

            // Pin the observed status so the log records exactly what was cancelled
            let mut expected = RidePredicate::status_is(ride.status);
            if let Party::Driver(driver_id) = caller {
                expected = expected.driver_is(driver_id);
            }

            match self
                .env
                .store
                .conditional_update(ride_id, expected, RidePatch::release(target))
                .await
                .map_err(RideError::from)
            {
                Ok(updated) => {
                    applied = true;
                    ride = updated;
                    break;
                },
                Err(RideError::Conflict { .. }) => {
                    ride = self.env.store.get(ride_id).await?;
                },
                Err(error) => return Err(error),
            }
        }

        let record = CancellationRecord {
            id: Uuid::new_v4(),
            ride_id,
            canceller: caller,
            reason: request.reason,
            free_text: request.free_text,
            status_at_cancel,
            driver_at_cancel: ride.driver_id.or(ride.released_driver_id),
            applied,
            recorded_at: self.env.clock.now(),
        };
        let role = caller.role().as_str();

        if applied {
            self.timers.disarm(ride_id);
            RideMetrics::record_cancelled(role, true);
            tracing::info!(
                ride_id = %ride_id,
                canceller = %caller,
                reason = record.reason.as_str(),
                status_at_cancel = %status_at_cancel,
                "Ride cancelled"
            );
            return match self.env.cancellations.append(record.clone()).await {
                Ok(stored) => Ok(stored),
                Err(error) => {
                    tracing::error!(
                        ride_id = %ride_id,
                        canceller = %caller,
                        error = %error,
                        "Ride cancelled but the cancellation log append failed"
                    );
                    Ok(record)
                },
            };
        }

        if ride.status == target {
            // Our own earlier call committed this; its entry is the one to keep
            tracing::debug!(ride_id = %ride_id, canceller = %caller, "Repeat cancellation ignored");
            return Ok(self.logged_by(caller, ride_id).await?.unwrap_or(record));
        }

        let record = self.env.cancellations.append(record).await?;
        RideMetrics::record_cancelled(role, false);
        tracing::debug!(
            ride_id = %ride_id,
            canceller = %caller,
            current = %ride.status,
            "Cancellation logged without status change"
        );
        outcome(&ride, record)
    }

    /// The entry `caller` already left on `ride_id`, if any.
    async fn logged_by(&self, caller: Party, ride_id: RideId) -> Result<Option<CancellationRecord>, RideError> {
        let records = self.env.cancellations.list_for_ride(ride_id).await?;
        Ok(records.into_iter().find(|record| record.canceller == caller))
    }
}

/// A cancellation that did not apply still succeeds when the ride ended
/// cancelled; any other ending is a conflict.
fn outcome(ride: &RideRequest, record: CancellationRecord) -> Result<CancellationRecord, RideError> {
    match ride.status {
        RideStatus::CancelledByPassenger | RideStatus::CancelledByDriver => Ok(record),
        current => Err(RideError::Conflict {
            ride_id: ride.id,
            current,
        }),
    }
}

fn authorize(caller: Party, ride: &RideRequest) -> Result<(), RideError> {
    let allowed = match caller {
        Party::Passenger(id) => ride.passenger_id == id,
        Party::Driver(id) => ride.held_by(id),
    };
    if allowed {
        Ok(())
    } else {
        Err(RideError::validation(format!(
            "{caller} may not cancel ride {}",
            ride.id
        )))
    }
}
