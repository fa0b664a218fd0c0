//! In-memory backends and test doubles for ride dispatch.
//!
//! The in-memory store is a full implementation of the conditional-update
//! contract, not a stub: the demo binary runs on it and every dispatch
//! integration test races against it. Around it sit clocks that only move
//! when told, stand-ins for the push, directory and routing collaborators,
//! fixtures and a reducer harness.
//!
//! ```ignore
//! let store = InMemoryRideStore::with_clock(Arc::new(test_clock()));
//! let ride = store.create(fixtures::pending_ride(PassengerId::new())).await?;
//! ```

use chrono::{DateTime, Utc};
use ride_dispatch_core::environment::Clock;

mod collaborator_mocks;
pub mod fixtures;
mod ride_mocks;

/// Clocks, stores and collaborator doubles
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    pub use crate::collaborator_mocks::{
        RecordingNotifier, ScriptedRoutingProvider, StaticDriverDirectory,
    };
    pub use crate::ride_mocks::{InMemoryCancellationLog, InMemoryRideStore};

    /// A clock stuck at one instant.
    ///
    /// ```
    /// use ride_dispatch_core::environment::Clock;
    /// use ride_dispatch_testing::test_clock;
    ///
    /// let clock = test_clock();
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Stuck at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same instant, so a test can hand one clone to the
    /// services and advance another.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move forward by `by`
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// 2025-01-01 00:00:00 UTC, the instant every fixture uses
    #[must_use]
    pub fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// [`FixedClock`] at [`epoch`]
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    /// [`ManualClock`] starting at [`epoch`]
    #[must_use]
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(epoch())
    }
}

/// Proptest strategies for ride values
pub mod properties {
    use proptest::prelude::*;
    use ride_dispatch_core::status::RideStatus;
    use ride_dispatch_core::types::Location;

    /// Any ride status
    pub fn status() -> impl Strategy<Value = RideStatus> {
        proptest::sample::select(RideStatus::ALL.to_vec())
    }

    /// A location with valid coordinates and a non-empty address
    pub fn location() -> impl Strategy<Value = Location> {
        (-85.0..85.0_f64, -179.0..179.0_f64, "[a-z]{3,12}")
            .prop_map(|(lat, lng, address)| Location::new(lat, lng, address))
    }
}

pub use mocks::{
    FixedClock, InMemoryCancellationLog, InMemoryRideStore, ManualClock, RecordingNotifier,
    ScriptedRoutingProvider, StaticDriverDirectory, manual_clock, test_clock,
};
pub use reducer_test::{ReducerTest, assertions};
