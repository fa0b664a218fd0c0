//! Scriptable stand-ins for the external collaborators.

use ride_dispatch_core::collaborators::{
    DirectoryError, DriverDirectory, DriverProfile, NotifyError, PushNotifier, RideOffer,
    RoutingError, RoutingProvider,
};
use ride_dispatch_core::geo::Polyline;
use ride_dispatch_core::types::{DriverId, Location, RideId};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Driver directory
// ============================================================================

/// Driver directory backed by a fixed list.
#[derive(Clone, Debug, Default)]
pub struct StaticDriverDirectory {
    profiles: Arc<Mutex<Vec<DriverProfile>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl StaticDriverDirectory {
    /// Directory holding `profiles`
    #[must_use]
    pub fn new(profiles: Vec<DriverProfile>) -> Self {
        Self {
            profiles: Arc::new(Mutex::new(profiles)),
            unavailable: Arc::new(Mutex::new(false)),
        }
    }

    /// Directory where every listed driver is online and verified
    #[must_use]
    pub fn online(drivers: &[DriverId]) -> Self {
        Self::new(
            drivers
                .iter()
                .map(|&driver_id| DriverProfile {
                    driver_id,
                    online: true,
                    verified: true,
                })
                .collect(),
        )
    }

    /// Add or replace a profile
    pub fn upsert(&self, profile: DriverProfile) {
        let mut profiles = lock(&self.profiles);
        profiles.retain(|p| p.driver_id != profile.driver_id);
        profiles.push(profile);
    }

    /// Make every lookup fail
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }
}

impl DriverDirectory for StaticDriverDirectory {
    fn drivers(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DriverProfile>, DirectoryError>> + Send + '_>> {
        Box::pin(async move {
            if *lock(&self.unavailable) {
                return Err(DirectoryError("directory offline".to_string()));
            }
            Ok(lock(&self.profiles).clone())
        })
    }
}

// ============================================================================
// Push notifier
// ============================================================================

/// Push notifier that records every delivery instead of sending it.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(DriverId, RideOffer)>>>,
    unreachable: Arc<Mutex<HashSet<DriverId>>>,
    attempts: Arc<AtomicUsize>,
}

impl RecordingNotifier {
    /// Create a notifier that delivers to everyone
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every delivery to `driver_id`
    pub fn make_unreachable(&self, driver_id: DriverId) {
        lock(&self.unreachable).insert(driver_id);
    }

    /// Every successful delivery, in order
    #[must_use]
    pub fn sent(&self) -> Vec<(DriverId, RideOffer)> {
        lock(&self.sent).clone()
    }

    /// Drivers that received an offer for `ride_id`
    #[must_use]
    pub fn recipients(&self, ride_id: RideId) -> Vec<DriverId> {
        lock(&self.sent)
            .iter()
            .filter(|(_, offer)| offer.ride_id == ride_id)
            .map(|(driver, _)| *driver)
            .collect()
    }

    /// Deliveries attempted, including failed ones
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl PushNotifier for RecordingNotifier {
    fn notify(
        &self,
        driver_id: DriverId,
        offer: RideOffer,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if lock(&self.unreachable).contains(&driver_id) {
                return Err(NotifyError::Unreachable(driver_id));
            }
            lock(&self.sent).push((driver_id, offer));
            Ok(())
        })
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Routing provider that replays scripted answers.
///
/// Queued answers are consumed first; afterwards every call returns the
/// fallback answer.
#[derive(Clone, Debug)]
pub struct ScriptedRoutingProvider {
    script: Arc<Mutex<VecDeque<Result<Polyline, RoutingError>>>>,
    fallback: Result<Polyline, RoutingError>,
    calls: Arc<Mutex<Vec<(Location, Location)>>>,
}

impl ScriptedRoutingProvider {
    /// Always answers with `polyline`
    #[must_use]
    pub fn succeeding(polyline: Polyline) -> Self {
        Self::with_fallback(Ok(polyline))
    }

    /// Always fails with `error`
    #[must_use]
    pub fn failing(error: RoutingError) -> Self {
        Self::with_fallback(Err(error))
    }

    fn with_fallback(fallback: Result<Polyline, RoutingError>) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue one answer ahead of the fallback
    #[must_use]
    pub fn then(self, answer: Result<Polyline, RoutingError>) -> Self {
        lock(&self.script).push_back(answer);
        self
    }

    /// Number of route requests received
    #[must_use]
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Every request received, in order
    #[must_use]
    pub fn calls(&self) -> Vec<(Location, Location)> {
        lock(&self.calls).clone()
    }
}

impl RoutingProvider for ScriptedRoutingProvider {
    fn route(
        &self,
        from: Location,
        to: Location,
    ) -> Pin<Box<dyn Future<Output = Result<Polyline, RoutingError>> + Send + '_>> {
        Box::pin(async move {
            lock(&self.calls).push((from, to));
            let next = lock(&self.script).pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        })
    }
}
