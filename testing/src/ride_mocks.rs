//! In-memory ride storage
//!
//! Provides fast, deterministic backends for tests and local runs:
//! - [`InMemoryRideStore`]: `HashMap`-based ride store with a broadcast change feed
//! - [`InMemoryCancellationLog`]: `Vec`-backed append-only log
//!
//! Every conditional update is checked and applied under one mutex, which is
//! exactly the atomicity the store contract asks for.

use futures::stream;
use ride_dispatch_core::cancellation::{CancellationLog, CancellationRecord};
use ride_dispatch_core::environment::{Clock, SystemClock};
use ride_dispatch_core::ride::{RidePatch, RidePredicate, RideRequest};
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::store::{
    ChangeFeed, ChangeNotice, ChangeStream, RideChange, RideRequestStore, RideStoreError,
    StoreFuture, validate_new, validate_write,
};
use ride_dispatch_core::types::{Party, RideId};
use ride_dispatch_runtime::metrics::{StoreMetrics, UpdateOutcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;

/// Capacity of the change broadcast channel
const CHANGE_CAPACITY: usize = 256;

struct Rides {
    by_id: HashMap<RideId, RideRequest>,
    /// Creation order, used for "most recent" and "oldest first" queries
    order: Vec<RideId>,
    /// Every status each ride has been in, in commit order
    history: HashMap<RideId, Vec<RideStatus>>,
    changes: broadcast::Sender<RideChange>,
    feed_available: bool,
}

/// In-memory ride store for tests and the demo binary.
///
/// # Example
///
/// ```
/// use ride_dispatch_testing::InMemoryRideStore;
///
/// let store = InMemoryRideStore::new();
/// assert!(store.is_empty());
/// ```
#[derive(Clone)]
pub struct InMemoryRideStore {
    rides: Arc<Mutex<Rides>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRideStore {
    /// Create an empty store stamped by the system clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that stamps `updated_at` from `clock`
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            rides: Arc::new(Mutex::new(Rides {
                by_id: HashMap::new(),
                order: Vec::new(),
                history: HashMap::new(),
                changes,
                feed_available: true,
            })),
            clock,
        }
    }

    fn rides(&self) -> MutexGuard<'_, Rides> {
        self.rides.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored rides
    #[must_use]
    pub fn len(&self) -> usize {
        self.rides().by_id.len()
    }

    /// Whether the store holds no rides
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rides().by_id.is_empty()
    }

    /// Every status `id` has committed, starting with `pending`
    #[must_use]
    pub fn status_history(&self, id: RideId) -> Vec<RideStatus> {
        self.rides().history.get(&id).cloned().unwrap_or_default()
    }

    /// Every ride ever created for `party`, oldest first
    #[must_use]
    pub fn rides_for(&self, party: Party) -> Vec<RideRequest> {
        let rides = self.rides();
        rides
            .order
            .iter()
            .filter_map(|id| rides.by_id.get(id))
            .filter(|ride| involves(ride, party))
            .cloned()
            .collect()
    }

    /// Make `subscribe` fail, as if the push channel were down
    pub fn set_feed_available(&self, available: bool) {
        self.rides().feed_available = available;
    }

    /// End every open change subscription
    pub fn drop_subscribers(&self) {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        self.rides().changes = changes;
    }

    /// Clear all rides (for test isolation)
    pub fn clear(&self) {
        let mut rides = self.rides();
        rides.by_id.clear();
        rides.order.clear();
        rides.history.clear();
    }
}

impl Default for InMemoryRideStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryRideStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRideStore")
            .field("rides", &self.len())
            .finish_non_exhaustive()
    }
}

fn involves(ride: &RideRequest, party: Party) -> bool {
    match party {
        Party::Passenger(id) => ride.passenger_id == id,
        Party::Driver(id) => ride.driver_id == Some(id),
    }
}

fn change_of(ride: &RideRequest) -> RideChange {
    RideChange {
        ride_id: ride.id,
        status: ride.status,
        version: ride.version,
    }
}

impl RideRequestStore for InMemoryRideStore {
    fn create(&self, ride: RideRequest) -> StoreFuture<'_, RideRequest> {
        Box::pin(async move {
            validate_new(&ride)?;

            let mut rides = self.rides();
            if rides.by_id.contains_key(&ride.id) {
                return Err(RideStoreError::AlreadyExists(ride.id));
            }
            let passenger = Party::Passenger(ride.passenger_id);
            if rides.by_id.values().any(|other| other.is_active() && involves(other, passenger)) {
                return Err(RideStoreError::LiveRideExists(ride.passenger_id));
            }

            rides.order.push(ride.id);
            rides.history.insert(ride.id, vec![ride.status]);
            rides.by_id.insert(ride.id, ride.clone());
            let _ = rides.changes.send(change_of(&ride));
            Ok(ride)
        })
    }

    fn conditional_update(
        &self,
        id: RideId,
        expected: RidePredicate,
        patch: RidePatch,
    ) -> StoreFuture<'_, RideRequest> {
        Box::pin(async move {
            let start = Instant::now();
            let result = self.apply_conditional(id, &expected, &patch);
            let outcome = match &result {
                Ok(_) => UpdateOutcome::Applied,
                Err(RideStoreError::Conflict { .. }) => UpdateOutcome::Conflict,
                Err(RideStoreError::NotFound(_)) => UpdateOutcome::NotFound,
                Err(_) => UpdateOutcome::Error,
            };
            StoreMetrics::record_update(outcome, start.elapsed());
            result
        })
    }

    fn get(&self, id: RideId) -> StoreFuture<'_, RideRequest> {
        Box::pin(async move {
            self.rides()
                .by_id
                .get(&id)
                .cloned()
                .ok_or(RideStoreError::NotFound(id))
        })
    }

    fn find_active_for(&self, party: Party) -> StoreFuture<'_, Option<RideRequest>> {
        Box::pin(async move {
            let rides = self.rides();
            Ok(rides
                .order
                .iter()
                .rev()
                .filter_map(|id| rides.by_id.get(id))
                .find(|ride| ride.is_active() && involves(ride, party))
                .cloned())
        })
    }

    fn list_pending(&self, limit: usize) -> StoreFuture<'_, Vec<RideRequest>> {
        Box::pin(async move {
            let rides = self.rides();
            Ok(rides
                .order
                .iter()
                .filter_map(|id| rides.by_id.get(id))
                .filter(|ride| ride.status == RideStatus::Pending)
                .take(limit)
                .cloned()
                .collect())
        })
    }
}

impl InMemoryRideStore {
    fn apply_conditional(
        &self,
        id: RideId,
        expected: &RidePredicate,
        patch: &RidePatch,
    ) -> Result<RideRequest, RideStoreError> {
        validate_write(expected, patch)?;

        let mut rides = self.rides();
        let current = rides.by_id.get(&id).ok_or(RideStoreError::NotFound(id))?;
        if !expected.matches(current) {
            return Err(RideStoreError::Conflict {
                ride_id: id,
                current: current.status,
            });
        }

        let mut next = current.clone();
        next.apply(patch, self.clock.now());
        next.check_invariants().map_err(RideStoreError::InvalidWrite)?;

        let status_changed = next.status != current.status;
        rides.by_id.insert(id, next.clone());
        if status_changed {
            rides.history.entry(id).or_default().push(next.status);
        }
        let _ = rides.changes.send(change_of(&next));
        Ok(next)
    }
}

impl ChangeFeed for InMemoryRideStore {
    fn subscribe(&self) -> StoreFuture<'_, ChangeStream> {
        Box::pin(async move {
            let rides = self.rides();
            if !rides.feed_available {
                return Err(RideStoreError::Database(
                    "change feed unavailable".to_string(),
                ));
            }
            let receiver = rides.changes.subscribe();
            drop(rides);

            let notices = stream::unfold(receiver, |mut receiver| async move {
                match receiver.recv().await {
                    Ok(change) => Some((ChangeNotice::Changed(change), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        Some((ChangeNotice::Lagged(skipped), receiver))
                    },
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            });
            Ok(Box::pin(notices) as ChangeStream)
        })
    }
}

#[derive(Debug, Default)]
struct Entries {
    records: Vec<CancellationRecord>,
    failing: bool,
}

/// In-memory cancellation log.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCancellationLog {
    entries: Arc<Mutex<Entries>>,
}

impl InMemoryCancellationLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every record, in append order
    #[must_use]
    pub fn all(&self) -> Vec<CancellationRecord> {
        self.entries().records.clone()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().records.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().records.is_empty()
    }

    /// Make every `append` fail, as if the log's database were down
    pub fn set_failing(&self, failing: bool) {
        self.entries().failing = failing;
    }
}

impl CancellationLog for InMemoryCancellationLog {
    fn append(&self, record: CancellationRecord) -> StoreFuture<'_, CancellationRecord> {
        Box::pin(async move {
            let mut entries = self.entries();
            if entries.failing {
                return Err(RideStoreError::Database(
                    "cancellation log unavailable".to_string(),
                ));
            }
            let earlier = entries.records.iter().find(|earlier| {
                earlier.ride_id == record.ride_id && earlier.canceller == record.canceller
            });
            if let Some(earlier) = earlier {
                return Ok(earlier.clone());
            }
            entries.records.push(record.clone());
            Ok(record)
        })
    }

    fn list_for_ride(&self, ride_id: RideId) -> StoreFuture<'_, Vec<CancellationRecord>> {
        Box::pin(async move {
            Ok(self
                .entries()
                .records
                .iter()
                .filter(|record| record.ride_id == ride_id)
                .cloned()
                .collect())
        })
    }
}
