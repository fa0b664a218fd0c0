//! Optimistic client-side records.
//!
//! A client shows its own write before the store confirms it. The local copy
//! is [`Optimistic::Pending`] under a correlation id the write carries;
//! when the stored record comes back (as the write's response or through a
//! change notification, whichever arrives first) it replaces the pending copy
//! by correlation id. A stored record that matches nothing pending is
//! appended if absent, or replaces an older copy of itself.

use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::types::{CorrelationId, RideId};
use serde::{Deserialize, Serialize};

/// A value the store may or may not have confirmed yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Optimistic<T> {
    /// Shown locally, not yet confirmed
    Pending {
        /// Carried by the write that will confirm it
        correlation_id: CorrelationId,
        /// Provisional value
        value: T,
    },
    /// As stored
    Committed(T),
}

impl<T> Optimistic<T> {
    /// The value, confirmed or not
    pub const fn value(&self) -> &T {
        match self {
            Self::Pending { value, .. } | Self::Committed(value) => value,
        }
    }

    /// Whether the store has not confirmed this value yet
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    /// Correlation id of a pending value
    pub const fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::Pending { correlation_id, .. } => Some(*correlation_id),
            Self::Committed(_) => None,
        }
    }
}

/// A stored record that can replace its optimistic copy.
pub trait Reconcilable {
    /// Identity of the stored record
    type Key: PartialEq;

    /// The record's identity
    fn key(&self) -> Self::Key;

    /// Correlation id copied from the write that created it
    fn correlation_id(&self) -> Option<CorrelationId>;

    /// Monotonic per-record revision
    fn revision(&self) -> u64;
}

impl Reconcilable for RideRequest {
    type Key = RideId;

    fn key(&self) -> RideId {
        self.id
    }

    fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    fn revision(&self) -> u64 {
        self.version
    }
}

/// Outcome of [`OptimisticList::reconcile`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// A pending value was confirmed
    Confirmed,
    /// A committed value was replaced by a newer revision
    Updated,
    /// Nothing matched; the record was appended
    Appended,
    /// An equal or newer copy was already held
    Ignored,
}

/// Ordered list of optimistic values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimisticList<T> {
    items: Vec<Optimistic<T>>,
}

impl<T> Default for OptimisticList<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Reconcilable> OptimisticList<T> {
    /// Empty list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Show `value` before the store confirms it
    pub fn push_pending(&mut self, correlation_id: CorrelationId, value: T) {
        self.items.push(Optimistic::Pending { correlation_id, value });
    }

    /// Fold a stored record into the list.
    pub fn reconcile(&mut self, stored: T) -> Reconciled {
        if let Some(correlation_id) = stored.correlation_id() {
            if let Some(slot) = self
                .items
                .iter_mut()
                .find(|item| item.correlation_id() == Some(correlation_id))
            {
                *slot = Optimistic::Committed(stored);
                return Reconciled::Confirmed;
            }
        }

        let key = stored.key();
        let existing = self
            .items
            .iter_mut()
            .find(|item| !item.is_pending() && item.value().key() == key);
        match existing {
            Some(slot) if slot.value().revision() < stored.revision() => {
                *slot = Optimistic::Committed(stored);
                Reconciled::Updated
            },
            Some(_) => Reconciled::Ignored,
            None => {
                self.items.push(Optimistic::Committed(stored));
                Reconciled::Appended
            },
        }
    }

    /// Drop the pending value for a write that failed, returning it
    pub fn reject(&mut self, correlation_id: CorrelationId) -> Option<T> {
        let index = self
            .items
            .iter()
            .position(|item| item.correlation_id() == Some(correlation_id))?;
        match self.items.remove(index) {
            Optimistic::Pending { value, .. } | Optimistic::Committed(value) => Some(value),
        }
    }

    /// Every value, confirmed or not, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Optimistic<T>> {
        self.items.iter()
    }

    /// The most recently added value
    #[must_use]
    pub fn latest(&self) -> Option<&Optimistic<T>> {
        self.items.last()
    }

    /// Whether any value is still unconfirmed
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.items.iter().any(Optimistic::is_pending)
    }

    /// Number of values held
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Item {
        id: u32,
        correlation: Option<CorrelationId>,
        revision: u64,
    }

    impl Reconcilable for Item {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }

        fn correlation_id(&self) -> Option<CorrelationId> {
            self.correlation
        }

        fn revision(&self) -> u64 {
            self.revision
        }
    }

    fn item(id: u32, correlation: Option<CorrelationId>, revision: u64) -> Item {
        Item {
            id,
            correlation,
            revision,
        }
    }

    #[test]
    fn stored_record_confirms_pending_by_correlation() {
        let correlation = CorrelationId::new();
        let mut list = OptimisticList::new();
        list.push_pending(correlation, item(0, Some(correlation), 0));

        assert_eq!(list.reconcile(item(7, Some(correlation), 1)), Reconciled::Confirmed);
        assert_eq!(list.len(), 1);
        assert!(!list.has_pending());
        assert_eq!(list.latest().map(|i| i.value().id), Some(7));
    }

    #[test]
    fn notification_and_response_do_not_duplicate() {
        let correlation = CorrelationId::new();
        let mut list = OptimisticList::new();
        list.push_pending(correlation, item(0, Some(correlation), 0));

        list.reconcile(item(7, Some(correlation), 1));
        assert_eq!(list.reconcile(item(7, Some(correlation), 1)), Reconciled::Ignored);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn unknown_records_are_appended_once() {
        let mut list = OptimisticList::new();
        assert_eq!(list.reconcile(item(1, None, 1)), Reconciled::Appended);
        assert_eq!(list.reconcile(item(1, None, 1)), Reconciled::Ignored);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn older_revision_never_replaces_newer() {
        let mut list = OptimisticList::new();
        list.reconcile(item(1, None, 3));
        assert_eq!(list.reconcile(item(1, None, 2)), Reconciled::Ignored);
        assert_eq!(list.reconcile(item(1, None, 4)), Reconciled::Updated);
        assert_eq!(list.latest().map(|i| i.value().revision), Some(4));
    }

    #[test]
    fn rejected_write_removes_its_pending_value() {
        let correlation = CorrelationId::new();
        let mut list = OptimisticList::new();
        list.push_pending(correlation, item(0, Some(correlation), 0));

        assert!(list.reject(correlation).is_some());
        assert!(list.is_empty());
        assert!(list.reject(correlation).is_none());
    }
}
