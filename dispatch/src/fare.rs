//! Distance-based fare estimation.
//!
//! The quote is read once, at creation, and frozen as `actual_fare` on
//! completion. Nothing here is consulted after a ride exists.

use crate::config::FareConfig;
use ride_dispatch_core::collaborators::FarePolicy;
use ride_dispatch_core::geo::haversine_km;
use ride_dispatch_core::types::{Location, Money, ServiceCategory};
use std::collections::HashMap;

/// Per-category pricing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tariff {
    /// Flat part
    pub base: Money,
    /// Per kilometre of great-circle distance
    pub per_km: Money,
    /// Floor
    pub minimum: Money,
}

impl Tariff {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)] // fares are far below 2^52 cents
    fn price(&self, km: f64) -> Money {
        let distance_cents = (km * self.per_km.cents() as f64).round() as i64;
        let total = self.base.cents() + distance_cents;
        Money::from_cents(total.max(self.minimum.cents()))
    }
}

/// Haversine distance times a per-category tariff.
///
/// Categories without their own tariff use the default one.
#[derive(Debug, Clone)]
pub struct DistanceFarePolicy {
    default: Tariff,
    categories: HashMap<String, Tariff>,
}

impl DistanceFarePolicy {
    /// Policy with a single tariff for every category
    #[must_use]
    pub fn new(default: Tariff) -> Self {
        Self {
            default,
            categories: HashMap::new(),
        }
    }

    /// Policy from the configured defaults
    #[must_use]
    pub fn from_config(config: &FareConfig) -> Self {
        Self::new(Tariff {
            base: Money::from_cents(config.base_cents),
            per_km: Money::from_cents(config.per_km_cents),
            minimum: Money::from_cents(config.minimum_cents),
        })
    }

    /// Override the tariff of one category
    #[must_use]
    pub fn with_category(mut self, category: &ServiceCategory, tariff: Tariff) -> Self {
        self.categories.insert(category.as_str().to_string(), tariff);
        self
    }
}

impl FarePolicy for DistanceFarePolicy {
    fn estimate(
        &self,
        category: &ServiceCategory,
        origin: &Location,
        destination: &Location,
    ) -> Option<Money> {
        let km = haversine_km(origin, destination);
        if !km.is_finite() {
            return None;
        }
        let tariff = self.categories.get(category.as_str()).unwrap_or(&self.default);
        Some(tariff.price(km)).filter(Money::is_positive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tariff(base: i64, per_km: i64, minimum: i64) -> Tariff {
        Tariff {
            base: Money::from_cents(base),
            per_km: Money::from_cents(per_km),
            minimum: Money::from_cents(minimum),
        }
    }

    fn madrid() -> (Location, Location) {
        (
            Location::new(40.4168, -3.7038, "Sol"),
            Location::new(40.4530, -3.6883, "Bernabeu"),
        )
    }

    #[test]
    fn short_trips_hit_the_minimum() {
        let policy = DistanceFarePolicy::new(tariff(100, 10, 900));
        let (origin, destination) = madrid();
        let fare = policy.estimate(&ServiceCategory::new("standard"), &origin, &destination);
        assert_eq!(fare, Some(Money::from_cents(900)));
    }

    #[test]
    fn distance_is_priced_per_km() {
        let policy = DistanceFarePolicy::new(tariff(250, 1_000, 0));
        let (origin, destination) = madrid();
        let km = haversine_km(&origin, &destination);
        let fare = policy
            .estimate(&ServiceCategory::new("standard"), &origin, &destination)
            .map(|m| m.cents());

        #[allow(clippy::cast_possible_truncation)]
        let expected = 250 + (km * 1_000.0).round() as i64;
        assert_eq!(fare, Some(expected));
    }

    #[test]
    fn category_override_wins() {
        let premium = ServiceCategory::new("premium");
        let policy = DistanceFarePolicy::new(tariff(100, 100, 0))
            .with_category(&premium, tariff(1_000, 100, 0));
        let (origin, destination) = madrid();

        let standard = policy
            .estimate(&ServiceCategory::new("standard"), &origin, &destination)
            .map(|m| m.cents());
        let upgraded = policy
            .estimate(&premium, &origin, &destination)
            .map(|m| m.cents());
        assert_eq!(upgraded.zip(standard).map(|(p, s)| p - s), Some(900));
    }
}
