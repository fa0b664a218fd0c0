//! Route geometry helpers.
//!
//! Polylines are opaque to the lifecycle logic: they are produced by the
//! routing collaborator and cached on the ride so a reconnecting client does
//! not have to recompute them. The only geometry this crate computes itself
//! is the straight-line fallback and great-circle distance for fare estimates.

use crate::types::Location;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Encoded route geometry (Google encoded polyline format, precision 5).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Polyline(String);

impl Polyline {
    /// Wraps an already encoded polyline
    #[must_use]
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encodes a sequence of `(lat, lng)` points.
    #[must_use]
    pub fn encode(points: &[(f64, f64)]) -> Self {
        let mut out = String::with_capacity(points.len() * 8);
        let (mut prev_lat, mut prev_lng) = (0_i64, 0_i64);

        for &(lat, lng) in points {
            let lat = to_fixed(lat);
            let lng = to_fixed(lng);
            encode_value(lat - prev_lat, &mut out);
            encode_value(lng - prev_lng, &mut out);
            prev_lat = lat;
            prev_lng = lng;
        }

        Self(out)
    }

    /// Two-point polyline used when the routing provider is unavailable.
    #[must_use]
    pub fn straight_line(from: &Location, to: &Location) -> Self {
        Self::encode(&[(from.lat, from.lng), (to.lat, to.lng)])
    }

    /// The encoded string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the polyline carries no points
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Polyline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[allow(clippy::cast_possible_truncation)] // coordinates are bounded to ±180°
fn to_fixed(degrees: f64) -> i64 {
    (degrees * 1e5).round() as i64
}

fn encode_value(delta: i64, out: &mut String) {
    let mut value = delta << 1;
    if delta < 0 {
        value = !value;
    }
    while value >= 0x20 {
        out.push(chunk_char((0x20 | (value & 0x1f)) + 63));
        value >>= 5;
    }
    out.push(chunk_char(value + 63));
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // chunks are 0..=126
fn chunk_char(code: i64) -> char {
    char::from(code as u8)
}

/// Great-circle distance between two locations in kilometres.
#[must_use]
pub fn haversine_km(from: &Location, to: &Location) -> f64 {
    let (lat1, lat2) = (from.lat.to_radians(), to.lat.to_radians());
    let d_lat = lat2 - lat1;
    let d_lng = (to.lng - from.lng).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_reference_vector() {
        let polyline = Polyline::encode(&[(38.5, -120.2), (40.7, -120.95), (43.252, -126.453)]);
        assert_eq!(polyline.as_str(), "_p~iF~ps|U_ulLnnqC_mqNvxq`@");
    }

    #[test]
    fn straight_line_has_two_points() {
        let from = Location::new(38.5, -120.2, "a");
        let to = Location::new(40.7, -120.95, "b");
        assert_eq!(Polyline::straight_line(&from, &to).as_str(), "_p~iF~ps|U_ulLnnqC");
    }

    #[test]
    fn haversine_madrid_barcelona() {
        let madrid = Location::new(40.4168, -3.7038, "Madrid");
        let barcelona = Location::new(41.3874, 2.1686, "Barcelona");
        let km = haversine_km(&madrid, &barcelona);
        assert!((km - 505.0).abs() < 5.0, "got {km}");
    }
}
