//! Geographic utilities: great-circle distance and unit conversion.

use crate::GeoPoint;

/// Mean Earth radius in meters (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

const METERS_PER_MILE: f64 = 1_609.344;

/// Great-circle distance between two points in meters (haversine).
pub fn haversine_distance(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlng = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Convert meters to statute miles.
pub fn meters_to_miles(meters: f64) -> f64 {
    meters / METERS_PER_MILE
}
