//! Incremental route distance.

use crate::geo::{haversine_distance, meters_to_miles};
use crate::GeoPoint;

/// Maintains the cumulative route distance from kept points.
///
/// Each increment is the great-circle distance from the immediately
/// preceding kept point. When a session has a start coordinate, the
/// accumulator is seeded with it so the leg from the start fix to the
/// first kept point is counted. Restore recomputes over the same sequence
/// (seed plus the full point list) and must agree with the incremental
/// total to within floating-point tolerance.
#[derive(Debug, Clone, Default)]
pub struct DistanceAccumulator {
    total_meters: f64,
    last_point: Option<GeoPoint>,
}

impl DistanceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reference point without adding any distance.
    pub fn seed(&mut self, point: GeoPoint) {
        self.last_point = Some(point);
    }

    /// Add a newly kept point; returns the increment in meters.
    pub fn add(&mut self, point: GeoPoint) -> f64 {
        let increment = match self.last_point {
            Some(prev) => haversine_distance(&prev, &point),
            None => 0.0,
        };
        self.total_meters += increment;
        self.last_point = Some(point);
        increment
    }

    /// Recompute the total from a restored point list. Produces the same
    /// value as the incremental path; any divergence is a bug.
    pub fn recompute(seed: Option<GeoPoint>, points: &[GeoPoint]) -> Self {
        let mut acc = Self::new();
        if let Some(start) = seed {
            acc.seed(start);
        }
        for p in points {
            acc.add(*p);
        }
        acc
    }

    pub fn total_meters(&self) -> f64 {
        self.total_meters
    }

    pub fn total_miles(&self) -> f64 {
        meters_to_miles(self.total_meters)
    }

    pub fn last_point(&self) -> Option<GeoPoint> {
        self.last_point
    }
}
