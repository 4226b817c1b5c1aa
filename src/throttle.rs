//! Distance-or-time sample filter.
//!
//! GPS hardware produces many near-duplicate samples while the device is
//! stationary or crawling. The throttle keeps a sample when it has moved
//! far enough OR enough time has passed since the last kept point, which
//! keeps the route dense during fast movement and sparse while idle,
//! bounding both storage and upload volume.

use crate::geo::haversine_distance;
use crate::{GeoPoint, Position, ThrottleConfig};

/// Decides whether a raw sample is significant enough to keep.
///
/// State is per-session: it resets on session start and is rebuilt from the
/// last restored point on restore. The very first sample of a session is
/// always kept.
#[derive(Debug, Clone)]
pub struct PointThrottle {
    config: ThrottleConfig,
    last_kept: Option<(GeoPoint, i64)>,
}

impl PointThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            last_kept: None,
        }
    }

    /// Rebuild throttle state from a restored last-kept point.
    pub fn with_last_kept(config: ThrottleConfig, point: GeoPoint, timestamp_ms: i64) -> Self {
        Self {
            config,
            last_kept: Some((point, timestamp_ms)),
        }
    }

    /// Decide keep/discard for a raw sample without touching state.
    ///
    /// Callers that persist the kept point call [`record_kept`] only once
    /// the point is durable, so a failed write does not shift the
    /// reference point.
    ///
    /// [`record_kept`]: PointThrottle::record_kept
    pub fn should_keep(&self, sample: &Position) -> bool {
        if !sample.is_valid() {
            return false;
        }

        match self.last_kept {
            None => true,
            Some((last_point, last_ts)) => {
                let moved = haversine_distance(&last_point, &sample.geo_point());
                let elapsed_ms = sample.timestamp_ms - last_ts;
                moved >= self.config.min_distance_meters
                    || elapsed_ms >= self.config.min_interval_ms
            }
        }
    }

    /// Mark a sample as the new last-kept reference point.
    pub fn record_kept(&mut self, sample: &Position) {
        self.last_kept = Some((sample.geo_point(), sample.timestamp_ms));
    }

    /// Decide keep/discard for a raw sample, updating state when kept.
    pub fn observe(&mut self, sample: &Position) -> bool {
        let keep = self.should_keep(sample);
        if keep {
            self.record_kept(sample);
        }
        keep
    }

    /// The last kept point, if any sample has been kept.
    pub fn last_kept(&self) -> Option<GeoPoint> {
        self.last_kept.map(|(p, _)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lat: f64, lng: f64, ts: i64) -> Position {
        Position::new(lat, lng, ts)
    }

    #[test]
    fn test_first_sample_always_kept() {
        let mut throttle = PointThrottle::new(ThrottleConfig::default());
        assert!(throttle.observe(&sample(41.8781, -87.6298, 0)));
    }

    #[test]
    fn test_near_duplicates_discarded() {
        let mut throttle = PointThrottle::new(ThrottleConfig::default());
        assert!(throttle.observe(&sample(41.8781, -87.6298, 0)));

        // Jitter of a few meters within the time window: all discarded
        for i in 1..10 {
            let kept = throttle.observe(&sample(
                41.8781 + 0.000_01 * (i % 2) as f64,
                -87.6298,
                i * 400,
            ));
            assert!(!kept, "sample {} should be discarded", i);
        }
    }

    #[test]
    fn test_distance_triggers_keep() {
        let mut throttle = PointThrottle::new(ThrottleConfig::default());
        assert!(throttle.observe(&sample(41.8781, -87.6298, 0)));

        // ~44m north, well past the 30m threshold, 1s later
        assert!(throttle.observe(&sample(41.8785, -87.6298, 1_000)));
    }

    #[test]
    fn test_time_triggers_keep_while_stationary() {
        let mut throttle = PointThrottle::new(ThrottleConfig::default());
        assert!(throttle.observe(&sample(41.8781, -87.6298, 0)));

        // Same spot, 5s later: the time threshold keeps it
        assert!(throttle.observe(&sample(41.8781, -87.6298, 5_000)));
    }

    #[test]
    fn test_invalid_sample_discarded() {
        let mut throttle = PointThrottle::new(ThrottleConfig::default());
        assert!(!throttle.observe(&sample(f64::NAN, -87.6298, 0)));
        // The invalid sample must not count as "first kept"
        assert!(throttle.observe(&sample(41.8781, -87.6298, 100)));
    }

    #[test]
    fn test_should_keep_leaves_state_untouched() {
        let mut throttle = PointThrottle::new(ThrottleConfig::default());
        let first = sample(41.8781, -87.6298, 0);

        // Checking twice gives the same answer until the keep is recorded
        assert!(throttle.should_keep(&first));
        assert!(throttle.should_keep(&first));
        assert!(throttle.last_kept().is_none());

        throttle.record_kept(&first);
        assert!(!throttle.should_keep(&sample(41.8781, -87.6298, 400)));
    }

    #[test]
    fn test_restored_state() {
        let mut throttle = PointThrottle::with_last_kept(
            ThrottleConfig::default(),
            GeoPoint::new(41.8781, -87.6298),
            0,
        );
        // Adjacent sample shortly after restore: still throttled
        assert!(!throttle.observe(&sample(41.8781, -87.6298, 1_000)));
        assert!(throttle.observe(&sample(41.8790, -87.6298, 2_000)));
    }
}
