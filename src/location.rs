//! Location provider seam.
//!
//! The platform location stack (permissions, fixes, watch subscriptions)
//! lives outside this engine. The trait below is everything the engine
//! consumes; tests substitute a scripted implementation.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Position;

/// Outcome of a location permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Hints passed to the platform watch subscription. The throttle still
/// applies on top of whatever cadence the platform delivers.
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Ask the platform to report after roughly this much movement.
    pub distance_interval_meters: f64,
    /// Ask the platform to report at most this often.
    pub time_interval_ms: i64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            distance_interval_meters: 10.0,
            time_interval_ms: 1_000,
        }
    }
}

/// Supplies location samples and permission state.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Ask for (or confirm) location permission.
    async fn request_permission(&self) -> PermissionStatus;

    /// A fresh fix, or None once the timeout elapses.
    async fn current_position(&self, timeout: Duration) -> Option<Position>;

    /// The most recent fix the platform has cached, if any.
    fn last_known(&self) -> Option<Position>;

    /// Begin streaming samples. Samples arrive on the returned channel on
    /// the platform's own cadence until `stop_watch` is called or the
    /// receiver is dropped.
    async fn watch(&self, options: WatchOptions) -> mpsc::Receiver<Position>;

    /// Stop the active watch subscription, if one exists.
    async fn stop_watch(&self);
}
