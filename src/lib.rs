//! # Field Capture
//!
//! Offline-first GPS field capture and sync engine for property lead
//! scouting. A scout drives a neighborhood with an intermittently-connected
//! device; this crate tracks the outing as a session, throttles raw GPS
//! samples into a durable route, uploads kept points in idempotent batches,
//! and captures tagged lead observations with retrying reverse-geocoding.
//!
//! This library provides:
//! - A session state machine (start/pause/resume/end/abandon)
//! - Distance-or-time point throttling with incremental route distance
//! - Crash-safe SQLite persistence of the session, route, and upload queue
//! - At-least-once batch delivery to a remote store
//! - Lead capture with quick-scoring and coordinate-fallback geocoding
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use field_capture::{
//!     EngineConfig, GeocodeResolver, HttpGeocoder, HttpRemoteStore,
//!     SessionController,
//! };
//! # use field_capture::location::LocationProvider;
//! # async fn demo(provider: Arc<dyn LocationProvider>) -> field_capture::Result<()> {
//! let remote = Arc::new(HttpRemoteStore::new("https://api.example.com", "token")?);
//! let geocoder = Arc::new(HttpGeocoder::new("https://geocode.example.com")?);
//! let config = EngineConfig::new("tenant-42");
//!
//! let controller = SessionController::open(
//!     "capture.db", provider, remote, geocoder, config,
//! )?;
//! let session = controller.start().await?;
//! println!("tracking session {}", session.id);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{CaptureError, OptionExt, Result};

// Geographic utilities (haversine distance, polyline length)
pub mod geo;

// Distance-or-time sample filter
pub mod throttle;
pub use throttle::PointThrottle;

// Incremental route distance
pub mod distance;
pub use distance::DistanceAccumulator;

// Durable session/route/queue storage
pub mod store;
pub use store::{RestoredSession, SessionStore};

// Location provider seam
pub mod location;
pub use location::{LocationProvider, PermissionStatus, WatchOptions};

// Remote store client
pub mod remote;
pub use remote::{HttpRemoteStore, RemoteStore, SessionTotals};

// Reverse geocoding with retries and coordinate fallback
pub mod geocode;
pub use geocode::{GeocodeBackend, GeocodeResolver, HttpGeocoder, ResolvedAddress};

// Batched point uploads
pub mod uploader;
pub use uploader::BatchUploader;

// Lead capture (scoring, address resolution, persistence, enrichment)
pub mod capture;
pub use capture::{CaptureOutcome, CaptureRequest, LeadCaptureCoordinator};

// Session lifecycle state machine
pub mod controller;
pub use controller::{SessionController, SessionStats};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use field_capture::GeoPoint;
/// let point = GeoPoint::new(41.8781, -87.6298); // Chicago
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A raw location fix as delivered by the platform location provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters, if reported
    pub accuracy: Option<f64>,
    /// Altitude in meters, if reported
    pub altitude: Option<f64>,
    /// Heading in degrees from true north, if reported
    pub heading: Option<f64>,
    /// Ground speed in m/s, if reported
    pub speed: Option<f64>,
    /// Fix time as epoch milliseconds
    pub timestamp_ms: i64,
}

impl Position {
    /// Create a bare position with only coordinates and a timestamp.
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            altitude: None,
            heading: None,
            speed: None,
            timestamp_ms,
        }
    }

    pub fn geo_point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    pub fn is_valid(&self) -> bool {
        self.geo_point().is_valid()
    }
}

/// A kept GPS sample belonging to exactly one session.
///
/// Immutable once created; never updated, only uploaded. The sequence
/// number is unique per session and strictly increasing, and serves as
/// both the ordering key and the remote deduplication key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub session_id: String,
    pub sequence: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub captured_at_ms: i64,
}

impl RoutePoint {
    /// Build a route point from a raw position fix.
    pub fn from_position(session_id: &str, sequence: u32, pos: &Position) -> Self {
        Self {
            session_id: session_id.to_string(),
            sequence,
            latitude: pos.latitude,
            longitude: pos.longitude,
            accuracy: pos.accuracy,
            altitude: pos.altitude,
            heading: pos.heading,
            speed: pos.speed,
            captured_at_ms: pos.timestamp_ms,
        }
    }

    pub fn geo_point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Lifecycle status of a session. The single source of truth for whether
/// tracking is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "paused" => Some(SessionStatus::Paused),
            "completed" => Some(SessionStatus::Completed),
            "abandoned" => Some(SessionStatus::Abandoned),
            _ => None,
        }
    }

    /// Completed and abandoned sessions never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Abandoned)
    }
}

/// One capture outing from start to end/abandon.
///
/// Owned exclusively by the device that created it until it reaches a
/// terminal state and is handed to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub start_point: Option<GeoPoint>,
    pub end_point: Option<GeoPoint>,
    pub distance_miles: f64,
    pub duration_secs: i64,
    pub point_count: u32,
    pub lead_count: u32,
    pub status: SessionStatus,
}

impl Session {
    /// Create a fresh active session owned by `owner_id`.
    pub fn new(owner_id: &str, started_at_ms: i64, start_point: Option<GeoPoint>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            started_at_ms,
            ended_at_ms: None,
            start_point,
            end_point: None,
            distance_miles: 0.0,
            duration_secs: 0,
            point_count: 0,
            lead_count: 0,
            status: SessionStatus::Active,
        }
    }
}

/// Kind of media attached to an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Voice,
}

/// Reference to an already-uploaded media object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub storage_ref: String,
}

/// Triage priority assigned at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A user-captured point of interest (a property lead).
///
/// The quick-score and distress signals are computed once, at creation,
/// from the tag set; this engine never recomputes them. Downstream
/// enrichment may add authoritative scores later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    /// Owning session; captures can occur outside a session in some flows
    pub session_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<ResolvedAddress>,
    pub tags: Vec<String>,
    pub priority: Priority,
    pub notes: Option<String>,
    pub media: Vec<MediaRef>,
    /// Tag-weighted heuristic priority, 0..=100
    pub quick_score: u32,
    /// Tags that appear in the distress vocabulary
    pub distress_signals: Vec<String>,
    pub captured_at_ms: i64,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the distance-or-time point throttle.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// Keep a sample once it is at least this far from the last kept point.
    /// Default: 30.0 meters
    pub min_distance_meters: f64,

    /// Keep a sample once this much time has passed since the last kept
    /// point, regardless of distance. Default: 5000 ms
    pub min_interval_ms: i64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_distance_meters: 30.0,
            min_interval_ms: 5_000,
        }
    }
}

/// Configuration for batch uploads.
#[derive(Debug, Clone, Copy)]
pub struct UploadConfig {
    /// Maximum points submitted per flush. Default: 50
    pub batch_size: usize,

    /// Cadence of the periodic background flush. Default: 30s
    pub flush_interval: Duration,

    /// Bound on the single awaited flush at pause()/end(). Default: 10s
    pub flush_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_secs(30),
            flush_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for reverse geocoding.
#[derive(Debug, Clone, Copy)]
pub struct GeocodeConfig {
    /// Total attempts before falling back to coordinates. Default: 3
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles per attempt (1s, 2s).
    /// Default: 1s
    pub initial_backoff: Duration,

    /// Minimum formatted-address length to accept a result. Shorter or
    /// empty results count as failures for retry purposes. Default: 8
    pub min_address_len: usize,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            min_address_len: 8,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Owner/tenant id stamped on every session and observation.
    pub owner_id: String,

    pub throttle: ThrottleConfig,
    pub upload: UploadConfig,
    pub geocode: GeocodeConfig,

    /// Hints passed to the platform location watch.
    pub watch: WatchOptions,

    /// How long start() waits for a first fix before proceeding without
    /// one. Default: 10s
    pub start_fix_timeout: Duration,

    /// Timeout for on-demand position reads during capture. Default: 5s
    pub capture_fix_timeout: Duration,
}

impl EngineConfig {
    pub fn new(owner_id: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            throttle: ThrottleConfig::default(),
            upload: UploadConfig::default(),
            geocode: GeocodeConfig::default(),
            watch: WatchOptions::default(),
            start_fix_timeout: Duration::from_secs(10),
            capture_fix_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
