//! Lead capture.
//!
//! A capture is a synchronous user action, independent of the point
//! stream: resolve a position, geocode it, score the tags, persist the
//! observation, then best-effort attach media and enqueue enrichment.
//! The operation still produces a persisted observation even when the
//! non-essential later steps fail; only persistence failure aborts it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use once_cell::sync::Lazy;

use crate::error::{CaptureError, OptionExt, Result};
use crate::geocode::{GeocodeResolver, ResolvedAddress};
use crate::location::LocationProvider;
use crate::remote::RemoteStore;
use crate::uploader::SharedStore;
use crate::{GeoPoint, MediaRef, Observation, Position, Priority};

/// Score contribution for tags not in the distress vocabulary.
const DEFAULT_TAG_WEIGHT: u32 = 5;

/// Quick-scores are capped here; authoritative scoring happens downstream.
const SCORE_CAP: u32 = 100;

/// Per-tag distress weights. Tags present here are also the distress
/// vocabulary: any captured tag found in this table is surfaced as a
/// distress signal on the observation.
static DISTRESS_WEIGHTS: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    HashMap::from([
        ("vacant", 25),
        ("boarded", 30),
        ("condemned", 40),
        ("fire-damage", 35),
        ("collapsed-roof", 30),
        ("tarped-roof", 15),
        ("broken-windows", 20),
        ("overgrown", 10),
        ("mail-piled", 10),
        ("code-violation", 20),
        ("utilities-off", 15),
        ("squatters", 25),
    ])
});

/// Sum of per-tag weights, capped at 100. Unrecognized tags contribute the
/// default weight.
pub fn quick_score(tags: &[String]) -> u32 {
    let sum: u32 = tags
        .iter()
        .map(|tag| {
            DISTRESS_WEIGHTS
                .get(tag.as_str())
                .copied()
                .unwrap_or(DEFAULT_TAG_WEIGHT)
        })
        .sum();
    sum.min(SCORE_CAP)
}

/// The subset of tags present in the distress vocabulary, in input order.
pub fn distress_signals(tags: &[String]) -> Vec<String> {
    tags.iter()
        .filter(|tag| DISTRESS_WEIGHTS.contains_key(tag.as_str()))
        .cloned()
        .collect()
}

/// User input for one capture.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    /// Explicit coordinates override the position fallback chain.
    pub coordinates: Option<GeoPoint>,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub priority: Priority,
    pub media: Vec<MediaRef>,
}

/// What a successful capture produced. Non-fatal step failures show up
/// here as partial-success flags rather than errors.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub observation_id: String,
    /// Resolved address, or the coordinate fallback (check the flag).
    pub address: ResolvedAddress,
    pub media_attached: usize,
    pub media_failed: usize,
    pub enrichment_enqueued: bool,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Orchestrates observation creation: position, address, score,
/// persistence, media, enrichment.
pub struct LeadCaptureCoordinator {
    provider: Arc<dyn LocationProvider>,
    remote: Arc<dyn RemoteStore>,
    resolver: GeocodeResolver,
    store: SharedStore,
    fix_timeout: Duration,
}

impl LeadCaptureCoordinator {
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        remote: Arc<dyn RemoteStore>,
        resolver: GeocodeResolver,
        store: SharedStore,
        fix_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            remote,
            resolver,
            store,
            fix_timeout,
        }
    }

    /// Capture an observation at the current position.
    ///
    /// `tracked` is the engine's last kept tracking fix, used as the final
    /// position fallback. Fails with `NoLocationAvailable` when no source
    /// yields a position, and with `CaptureFailed` only when persistence
    /// itself fails.
    pub async fn capture(
        &self,
        session_id: Option<&str>,
        tracked: Option<Position>,
        request: CaptureRequest,
    ) -> Result<CaptureOutcome> {
        let point = self.resolve_position(&request, tracked).await?;

        // Step 1: address, degrading to the coordinate fallback
        let address = self.resolver.resolve(point.latitude, point.longitude).await;

        // Steps 2-3: derived once, at creation
        let score = quick_score(&request.tags);
        let signals = distress_signals(&request.tags);

        let observation = Observation {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.map(str::to_string),
            latitude: point.latitude,
            longitude: point.longitude,
            address: Some(address.clone()),
            tags: request.tags,
            priority: request.priority,
            notes: request.notes,
            media: request.media.clone(),
            quick_score: score,
            distress_signals: signals,
            captured_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        // Step 4: persistence is the one essential step
        let observation_id = self
            .remote
            .create_observation(&observation)
            .await
            .map_err(|e| CaptureError::CaptureFailed {
                message: e.to_string(),
            })?;

        if let Some(id) = session_id {
            let store = self.store.lock().await;
            if let Err(e) = store.increment_lead_count(id) {
                // The observation exists remotely; a stale local counter
                // is corrected by the authoritative finalize at end()
                warn!("[LeadCapture] Failed to bump lead count: {}", e);
            }
        }

        // Step 5: media attachment, non-fatal but surfaced
        let mut media_attached = 0;
        let mut media_failed = 0;
        for media in &request.media {
            match self.remote.attach_media(&observation_id, media).await {
                Ok(()) => media_attached += 1,
                Err(e) => {
                    warn!(
                        "[LeadCapture] Media attach failed for {}: {}",
                        observation_id, e
                    );
                    media_failed += 1;
                }
            }
        }

        // Step 6: enrichment enqueue, fire-and-forget
        let enrichment_enqueued = match self.remote.enqueue_enrichment(&observation_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "[LeadCapture] Enrichment enqueue failed for {}: {}",
                    observation_id, e
                );
                false
            }
        };

        info!(
            "[LeadCapture] Captured {} (score {}, {} signals, fallback: {})",
            observation_id,
            score,
            observation.distress_signals.len(),
            address.coordinate_fallback
        );

        Ok(CaptureOutcome {
            observation_id,
            address,
            media_attached,
            media_failed,
            enrichment_enqueued,
        })
    }

    /// Ordered position strategies: explicit coordinates, fresh fix,
    /// platform last-known, last tracked point.
    async fn resolve_position(
        &self,
        request: &CaptureRequest,
        tracked: Option<Position>,
    ) -> Result<GeoPoint> {
        if let Some(point) = request.coordinates {
            return Ok(point);
        }
        if let Some(pos) = self.provider.current_position(self.fix_timeout).await {
            return Ok(pos.geo_point());
        }
        if let Some(pos) = self.provider.last_known() {
            return Ok(pos.geo_point());
        }
        tracked.map(|pos| pos.geo_point()).ok_or_no_location()
    }
}

// ============================================================================
// Tests
// ============================================================================
