//! # Session Controller
//!
//! The state machine exposed to the rest of the application: sessions go
//! from idle to active, alternate between active and paused, and finish
//! as completed or abandoned. Both final states are terminal.
//!
//! ## Concurrency
//!
//! The engine is single-instance per device but internally concurrent: the
//! location stream pushes samples on its own cadence, the periodic flush
//! timer ticks independently, and captures run on demand. All session
//! mutation goes through one `tokio::sync::Mutex` over [`TrackingState`];
//! the store itself sits behind a second lock shared with the uploader and
//! is always acquired after the state lock, never before it. Network round
//! trips (batch uploads, geocoding, observation writes) happen outside the
//! state lock so a sample arriving while a capture is in flight is still
//! throttled and queued.
//!
//! Uploads are fire-and-forget except at `pause()`/`end()`, where the
//! engine waits for one bounded flush attempt before proceeding.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::capture::{CaptureOutcome, CaptureRequest, LeadCaptureCoordinator};
use crate::distance::DistanceAccumulator;
use crate::error::{CaptureError, Result};
use crate::geocode::{GeocodeBackend, GeocodeResolver};
use crate::location::{LocationProvider, PermissionStatus};
use crate::remote::RemoteStore;
use crate::store::SessionStore;
use crate::throttle::PointThrottle;
use crate::uploader::{BatchUploader, SharedStore};
use crate::{
    EngineConfig, GeoPoint, Position, RoutePoint, Session, SessionStatus,
};

/// Live session counters for the UI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionStats {
    pub distance_miles: f64,
    pub duration_secs: i64,
    pub point_count: u32,
    pub lead_count: u32,
    pub pending_uploads: usize,
}

/// Mutable tracking state. Everything that a kept point, a status change,
/// or a capture touches lives here, behind one lock.
struct TrackingState {
    session: Option<Session>,
    throttle: PointThrottle,
    accumulator: DistanceAccumulator,
    next_sequence: u32,
    /// Most recent raw fix, kept or not; the capture fallback of last
    /// resort.
    last_fix: Option<Position>,
}

impl TrackingState {
    fn idle(config: &EngineConfig) -> Self {
        Self {
            session: None,
            throttle: PointThrottle::new(config.throttle),
            accumulator: DistanceAccumulator::new(),
            next_sequence: 1,
            last_fix: None,
        }
    }

    fn status_name(&self) -> String {
        match &self.session {
            Some(s) => s.status.as_str().to_string(),
            None => "idle".to_string(),
        }
    }
}

struct Inner {
    state: Mutex<TrackingState>,
    store: SharedStore,
    uploader: BatchUploader,
    remote: Arc<dyn RemoteStore>,
    provider: Arc<dyn LocationProvider>,
    config: EngineConfig,
}

#[derive(Default)]
struct Tasks {
    ingest: Option<JoinHandle<()>>,
    flush: Option<JoinHandle<()>>,
}

impl Tasks {
    fn stop_ingest(&mut self) {
        if let Some(handle) = self.ingest.take() {
            handle.abort();
        }
    }

    fn stop_all(&mut self) {
        self.stop_ingest();
        if let Some(handle) = self.flush.take() {
            handle.abort();
        }
    }
}

impl Drop for Tasks {
    fn drop(&mut self) {
        // A controller dropped without end()/abandon() must not leave its
        // ingest loop and flush timer running forever
        self.stop_all();
    }
}

/// Composes the throttle, store, uploader, geocoder, and capture
/// coordinator behind the five lifecycle operations.
pub struct SessionController {
    inner: Arc<Inner>,
    capture: LeadCaptureCoordinator,
    tasks: Mutex<Tasks>,
}

impl SessionController {
    /// Open the engine against a database path.
    pub fn open(
        db_path: &str,
        provider: Arc<dyn LocationProvider>,
        remote: Arc<dyn RemoteStore>,
        geocoder: Arc<dyn GeocodeBackend>,
        config: EngineConfig,
    ) -> Result<Self> {
        let store = SessionStore::new(db_path)?;
        Ok(Self::with_store(store, provider, remote, geocoder, config))
    }

    /// Build the engine around an existing store (tests use the in-memory
    /// store here).
    pub fn with_store(
        store: SessionStore,
        provider: Arc<dyn LocationProvider>,
        remote: Arc<dyn RemoteStore>,
        geocoder: Arc<dyn GeocodeBackend>,
        config: EngineConfig,
    ) -> Self {
        let store: SharedStore = Arc::new(Mutex::new(store));
        let uploader = BatchUploader::new(store.clone(), remote.clone(), config.upload);
        let resolver = GeocodeResolver::new(geocoder, config.geocode);
        let capture = LeadCaptureCoordinator::new(
            provider.clone(),
            remote.clone(),
            resolver,
            store.clone(),
            config.capture_fix_timeout,
        );

        let inner = Arc::new(Inner {
            state: Mutex::new(TrackingState::idle(&config)),
            store,
            uploader,
            remote,
            provider,
            config,
        });

        Self {
            inner,
            capture,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a new session. Only legal from idle.
    ///
    /// Waits up to `start_fix_timeout` for an initial fix and proceeds
    /// without one if the wait elapses; the first route point is recorded
    /// as soon as any position arrives on the stream.
    pub async fn start(&self) -> Result<Session> {
        if self.inner.provider.request_permission().await == PermissionStatus::Denied {
            return Err(CaptureError::PermissionDenied);
        }

        let mut state = self.inner.state.lock().await;
        if state.session.is_some() {
            return Err(CaptureError::InvalidTransition {
                action: "start",
                from: state.status_name(),
            });
        }

        let initial_fix = self
            .inner
            .provider
            .current_position(self.inner.config.start_fix_timeout)
            .await;

        let start_point = initial_fix.map(|p| p.geo_point());
        let session = Session::new(
            &self.inner.config.owner_id,
            chrono::Utc::now().timestamp_millis(),
            start_point,
        );

        self.inner.store.lock().await.create_session(&session)?;

        *state = TrackingState::idle(&self.inner.config);
        if let Some(point) = start_point {
            state.accumulator.seed(point);
        }
        state.last_fix = initial_fix;
        state.session = Some(session.clone());
        drop(state);

        // Registration is best-effort; the remote creates lazily on first
        // batch contact when the device starts offline
        if let Err(e) = self.inner.remote.create_session(&session).await {
            warn!("[SessionController] Remote registration deferred: {}", e);
        }

        let rx = self.inner.provider.watch(self.inner.config.watch).await;
        let mut tasks = self.tasks.lock().await;
        tasks.stop_all();
        tasks.ingest = Some(spawn_ingest(self.inner.clone(), rx));
        tasks.flush = Some(spawn_flush_timer(self.inner.clone(), session.id.clone()));
        drop(tasks);

        info!(
            "[SessionController] Started session {} (initial fix: {})",
            session.id,
            start_point.is_some()
        );
        Ok(session)
    }

    /// Pause tracking. Only legal from active.
    pub async fn pause(&self) -> Result<Session> {
        let mut state = self.inner.state.lock().await;
        match &state.session {
            Some(s) if s.status == SessionStatus::Active => {}
            _ => {
                return Err(CaptureError::InvalidTransition {
                    action: "pause",
                    from: state.status_name(),
                });
            }
        }

        self.tasks.lock().await.stop_ingest();
        self.inner.provider.stop_watch().await;

        let Some(session) = state.session.as_mut() else {
            return Err(CaptureError::Internal {
                message: "session vanished during pause".to_string(),
            });
        };
        let session_id = session.id.clone();
        self.bounded_flush(&session_id).await;

        session.status = SessionStatus::Paused;
        session.duration_secs =
            (chrono::Utc::now().timestamp_millis() - session.started_at_ms) / 1000;
        let snapshot = session.clone();
        self.inner.store.lock().await.update_session(&snapshot)?;

        info!("[SessionController] Paused session {}", session_id);
        Ok(snapshot)
    }

    /// Resume tracking. Only legal from paused.
    pub async fn resume(&self) -> Result<Session> {
        let mut state = self.inner.state.lock().await;
        let session = match state.session.as_mut() {
            Some(s) if s.status == SessionStatus::Paused => s,
            _ => {
                return Err(CaptureError::InvalidTransition {
                    action: "resume",
                    from: state.status_name(),
                });
            }
        };

        session.status = SessionStatus::Active;
        let snapshot = session.clone();
        self.inner.store.lock().await.update_session(&snapshot)?;
        drop(state);

        let rx = self.inner.provider.watch(self.inner.config.watch).await;
        let mut tasks = self.tasks.lock().await;
        tasks.stop_ingest();
        tasks.ingest = Some(spawn_ingest(self.inner.clone(), rx));
        drop(tasks);

        info!("[SessionController] Resumed session {}", snapshot.id);
        Ok(snapshot)
    }

    /// End the session and hand it to the remote store.
    ///
    /// Legal from active or paused; returns `Ok(None)` with no side
    /// effects when no session exists. Performs one bounded flush, asks
    /// the remote to finalize authoritative totals, falls back to
    /// client-computed values if that call fails, and clears all local
    /// durable state.
    pub async fn end(&self) -> Result<Option<Session>> {
        let mut state = self.inner.state.lock().await;
        let Some(mut session) = state.session.take() else {
            return Ok(None);
        };
        let session_id = session.id.clone();

        self.tasks.lock().await.stop_all();
        self.inner.provider.stop_watch().await;

        self.bounded_flush(&session_id).await;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let end_point = state
            .last_fix
            .map(|p| p.geo_point())
            .or_else(|| state.accumulator.last_point());

        session.ended_at_ms = Some(now_ms);
        session.end_point = end_point;
        session.status = SessionStatus::Completed;

        match self
            .inner
            .remote
            .finalize_session(&session_id, end_point)
            .await
        {
            Ok(totals) => {
                session.distance_miles = totals.distance_miles;
                session.duration_secs = totals.duration_secs;
                session.point_count = totals.point_count;
            }
            Err(e) => {
                warn!(
                    "[SessionController] Remote finalize failed, using client totals: {}",
                    e
                );
                session.distance_miles = state.accumulator.total_miles();
                session.duration_secs = (now_ms - session.started_at_ms) / 1000;
            }
        }

        self.inner.store.lock().await.clear(&session_id)?;
        *state = TrackingState::idle(&self.inner.config);

        info!(
            "[SessionController] Ended session {}: {:.3} mi, {} points",
            session_id, session.distance_miles, session.point_count
        );
        Ok(Some(session))
    }

    /// Abandon the session, discarding anything not yet uploaded.
    ///
    /// Safe to call even while a flush or capture is mid-flight: in-flight
    /// operations complete or fail silently, no new ones start, and local
    /// state is cleared regardless. A no-op when no session exists.
    pub async fn abandon(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let session_id = match &state.session {
            Some(s) => s.id.clone(),
            None => return Ok(()),
        };

        self.tasks.lock().await.stop_all();
        self.inner.provider.stop_watch().await;

        if let Err(e) = self
            .inner
            .remote
            .update_session_status(&session_id, SessionStatus::Abandoned)
            .await
        {
            warn!(
                "[SessionController] Could not mark {} abandoned remotely: {}",
                session_id, e
            );
        }

        self.inner.store.lock().await.clear(&session_id)?;
        *state = TrackingState::idle(&self.inner.config);

        info!("[SessionController] Abandoned session {}", session_id);
        Ok(())
    }

    // ========================================================================
    // Restore
    // ========================================================================

    /// Resume a persisted session after process restart.
    ///
    /// Corrupted durable state is logged, cleared, and treated as "no
    /// session to restore"; startup never fails here. A restored active
    /// session resumes streaming and the flush timer; a paused one waits
    /// for `resume()`.
    pub async fn restore(&self) -> Result<Option<Session>> {
        let restored = {
            let mut store = self.inner.store.lock().await;
            match store.restore() {
                Ok(found) => found,
                Err(CaptureError::RestoreCorrupted { message }) => {
                    warn!(
                        "[SessionController] Discarding corrupted session state: {}",
                        message
                    );
                    store.clear_all()?;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        };

        let Some(restored) = restored else {
            return Ok(None);
        };

        let mut state = self.inner.state.lock().await;
        if state.session.is_some() {
            return Err(CaptureError::InvalidTransition {
                action: "restore",
                from: state.status_name(),
            });
        }

        let mut session = restored.session;
        let points: Vec<GeoPoint> = restored.route.iter().map(|p| p.geo_point()).collect();

        // Distance is recomputed from the restored list, not trusted from
        // the stored header; the two must agree
        let accumulator = DistanceAccumulator::recompute(session.start_point, &points);
        session.distance_miles = accumulator.total_miles();
        session.point_count = restored.route.len() as u32;

        state.accumulator = accumulator;
        state.throttle = match restored.route.last() {
            Some(last) => PointThrottle::with_last_kept(
                self.inner.config.throttle,
                last.geo_point(),
                last.captured_at_ms,
            ),
            None => PointThrottle::new(self.inner.config.throttle),
        };
        state.next_sequence = restored.next_sequence;
        state.last_fix = restored.route.last().map(|p| Position {
            latitude: p.latitude,
            longitude: p.longitude,
            accuracy: p.accuracy,
            altitude: p.altitude,
            heading: p.heading,
            speed: p.speed,
            timestamp_ms: p.captured_at_ms,
        });
        state.session = Some(session.clone());
        drop(state);

        let mut tasks = self.tasks.lock().await;
        tasks.stop_all();
        if session.status == SessionStatus::Active {
            let rx = self.inner.provider.watch(self.inner.config.watch).await;
            tasks.ingest = Some(spawn_ingest(self.inner.clone(), rx));
        }
        tasks.flush = Some(spawn_flush_timer(self.inner.clone(), session.id.clone()));
        drop(tasks);

        info!(
            "[SessionController] Restored {} session {} ({} points, {} pending)",
            session.status.as_str(),
            session.id,
            restored.route.len(),
            restored.pending.len()
        );
        Ok(Some(session))
    }

    // ========================================================================
    // Capture
    // ========================================================================

    /// Capture a lead observation at the current position.
    pub async fn capture(&self, request: CaptureRequest) -> Result<CaptureOutcome> {
        let (session_id, tracked) = {
            let state = self.inner.state.lock().await;
            (state.session.as_ref().map(|s| s.id.clone()), state.last_fix)
        };

        let outcome = self
            .capture
            .capture(session_id.as_deref(), tracked, request)
            .await?;

        if let Some(id) = session_id {
            let mut state = self.inner.state.lock().await;
            if let Some(session) = state.session.as_mut() {
                if session.id == id {
                    session.lead_count += 1;
                }
            }
        }

        Ok(outcome)
    }

    // ========================================================================
    // Read Accessors
    // ========================================================================

    /// Snapshot of the current session, if one exists.
    pub async fn current_session(&self) -> Option<Session> {
        self.inner.state.lock().await.session.clone()
    }

    /// The full ordered route of the current session.
    pub async fn route(&self) -> Result<Vec<RoutePoint>> {
        let session_id = match self.current_session().await {
            Some(s) => s.id,
            None => return Ok(Vec::new()),
        };
        self.inner.store.lock().await.route(&session_id)
    }

    /// Live counters: distance, duration, points, leads, queue depth.
    pub async fn stats(&self) -> Result<Option<SessionStats>> {
        let state = self.inner.state.lock().await;
        let Some(session) = &state.session else {
            return Ok(None);
        };

        let duration_secs = match session.status {
            SessionStatus::Paused => session.duration_secs,
            _ => (chrono::Utc::now().timestamp_millis() - session.started_at_ms) / 1000,
        };
        let pending = self
            .inner
            .store
            .lock()
            .await
            .pending_count(&session.id)?;

        Ok(Some(SessionStats {
            distance_miles: session.distance_miles,
            duration_secs,
            point_count: session.point_count,
            lead_count: session.lead_count,
            pending_uploads: pending,
        }))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// One flush attempt bounded by `flush_timeout`. Failures and timeouts
    /// are logged; the pending queue keeps whatever was not confirmed.
    async fn bounded_flush(&self, session_id: &str) {
        let drain = self.inner.uploader.drain(session_id);
        match tokio::time::timeout(self.inner.config.upload.flush_timeout, drain).await {
            Ok(Ok(flushed)) => {
                if flushed > 0 {
                    info!(
                        "[SessionController] Lifecycle flush confirmed {} points",
                        flushed
                    );
                }
            }
            Ok(Err(e)) => warn!("[SessionController] Lifecycle flush failed: {}", e),
            Err(_) => warn!("[SessionController] Lifecycle flush timed out"),
        }
    }
}

/// Consume the location stream: throttle, accumulate, persist.
///
/// The watch subscription is created by the caller before spawning, so a
/// sample arriving immediately after a lifecycle call returns is never
/// dropped on the floor.
fn spawn_ingest(
    inner: Arc<Inner>,
    mut rx: tokio::sync::mpsc::Receiver<Position>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sample) = rx.recv().await {
            if let Err(e) = ingest_sample(&inner, sample).await {
                warn!("[SessionController] Failed to persist point: {}", e);
            }
        }
    })
}

async fn ingest_sample(inner: &Inner, sample: Position) -> Result<()> {
    let mut state = inner.state.lock().await;

    match &state.session {
        Some(s) if s.status == SessionStatus::Active => {}
        _ => return Ok(()),
    }

    state.last_fix = Some(sample);
    if !state.throttle.should_keep(&sample) {
        return Ok(());
    }

    // Stage the kept point and persist it before committing any in-memory
    // state: a failed write must not advance the sequence counter or the
    // distance total, or the live totals would disagree with the durable
    // route and a restore recompute
    let sequence = state.next_sequence;
    let mut accumulator = state.accumulator.clone();
    accumulator.add(sample.geo_point());

    let Some(session) = state.session.as_ref() else {
        return Ok(());
    };
    let mut snapshot = session.clone();
    snapshot.distance_miles = accumulator.total_miles();
    snapshot.point_count += 1;
    if snapshot.start_point.is_none() {
        // GPS came up after start(); the first kept point doubles as the
        // session's start coordinate
        snapshot.start_point = Some(sample.geo_point());
    }

    let point = RoutePoint::from_position(&snapshot.id, sequence, &sample);
    inner.store.lock().await.append_point(&point, &snapshot)?;

    // Durable; commit
    state.throttle.record_kept(&sample);
    state.next_sequence += 1;
    state.accumulator = accumulator;
    state.session = Some(snapshot);
    Ok(())
}

/// Periodic uploader: transient failures recover on the next tick.
fn spawn_flush_timer(inner: Arc<Inner>, session_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.upload.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            if let Err(e) = inner.uploader.flush(&session_id).await {
                warn!("[SessionController] Periodic flush failed: {}", e);
            }
        }
    })
}
