//! Remote store client.
//!
//! The remote authority owns finished sessions, uploaded points, and
//! observations. Point inserts are idempotent per (session id, sequence):
//! re-submitting an already-accepted point is a no-op on the server, so
//! at-least-once delivery never produces duplicates. The server also
//! enforces its own per-session point cap (10,000 by policy) and performs
//! its own deduplication; the client's queue uniqueness is not the only
//! safety net.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::{GeoPoint, MediaRef, Observation, RoutePoint, Session, SessionStatus};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-computed authoritative totals for a finalized session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionTotals {
    pub distance_miles: f64,
    pub duration_secs: i64,
    pub point_count: u32,
}

/// Everything the engine asks of the remote authority.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Register a session header; echoes the session id.
    async fn create_session(&self, session: &Session) -> Result<String>;

    /// Insert a batch of points; idempotent per (session id, sequence).
    /// Returns the number of newly inserted points (already-present points
    /// count as accepted, not as errors).
    async fn batch_insert_points(&self, session_id: &str, points: &[RoutePoint])
        -> Result<usize>;

    /// Ask the server to compute authoritative distance/duration/count
    /// from the points it received.
    async fn finalize_session(
        &self,
        session_id: &str,
        end_point: Option<GeoPoint>,
    ) -> Result<SessionTotals>;

    async fn update_session_status(&self, session_id: &str, status: SessionStatus)
        -> Result<()>;

    async fn create_observation(&self, observation: &Observation) -> Result<String>;

    async fn attach_media(&self, observation_id: &str, media: &MediaRef) -> Result<()>;

    /// Fire-and-forget enqueue of downstream enrichment.
    async fn enqueue_enrichment(&self, observation_id: &str) -> Result<()>;
}

// ============================================================================
// HTTP Implementation
// ============================================================================

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    inserted_count: usize,
}

#[derive(Debug, Serialize)]
struct BatchInsertBody<'a> {
    points: &'a [RoutePoint],
}

#[derive(Debug, Serialize)]
struct FinalizeBody {
    end_point: Option<GeoPoint>,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: SessionStatus,
}

/// reqwest-backed [`RemoteStore`] speaking JSON to the capture API.
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    auth_header: String,
}

impl HttpRemoteStore {
    /// Create a client against the given API base URL with a bearer token.
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .map_err(|e| CaptureError::Remote {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header: format!("Bearer {}", token),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<B: Serialize + Sync, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .client
            .post(self.url(path))
            .header("Authorization", &self.auth_header)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CaptureError::Remote {
                message: format!("{} returned HTTP {}", path, status),
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create_session(&self, session: &Session) -> Result<String> {
        let resp: IdResponse = self.post_json("/v1/sessions", session).await?;
        debug!("[RemoteStore] Registered session {}", resp.id);
        Ok(resp.id)
    }

    async fn batch_insert_points(
        &self,
        session_id: &str,
        points: &[RoutePoint],
    ) -> Result<usize> {
        let path = format!("/v1/sessions/{}/points", session_id);
        let resp = self
            .client
            .post(self.url(&path))
            .header("Authorization", &self.auth_header)
            .json(&BatchInsertBody { points })
            .send()
            .await
            .map_err(|e| CaptureError::UploadFailed {
                message: e.to_string(),
                status_code: None,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CaptureError::UploadFailed {
                message: format!("batch insert rejected for session {}", session_id),
                status_code: Some(status.as_u16()),
            });
        }

        let body: InsertResponse = resp.json().await.map_err(|e| CaptureError::UploadFailed {
            message: format!("unreadable insert response: {}", e),
            status_code: Some(status.as_u16()),
        })?;
        Ok(body.inserted_count)
    }

    async fn finalize_session(
        &self,
        session_id: &str,
        end_point: Option<GeoPoint>,
    ) -> Result<SessionTotals> {
        let path = format!("/v1/sessions/{}/finalize", session_id);
        self.post_json(&path, &FinalizeBody { end_point }).await
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<()> {
        let path = format!("/v1/sessions/{}/status", session_id);
        let _: serde_json::Value = self.post_json(&path, &StatusBody { status }).await?;
        Ok(())
    }

    async fn create_observation(&self, observation: &Observation) -> Result<String> {
        let resp: IdResponse = self.post_json("/v1/observations", observation).await?;
        Ok(resp.id)
    }

    async fn attach_media(&self, observation_id: &str, media: &MediaRef) -> Result<()> {
        let path = format!("/v1/observations/{}/media", observation_id);
        let _: serde_json::Value = self.post_json(&path, media).await?;
        Ok(())
    }

    async fn enqueue_enrichment(&self, observation_id: &str) -> Result<()> {
        let path = format!("/v1/observations/{}/enrichment", observation_id);
        let _: serde_json::Value = self.post_json(&path, &serde_json::json!({})).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let store = HttpRemoteStore::new("https://api.example.com/", "tok").unwrap();
        assert_eq!(
            store.url("/v1/sessions"),
            "https://api.example.com/v1/sessions"
        );
    }

    #[test]
    fn test_totals_serde() {
        let totals = SessionTotals {
            distance_miles: 1.25,
            duration_secs: 900,
            point_count: 42,
        };
        let json = serde_json::to_string(&totals).unwrap();
        let back: SessionTotals = serde_json::from_str(&json).unwrap();
        assert_eq!(back, totals);
    }
}
