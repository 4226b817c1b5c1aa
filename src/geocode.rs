//! Reverse geocoding with bounded retries and a coordinate fallback.
//!
//! Geocoders fail often in the field: flaky connectivity, rate limits, and
//! rural coordinates that resolve to nothing. The resolver retries with
//! backoff and, when the budget is spent, degrades to the raw coordinates
//! formatted as the address. The fallback is marked with a typed flag so
//! downstream consumers can tell it apart from a real address without
//! string inspection, and can retry resolution later.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::GeocodeConfig;

/// Decimal places used when coordinates stand in for an address.
const FALLBACK_PRECISION: usize = 5;

/// A resolved (or fallen-back) address for a captured coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub formatted: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    /// True when `formatted` is raw coordinates, not a geocoded address.
    pub coordinate_fallback: bool,
}

impl ResolvedAddress {
    /// The deterministic fallback: coordinates at fixed precision.
    pub fn coordinate_fallback(latitude: f64, longitude: f64) -> Self {
        Self {
            formatted: format!(
                "{:.prec$}, {:.prec$}",
                latitude,
                longitude,
                prec = FALLBACK_PRECISION
            ),
            city: None,
            state: None,
            zip: None,
            coordinate_fallback: true,
        }
    }
}

/// Raw payload from a reverse-geocoding backend. An absent or near-empty
/// address is a retryable miss, not an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

/// The reverse-geocoding service consumed by the resolver.
#[async_trait]
pub trait GeocodeBackend: Send + Sync {
    async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Result<GeocodeResult>;
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves coordinates to a human address with bounded retries.
pub struct GeocodeResolver {
    backend: Arc<dyn GeocodeBackend>,
    config: GeocodeConfig,
}

impl GeocodeResolver {
    pub fn new(backend: Arc<dyn GeocodeBackend>, config: GeocodeConfig) -> Self {
        Self { backend, config }
    }

    /// Resolve coordinates to an address.
    ///
    /// Attempts the backend up to `max_attempts` times with doubling
    /// backoff between attempts. A result is accepted only if its
    /// formatted address meets the minimum length; otherwise it counts as
    /// a failed attempt. Total failure returns the coordinate fallback;
    /// this method never errors.
    pub async fn resolve(&self, latitude: f64, longitude: f64) -> ResolvedAddress {
        let mut backoff = self.config.initial_backoff;

        for attempt in 1..=self.config.max_attempts {
            match self.backend.reverse_geocode(latitude, longitude).await {
                Ok(result) => {
                    if let Some(address) = accept(&result, self.config.min_address_len) {
                        debug!(
                            "[GeocodeResolver] Resolved ({:.5}, {:.5}) on attempt {}",
                            latitude, longitude, attempt
                        );
                        return address;
                    }
                    debug!(
                        "[GeocodeResolver] Empty result for ({:.5}, {:.5}), attempt {}",
                        latitude, longitude, attempt
                    );
                }
                Err(e) => {
                    debug!(
                        "[GeocodeResolver] Backend error on attempt {}: {}",
                        attempt, e
                    );
                }
            }

            if attempt < self.config.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        warn!(
            "[GeocodeResolver] {}",
            CaptureError::GeocodeExhausted {
                attempts: self.config.max_attempts
            }
        );
        ResolvedAddress::coordinate_fallback(latitude, longitude)
    }
}

/// Accept a backend result only if it carries a non-trivial address.
fn accept(result: &GeocodeResult, min_len: usize) -> Option<ResolvedAddress> {
    let formatted = result.address.as_deref().unwrap_or("").trim();
    if formatted.len() < min_len {
        return None;
    }
    Some(ResolvedAddress {
        formatted: formatted.to_string(),
        city: result.city.clone(),
        state: result.state.clone(),
        zip: result.zip.clone(),
        coordinate_fallback: false,
    })
}

// ============================================================================
// HTTP Backend
// ============================================================================

/// reqwest-backed geocode backend (`GET {base}/reverse?lat=..&lng=..`).
pub struct HttpGeocoder {
    client: Client,
    base_url: String,
}

impl HttpGeocoder {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CaptureError::Remote {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeocodeBackend for HttpGeocoder {
    async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Result<GeocodeResult> {
        let resp = self
            .client
            .get(format!("{}/reverse", self.base_url))
            .query(&[("lat", latitude), ("lng", longitude)])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CaptureError::Remote {
                message: format!("geocoder returned HTTP {}", status),
            });
        }
        Ok(resp.json::<GeocodeResult>().await?)
    }
}

// ============================================================================
// Tests
// ============================================================================
