//! Unified error handling for the field-capture engine.
//!
//! This module provides a consistent error type for all engine operations.
//! Non-essential steps (geocoding, media upload, enrichment enqueue) swallow
//! their failures and report them as flags on the result; only essential
//! failures (permission, persistence, illegal transitions) use these
//! variants to propagate.

use std::fmt;

/// Unified error type for field-capture operations.
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// Location permission was refused; a session cannot start
    PermissionDenied,
    /// Capture was attempted with no position source available
    NoLocationAvailable,
    /// A lifecycle operation was called from the wrong state
    InvalidTransition {
        action: &'static str,
        from: String,
    },
    /// A batch upload failed (transient; retried by the next periodic flush)
    UploadFailed {
        message: String,
        status_code: Option<u16>,
    },
    /// Reverse geocoding exhausted its retry budget
    GeocodeExhausted { attempts: u32 },
    /// Observation persistence itself failed
    CaptureFailed { message: String },
    /// Durable state was unreadable or malformed on restart
    RestoreCorrupted { message: String },
    /// Local storage error
    Persistence { message: String },
    /// Remote store error outside of batch uploads
    Remote { message: String },
    /// Generic internal error
    Internal { message: String },
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::PermissionDenied => {
                write!(f, "Location permission denied")
            }
            CaptureError::NoLocationAvailable => {
                write!(f, "No position source available")
            }
            CaptureError::InvalidTransition { action, from } => {
                write!(f, "Cannot {} from '{}' state", action, from)
            }
            CaptureError::UploadFailed {
                message,
                status_code,
            } => {
                if let Some(code) = status_code {
                    write!(f, "Upload failed ({}): {}", code, message)
                } else {
                    write!(f, "Upload failed: {}", message)
                }
            }
            CaptureError::GeocodeExhausted { attempts } => {
                write!(f, "Reverse geocoding failed after {} attempts", attempts)
            }
            CaptureError::CaptureFailed { message } => {
                write!(f, "Lead capture failed: {}", message)
            }
            CaptureError::RestoreCorrupted { message } => {
                write!(f, "Stored session is corrupted: {}", message)
            }
            CaptureError::Persistence { message } => {
                write!(f, "Persistence error: {}", message)
            }
            CaptureError::Remote { message } => {
                write!(f, "Remote store error: {}", message)
            }
            CaptureError::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<rusqlite::Error> for CaptureError {
    fn from(err: rusqlite::Error) -> Self {
        CaptureError::Persistence {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for CaptureError {
    fn from(err: reqwest::Error) -> Self {
        CaptureError::Remote {
            message: err.to_string(),
        }
    }
}

/// Result type alias for field-capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Extension trait for converting Option to CaptureError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a no-location error.
    fn ok_or_no_location(self) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_no_location(self) -> Result<T> {
        self.ok_or(CaptureError::NoLocationAvailable)
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| CaptureError::Internal {
            message: message.to_string(),
        })
    }
}
