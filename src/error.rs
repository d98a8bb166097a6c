//! Unified error handling for the run-tracker library.
//!
//! Errors fall into three families:
//! - **Protocol errors** (illegal transitions, corrupt snapshots) are rejected
//!   synchronously and never retried.
//! - **Acquisition errors** ([`LocationError`]) describe GPS trouble. They are
//!   surfaced as degraded status and never abort a running session.
//! - **Persistence errors** ([`PersistenceError`]) come from storage
//!   collaborators and are retryable by the caller.

use thiserror::Error;

use crate::state::{SessionEvent, SessionState};

/// Unified error type for run-tracker operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    /// The requested lifecycle edge is not in the legal transition set
    #[error("Invalid state transition: cannot {event} a session that is {from}")]
    InvalidStateTransition {
        from: SessionState,
        event: SessionEvent,
    },
    /// A stored snapshot could not be reconstructed
    #[error("Corrupt snapshot: {reason}")]
    CorruptSnapshot { reason: String },
    /// Geolocation collaborator failure
    #[error("Location error: {0}")]
    Location(#[from] LocationError),
    /// Storage collaborator failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    /// No samples arrived within the acquisition window
    #[error("No location fix within {seconds}s")]
    AcquisitionTimeout { seconds: u64 },
    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },
    /// The tracking controller task has shut down
    #[error("Tracking controller is no longer running")]
    ControllerClosed,
}

impl TrackerError {
    /// Build a corrupt snapshot error from any message.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        TrackerError::CorruptSnapshot {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrackerError::Location(_) | TrackerError::Persistence(_) | TrackerError::AcquisitionTimeout { .. }
        )
    }
}

/// Failures reported by a location source.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location services are disabled")]
    ServiceDisabled,
    #[error("GPS signal lost")]
    SignalLost,
    #[error("location request timed out")]
    Timeout,
    #[error("location accuracy too low ({accuracy:.0}m)")]
    AccuracyTooLow { accuracy: f64 },
    #[error("invalid location: {0}")]
    InvalidLocation(String),
    #[error("location service unavailable")]
    ServiceUnavailable,
    #[error("unknown location error: {0}")]
    Unknown(String),
}

impl LocationError {
    /// Errors after which the source will not deliver samples without user action.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LocationError::PermissionDenied | LocationError::ServiceDisabled
        )
    }
}

/// Failures reported by a storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("save failed: {0}")]
    SaveFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("delete failed: {0}")]
    DeleteFailed(String),
    #[error("query failed: {0}")]
    QueryFailed(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

/// Result type alias for run-tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Result type alias for storage collaborators.
pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

/// Extension trait for converting Option to TrackerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a corrupt snapshot error naming the missing field.
    fn ok_or_missing(self, field: &str) -> Result<T>;

    /// Convert Option to Result with a not-found persistence error.
    fn ok_or_not_found(self, id: &str) -> PersistenceResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_missing(self, field: &str) -> Result<T> {
        self.ok_or_else(|| TrackerError::CorruptSnapshot {
            reason: format!("missing required field '{}'", field),
        })
    }

    fn ok_or_not_found(self, id: &str) -> PersistenceResult<T> {
        self.ok_or_else(|| PersistenceError::NotFound(id.to_string()))
    }
}
