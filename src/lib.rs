//! # Run Tracker
//!
//! Activity-tracking session core for a mobile running tracker.
//!
//! This library provides:
//! - A lifecycle state machine for recorded activities
//! - Live metrics (duration, distance, pace, speed, elevation gain) derived
//!   from an asynchronous stream of GPS samples
//! - Crash-recovery snapshots that never guess what happened while the app
//!   was not running
//! - Personal record and achievement classification of finished activities
//!
//! ## Features
//!
//! - **`persistence`** - SQLite-backed activity, record, achievement and
//!   snapshot stores
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{Duration, TimeZone, Utc};
//! use run_tracker::{ActivitySession, GeoSample};
//!
//! let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
//! let mut session = ActivitySession::new("morning-run", t0);
//! session.start(t0).unwrap();
//! session.activate(t0).unwrap();
//!
//! session.append_sample(GeoSample::new(51.5074, -0.1278, t0));
//! session.append_sample(GeoSample::new(51.5083, -0.1278, t0 + Duration::seconds(30)));
//!
//! session.stop(t0 + Duration::seconds(30)).unwrap();
//! session.complete(t0 + Duration::seconds(30)).unwrap();
//!
//! let summary = session.summary().unwrap();
//! println!("{:.0}m in {:.0}s", summary.metrics.distance_meters, summary.metrics.duration_seconds);
//! ```

use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{
    LocationError, OptionExt, PersistenceError, PersistenceResult, Result, TrackerError,
};

// Injected time source
pub mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

// Geographic utilities (haversine distance, bounds)
pub mod geo_utils;

// Lifecycle state machine
pub mod state;
pub use state::{transition, SessionEvent, SessionState};

// Incremental metrics
pub mod metrics;
pub use metrics::{MetricsEngine, MetricsSnapshot, DEFAULT_SPEED_WINDOW};

// Session aggregate
pub mod session;
pub use session::{
    ActivityPatch, ActivitySession, ActivitySummary, AppendOutcome, DropReason, PauseInterval,
};

// Crash-recovery snapshots
pub mod snapshot;
pub use snapshot::{RecoveredSession, SessionSnapshot, SNAPSHOT_VERSION};

// Personal record analysis
pub mod records;
pub use records::{PersonalRecord, RecordAnalyzer, RecordCategory, RecordImprovement, RecordOrdering};

// Achievement detection
pub mod achievements;
pub use achievements::{
    Achievement, AchievementCriteria, AchievementDetector, AchievementRule, AchievementType,
};

// Storage collaborator contracts and in-memory implementations
pub mod store;
pub use store::{ActivityRepository, AchievementRepository, RecordRepository, SnapshotStore};

// Geolocation collaborator contract
pub mod location;
pub use location::{LocationSource, LocationUpdate, SimulatedLocationSource};

// Single-owner async driver
pub mod controller;
pub use controller::{TrackerEvent, TrackingController, TrackingDeps};

// Post-activity classification (records + achievements)
pub mod classification;
pub use classification::{ActivityClassifier, Classification};

// SQLite stores
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

// ============================================================================
// Core Types
// ============================================================================

/// A single geolocation observation.
///
/// # Example
/// ```
/// use chrono::Utc;
/// use run_tracker::GeoSample;
///
/// let sample = GeoSample::new(51.5074, -0.1278, Utc::now())
///     .with_altitude(35.0)
///     .with_accuracy(4.0);
/// assert!(sample.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above sea level
    pub altitude: Option<f64>,
    /// Horizontal accuracy radius in meters
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl GeoSample {
    /// Create a new sample without altitude or accuracy.
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            accuracy: None,
            timestamp,
        }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// Check if the sample has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
            && self.altitude.map_or(true, f64::is_finite)
    }
}

/// Bounding box of a track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from samples.
    pub fn from_samples(samples: &[GeoSample]) -> Option<Self> {
        geo_utils::track_bounds(samples)
    }

    /// Get the center of the bounds as `(lat, lng)`.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

/// Configuration for tracking sessions.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Number of trailing samples used for current speed.
    /// Default: 3 (suppresses single-sample GPS jitter)
    pub speed_window: usize,

    /// How often live metrics are recomputed while recording.
    /// Default: 1 second
    pub metrics_refresh_interval: Duration,

    /// How often a crash-recovery snapshot is written.
    /// Default: 30 seconds
    pub autosave_interval: Duration,

    /// How long to wait for the first sample before reporting an acquisition timeout.
    /// Default: 30 seconds
    pub acquisition_timeout: Duration,

    /// Samples reporting a horizontal accuracy worse than this are dropped.
    /// Default: 50.0 meters. `None` accepts everything.
    pub max_accuracy_meters: Option<f64>,

    /// Offset from UTC used to decide calendar days (streaks, monthly totals).
    /// Default: 0
    pub utc_offset_seconds: i32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            speed_window: DEFAULT_SPEED_WINDOW,
            metrics_refresh_interval: Duration::from_secs(1),
            autosave_interval: Duration::from_secs(30),
            acquisition_timeout: Duration::from_secs(30),
            max_accuracy_meters: Some(50.0),
            utc_offset_seconds: 0,
        }
    }
}

impl TrackerConfig {
    /// Check that every setting is usable.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| {
            Err(TrackerError::ConfigError {
                message: message.to_string(),
            })
        };

        if self.speed_window < 2 {
            return fail("speed_window must be at least 2");
        }
        if self.metrics_refresh_interval.is_zero() {
            return fail("metrics_refresh_interval must be positive");
        }
        if self.autosave_interval.is_zero() {
            return fail("autosave_interval must be positive");
        }
        if self.acquisition_timeout.is_zero() {
            return fail("acquisition_timeout must be positive");
        }
        if let Some(acc) = self.max_accuracy_meters {
            if !(acc.is_finite() && acc > 0.0) {
                return fail("max_accuracy_meters must be a positive number");
            }
        }
        if self.utc_offset().is_none() {
            return fail("utc_offset_seconds must be within +/- 24h");
        }
        Ok(())
    }

    /// Timezone used for calendar-day calculations.
    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_seconds)
    }
}
