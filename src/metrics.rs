//! Derived activity metrics.
//!
//! [`MetricsEngine`] keeps running accumulators (distance, elevation gain,
//! max speed) that are advanced one sample at a time as the track grows.
//! Accumulation is strictly left-to-right over consecutive pairs, so the
//! running total is bit-for-bit equal to a full recomputation with
//! [`path_distance`](crate::geo_utils::path_distance).
//!
//! Time accounting is never accumulated: duration and paused time are always
//! derived from the session start, the pause intervals and a reference
//! instant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::seconds_between;
use crate::geo_utils::{haversine_distance, path_distance};
use crate::session::PauseInterval;
use crate::GeoSample;

/// Number of trailing samples used to smooth current speed.
pub const DEFAULT_SPEED_WINDOW: usize = 3;

/// Point-in-time view of a session's derived metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Active time: wall-clock elapsed minus paused time, never negative
    pub duration_seconds: f64,
    /// Total time spent in pause intervals
    pub paused_seconds: f64,
    /// Great-circle distance along the track
    pub distance_meters: f64,
    /// Seconds per kilometer; `None` until some distance has been covered
    pub average_pace_sec_per_km: Option<f64>,
    /// Speed over the trailing sample window
    pub current_speed_mps: f64,
    /// Highest current speed observed during the session
    pub max_speed_mps: f64,
    /// Sum of positive altitude deltas
    pub elevation_gain_meters: f64,
    /// Instant these metrics describe
    pub computed_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Metrics for a session with no samples and no elapsed time.
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            duration_seconds: 0.0,
            paused_seconds: 0.0,
            distance_meters: 0.0,
            average_pace_sec_per_km: None,
            current_speed_mps: 0.0,
            max_speed_mps: 0.0,
            elevation_gain_meters: 0.0,
            computed_at: at,
        }
    }

    /// Average moving speed in m/s (0 when no active time has elapsed).
    pub fn average_speed_mps(&self) -> f64 {
        if self.duration_seconds > 0.0 {
            self.distance_meters / self.duration_seconds
        } else {
            0.0
        }
    }

    /// Wall-clock time covered, active plus paused.
    pub fn elapsed_seconds(&self) -> f64 {
        self.duration_seconds + self.paused_seconds
    }
}

/// Active and paused time for a session at a reference instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeAccounting {
    pub duration_seconds: f64,
    pub paused_seconds: f64,
}

/// Split the time between `start` and `at` into active and paused time.
///
/// An open pause interval is measured up to `at`. Intervals are clipped to
/// `[start, at]`, and paused time never exceeds the elapsed time, so the
/// returned duration is always `>= 0`.
pub fn time_accounting(
    start: DateTime<Utc>,
    pauses: &[PauseInterval],
    at: DateTime<Utc>,
) -> TimeAccounting {
    let elapsed = seconds_between(start, at).max(0.0);

    let paused: f64 = pauses
        .iter()
        .map(|p| {
            let from = p.start_time.max(start);
            let to = p.end_time.unwrap_or(at).min(at);
            seconds_between(from, to).max(0.0)
        })
        .sum();
    let paused = paused.min(elapsed);

    TimeAccounting {
        duration_seconds: (elapsed - paused).max(0.0),
        paused_seconds: paused,
    }
}

/// Seconds per kilometer, `None` when no distance was covered.
pub fn average_pace(duration_seconds: f64, distance_meters: f64) -> Option<f64> {
    if distance_meters > 0.0 {
        Some(duration_seconds / (distance_meters / 1000.0))
    } else {
        None
    }
}

/// Speed over the last `window` samples of `samples`.
///
/// Returns 0 when fewer than two samples are available or the window spans
/// no time.
pub fn window_speed(samples: &[GeoSample], window: usize) -> f64 {
    let window = window.max(2);
    if samples.len() < 2 {
        return 0.0;
    }
    let tail = &samples[samples.len().saturating_sub(window)..];
    let (first, last) = (&tail[0], &tail[tail.len() - 1]);

    let elapsed = seconds_between(first.timestamp, last.timestamp);
    if elapsed <= 0.0 {
        return 0.0;
    }
    path_distance(tail) / elapsed
}

/// Positive altitude change between two consecutive samples.
///
/// A pair where either sample lacks altitude contributes 0.
pub fn elevation_delta(prev: &GeoSample, next: &GeoSample) -> f64 {
    match (prev.altitude, next.altitude) {
        (Some(a), Some(b)) if b > a => b - a,
        _ => 0.0,
    }
}

/// Incremental metrics calculator owned by a session.
#[derive(Debug, Clone)]
pub struct MetricsEngine {
    speed_window: usize,
    /// Number of samples already folded into the accumulators
    processed: usize,
    distance: f64,
    elevation_gain: f64,
    current_speed: f64,
    max_speed: f64,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }
}

impl MetricsEngine {
    /// Create an engine smoothing current speed over `speed_window` samples
    /// (at least 2).
    pub fn new(speed_window: usize) -> Self {
        Self {
            speed_window: speed_window.max(2),
            processed: 0,
            distance: 0.0,
            elevation_gain: 0.0,
            current_speed: 0.0,
            max_speed: 0.0,
        }
    }

    pub fn speed_window(&self) -> usize {
        self.speed_window
    }

    /// Drop all accumulated state.
    pub fn reset(&mut self) {
        *self = Self::new(self.speed_window);
    }

    /// Fold any samples not yet seen into the accumulators.
    ///
    /// `samples` must be the same append-only sequence on every call; a
    /// shorter sequence is treated as a new track and triggers a full rebuild.
    pub fn observe(&mut self, samples: &[GeoSample]) {
        if samples.len() < self.processed {
            self.reset();
        }

        for i in self.processed..samples.len() {
            if i > 0 {
                let (prev, next) = (&samples[i - 1], &samples[i]);
                self.distance += haversine_distance(prev, next);
                self.elevation_gain += elevation_delta(prev, next);
            }
            self.current_speed = window_speed(&samples[..=i], self.speed_window);
            self.max_speed = self.max_speed.max(self.current_speed);
        }

        self.processed = samples.len();
    }

    /// Incremental metrics at `at`.
    pub fn snapshot(
        &mut self,
        samples: &[GeoSample],
        start: DateTime<Utc>,
        pauses: &[PauseInterval],
        at: DateTime<Utc>,
    ) -> MetricsSnapshot {
        self.observe(samples);
        self.build(start, pauses, at)
    }

    /// Final metrics at `end`, recomputed from scratch over the whole track.
    pub fn finalize(
        &mut self,
        samples: &[GeoSample],
        start: DateTime<Utc>,
        pauses: &[PauseInterval],
        end: DateTime<Utc>,
    ) -> MetricsSnapshot {
        self.reset();
        self.observe(samples);
        self.build(start, pauses, end)
    }

    fn build(
        &self,
        start: DateTime<Utc>,
        pauses: &[PauseInterval],
        at: DateTime<Utc>,
    ) -> MetricsSnapshot {
        let time = time_accounting(start, pauses, at);

        MetricsSnapshot {
            duration_seconds: time.duration_seconds,
            paused_seconds: time.paused_seconds,
            distance_meters: self.distance,
            average_pace_sec_per_km: average_pace(time.duration_seconds, self.distance),
            current_speed_mps: self.current_speed,
            max_speed_mps: self.max_speed,
            elevation_gain_meters: self.elevation_gain,
            computed_at: at,
        }
    }
}
