//! The activity session aggregate.
//!
//! An [`ActivitySession`] owns its sample track and pause log. Both are
//! append-only and only change through the transition methods and
//! [`ActivitySession::append_sample`]. Every transition is validated by
//! [`transition`](crate::state::transition) before anything is written, so a
//! rejected call leaves the session exactly as it was.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metrics::{MetricsEngine, MetricsSnapshot};
use crate::state::{transition, SessionEvent, SessionState};
use crate::{Bounds, GeoSample};

/// A time range excluded from active duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseInterval {
    pub start_time: DateTime<Utc>,
    /// `None` while the pause is still running
    pub end_time: Option<DateTime<Utc>>,
}

impl PauseInterval {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Why an incoming sample was not appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Session is not `ACTIVE`; late or early GPS delivery
    NotRecording(SessionState),
    /// Timestamp precedes the last appended sample
    OutOfOrder,
    /// Coordinates are not finite or out of range
    InvalidCoordinates,
}

/// Result of offering a sample to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    Dropped(DropReason),
}

impl AppendOutcome {
    pub fn is_appended(self) -> bool {
        self == AppendOutcome::Appended
    }
}

/// Caller-editable metadata of a stored activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityPatch {
    pub name: Option<String>,
    pub notes: Option<String>,
}

/// Finalized, immutable hand-off record of a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
    pub sample_count: usize,
    pub bounds: Option<Bounds>,
}

/// A tracked activity from creation to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySession {
    id: String,
    state: SessionState,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    samples: Vec<GeoSample>,
    pause_intervals: Vec<PauseInterval>,
    metrics: MetricsSnapshot,
    created_at: DateTime<Utc>,
    last_persisted_at: Option<DateTime<Utc>>,
    name: Option<String>,
    notes: Option<String>,
    // Rebuilt from `samples` on first use after deserialization
    #[serde(skip)]
    engine: MetricsEngine,
}

impl ActivitySession {
    /// Create an `IDLE` session.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::with_engine(id, now, MetricsEngine::default())
    }

    /// Create an `IDLE` session with a custom speed smoothing window.
    pub fn with_speed_window(id: impl Into<String>, now: DateTime<Utc>, window: usize) -> Self {
        Self::with_engine(id, now, MetricsEngine::new(window))
    }

    fn with_engine(id: impl Into<String>, now: DateTime<Utc>, engine: MetricsEngine) -> Self {
        Self {
            id: id.into(),
            state: SessionState::Idle,
            start_time: now,
            end_time: None,
            samples: Vec::new(),
            pause_intervals: Vec::new(),
            metrics: MetricsSnapshot::empty(now),
            created_at: now,
            last_persisted_at: None,
            name: None,
            notes: None,
            engine,
        }
    }

    /// Rebuild a session from recovered parts. The caller has validated them.
    pub(crate) fn from_recovered(
        id: String,
        state: SessionState,
        start_time: DateTime<Utc>,
        samples: Vec<GeoSample>,
        pause_intervals: Vec<PauseInterval>,
        created_at: DateTime<Utc>,
        saved_at: DateTime<Utc>,
    ) -> Self {
        let mut session = Self {
            id,
            state,
            start_time,
            end_time: None,
            samples,
            pause_intervals,
            metrics: MetricsSnapshot::empty(saved_at),
            created_at,
            last_persisted_at: Some(saved_at),
            name: None,
            notes: None,
            engine: MetricsEngine::default(),
        };
        session.recompute(saved_at);
        session
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn samples(&self) -> &[GeoSample] {
        &self.samples
    }

    pub fn pause_intervals(&self) -> &[PauseInterval] {
        &self.pause_intervals
    }

    /// Most recently computed metrics.
    pub fn metrics(&self) -> &MetricsSnapshot {
        &self.metrics
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_persisted_at(&self) -> Option<DateTime<Utc>> {
        self.last_persisted_at
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    /// The currently open pause interval, if any.
    pub fn open_pause(&self) -> Option<&PauseInterval> {
        self.pause_intervals.last().filter(|p| p.is_open())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Samples used to smooth current speed.
    pub fn speed_window(&self) -> usize {
        self.engine.speed_window()
    }

    /// Switch the speed smoothing window, rebuilding metrics over every
    /// recorded sample. Final metrics of a terminal session are left as is.
    pub fn set_speed_window(&mut self, window: usize) {
        if self.engine.speed_window() == window.max(2) {
            return;
        }
        self.engine = MetricsEngine::new(window);
        if !self.is_terminal() {
            let at = self.metrics.computed_at;
            self.recompute(at);
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// `IDLE → STARTING`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        let next = self.check(SessionEvent::Start)?;
        self.start_time = now;
        self.enter(next);
        Ok(())
    }

    /// `STARTING → ACTIVE`. Refreshes the start time and recomputes metrics.
    pub fn activate(&mut self, now: DateTime<Utc>) -> Result<()> {
        let next = self.check(SessionEvent::Activate)?;
        self.start_time = now;
        self.enter(next);
        self.recompute(now);
        Ok(())
    }

    /// `ACTIVE → PAUSED`. Opens a pause interval at `now`.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        let next = self.check(SessionEvent::Pause)?;
        let at = self.monotonic(now);
        self.pause_intervals.push(PauseInterval {
            start_time: at,
            end_time: None,
        });
        self.enter(next);
        self.recompute(at);
        Ok(())
    }

    /// `PAUSED → ACTIVE`. Closes the open pause interval at `now`.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        let next = self.check(SessionEvent::Resume)?;
        let at = self.monotonic(now);
        self.close_open_pause(at);
        self.enter(next);
        self.recompute(at);
        Ok(())
    }

    /// `ACTIVE|PAUSED → STOPPING`. A running pause is closed at `now`.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Result<()> {
        let next = self.check(SessionEvent::Stop)?;
        let at = self.monotonic(now);
        self.close_open_pause(at);
        self.enter(next);
        self.recompute(at);
        Ok(())
    }

    /// `STOPPING → COMPLETED`. Sets the end time and freezes final metrics.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        let next = self.check(SessionEvent::Complete)?;
        let end = self.end_instant(now);
        self.end_time = Some(end);
        self.metrics =
            self.engine
                .finalize(&self.samples, self.start_time, &self.pause_intervals, end);
        self.enter(next);
        info!(
            "[Session] {} completed: {:.0}m in {:.0}s ({} samples)",
            self.id,
            self.metrics.distance_meters,
            self.metrics.duration_seconds,
            self.samples.len()
        );
        Ok(())
    }

    /// `STARTING|STOPPING → CANCELLED`. Sets the end time.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        let next = self.check(SessionEvent::Cancel)?;
        let end = self.end_instant(now);
        self.close_open_pause(end);
        self.end_time = Some(end);
        self.recompute(end);
        self.enter(next);
        Ok(())
    }

    /// Validate `event` against the edge table without side effects.
    fn check(&self, event: SessionEvent) -> Result<SessionState> {
        transition(self.state, event).map_err(|e| {
            warn!("[Session] {} rejected: {}", self.id, e);
            e
        })
    }

    fn enter(&mut self, next: SessionState) {
        debug!("[Session] {}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    /// Clamp `now` so recorded boundaries never run backwards.
    fn monotonic(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let latest_pause = self
            .pause_intervals
            .last()
            .map(|p| p.end_time.unwrap_or(p.start_time));
        match latest_pause {
            Some(boundary) => now.max(boundary).max(self.start_time),
            None => now.max(self.start_time),
        }
    }

    /// End instant strictly after the start time.
    fn end_instant(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = self.monotonic(now);
        if at > self.start_time {
            at
        } else {
            self.start_time + Duration::milliseconds(1)
        }
    }

    fn close_open_pause(&mut self, at: DateTime<Utc>) {
        if let Some(pause) = self.pause_intervals.last_mut().filter(|p| p.is_open()) {
            pause.end_time = Some(at);
        }
    }

    fn recompute(&mut self, at: DateTime<Utc>) {
        self.metrics = self
            .engine
            .snapshot(&self.samples, self.start_time, &self.pause_intervals, at);
    }

    // ========================================================================
    // Samples and metrics
    // ========================================================================

    /// Offer a sample to the session.
    ///
    /// Accepted only while `ACTIVE`. Samples in any other state, samples
    /// older than the last appended one, and invalid coordinates are dropped
    /// without error.
    pub fn append_sample(&mut self, sample: GeoSample) -> AppendOutcome {
        if self.state != SessionState::Active {
            debug!(
                "[Session] {} dropped sample while {}",
                self.id, self.state
            );
            return AppendOutcome::Dropped(DropReason::NotRecording(self.state));
        }
        if !sample.is_valid() {
            debug!("[Session] {} dropped invalid sample {:?}", self.id, sample);
            return AppendOutcome::Dropped(DropReason::InvalidCoordinates);
        }
        if let Some(last) = self.samples.last() {
            if sample.timestamp < last.timestamp {
                debug!(
                    "[Session] {} dropped out-of-order sample at {}",
                    self.id, sample.timestamp
                );
                return AppendOutcome::Dropped(DropReason::OutOfOrder);
            }
        }

        let at = sample.timestamp.max(self.metrics.computed_at);
        self.samples.push(sample);
        self.recompute(at);
        AppendOutcome::Appended
    }

    /// Recompute live metrics at `now`. Terminal sessions keep their frozen
    /// metrics.
    pub fn refresh_metrics(&mut self, now: DateTime<Utc>) -> &MetricsSnapshot {
        if !self.state.is_terminal() {
            let at = self.monotonic(now);
            self.recompute(at);
        }
        &self.metrics
    }

    /// Record a successful snapshot save. Ignored once terminal.
    pub fn mark_persisted(&mut self, at: DateTime<Utc>) {
        if !self.state.is_terminal() {
            self.last_persisted_at = Some(at);
        }
    }

    /// Apply caller-edited metadata. Tracking data is never touched.
    pub fn apply_patch(&mut self, patch: &ActivityPatch) {
        if let Some(name) = &patch.name {
            self.name = Some(name.clone());
        }
        if let Some(notes) = &patch.notes {
            self.notes = Some(notes.clone());
        }
    }

    /// Hand-off record, available once the session is `COMPLETED`.
    pub fn summary(&self) -> Option<ActivitySummary> {
        if self.state != SessionState::Completed {
            return None;
        }
        Some(ActivitySummary {
            session_id: self.id.clone(),
            started_at: self.start_time,
            ended_at: self.end_time?,
            metrics: self.metrics,
            sample_count: self.samples.len(),
            bounds: Bounds::from_samples(&self.samples),
        })
    }
}
