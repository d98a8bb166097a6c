//! Crash-recovery snapshots of an in-flight session.
//!
//! A snapshot is a JSON document with every instant written as an RFC 3339
//! string:
//!
//! ```json
//! {
//!   "version": 1,
//!   "sessionId": "run-42",
//!   "state": "PAUSED",
//!   "startTime": "2024-05-01T07:00:00Z",
//!   "pausedSeconds": 95.0,
//!   "openPauseStart": "2024-05-01T07:31:10Z",
//!   "pauseIntervals": [{ "startTime": "...", "endTime": "..." }],
//!   "samples": [{ "latitude": 47.0, "longitude": 8.0, "timestamp": "..." }],
//!   "createdAt": "2024-05-01T06:59:58Z",
//!   "savedAt": "2024-05-01T07:32:00Z"
//! }
//! ```
//!
//! `pausedSeconds` is the paused time as of `savedAt`, open pause included.
//!
//! Restoring rebuilds the session and its metrics as they were at `savedAt`.
//! The time between `savedAt` and the relaunch is reported, never applied:
//! [`RecoveredSession`] lets the caller decide whether to continue, fold the
//! gap into a pause, finalize, or discard.

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::seconds_between;
use crate::error::{OptionExt, PersistenceError, Result, TrackerError};
use crate::metrics::MetricsSnapshot;
use crate::session::{ActivitySession, PauseInterval};
use crate::state::SessionState;
use crate::GeoSample;

/// Current snapshot document version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Allowed disagreement between `pausedSeconds` and the pause log.
const PAUSE_TOLERANCE_SECONDS: f64 = 1.0;

/// A sample as stored in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub timestamp: String,
}

/// A closed pause interval as stored in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPause {
    pub start_time: String,
    pub end_time: String,
}

/// Storable form of an in-flight session.
///
/// Required fields are modelled as `Option` so a missing field is reported
/// by name instead of as a generic parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub version: Option<u32>,
    pub session_id: Option<String>,
    pub state: Option<String>,
    pub start_time: Option<String>,
    pub paused_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_pause_start: Option<String>,
    #[serde(default)]
    pub pause_intervals: Vec<SnapshotPause>,
    pub samples: Option<Vec<SnapshotSample>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    pub saved_at: Option<String>,
}

fn format_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_instant(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TrackerError::corrupt(format!("unparsable {} '{}': {}", field, value, e)))
}

impl SessionSnapshot {
    /// Capture an in-flight session as of `saved_at`.
    ///
    /// Returns `None` for terminal sessions, which are handed to activity
    /// persistence instead.
    pub fn capture(session: &ActivitySession, saved_at: DateTime<Utc>) -> Option<Self> {
        if session.is_terminal() {
            return None;
        }

        let saved_at = saved_at.max(session.start_time());
        let paused = crate::metrics::time_accounting(
            session.start_time(),
            session.pause_intervals(),
            saved_at,
        )
        .paused_seconds;

        let pause_intervals = session
            .pause_intervals()
            .iter()
            .filter_map(|p| {
                p.end_time.map(|end| SnapshotPause {
                    start_time: format_instant(p.start_time),
                    end_time: format_instant(end),
                })
            })
            .collect();

        let samples = session
            .samples()
            .iter()
            .map(|s| SnapshotSample {
                latitude: s.latitude,
                longitude: s.longitude,
                altitude: s.altitude,
                accuracy: s.accuracy,
                timestamp: format_instant(s.timestamp),
            })
            .collect();

        Some(Self {
            version: Some(SNAPSHOT_VERSION),
            session_id: Some(session.id().to_string()),
            state: Some(session.state().as_str().to_string()),
            start_time: Some(format_instant(session.start_time())),
            paused_seconds: Some(paused),
            open_pause_start: session.open_pause().map(|p| format_instant(p.start_time)),
            pause_intervals,
            samples: Some(samples),
            created_at: Some(format_instant(session.created_at())),
            saved_at: Some(format_instant(saved_at)),
        })
    }

    /// Serialize to the storable JSON form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| PersistenceError::SaveFailed(format!("snapshot encoding: {}", e)).into())
    }

    /// Parse a stored JSON document. Malformed JSON is a corrupt snapshot.
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| TrackerError::corrupt(format!("malformed snapshot document: {}", e)))
    }

    /// Validate the document and rebuild the session it describes.
    ///
    /// All validation happens before the session is constructed, so a
    /// corrupt snapshot never yields a partial session.
    pub fn restore(&self) -> Result<RecoveredSession> {
        if let Some(version) = self.version {
            if version > SNAPSHOT_VERSION {
                return Err(TrackerError::corrupt(format!(
                    "unsupported snapshot version {}",
                    version
                )));
            }
        }

        let session_id = self.session_id.clone().ok_or_missing("sessionId")?;
        if session_id.trim().is_empty() {
            return Err(TrackerError::corrupt("empty sessionId"));
        }

        let state: SessionState = self.state.as_deref().ok_or_missing("state")?.parse()?;
        if state.is_terminal() {
            return Err(TrackerError::corrupt(format!(
                "snapshot of a {} session",
                state
            )));
        }

        let start_time = parse_instant(self.start_time.as_deref().ok_or_missing("startTime")?, "startTime")?;
        let saved_at = parse_instant(self.saved_at.as_deref().ok_or_missing("savedAt")?, "savedAt")?;
        let created_at = match &self.created_at {
            Some(value) => parse_instant(value, "createdAt")?,
            None => start_time,
        };
        if saved_at < start_time {
            return Err(TrackerError::corrupt("savedAt precedes startTime"));
        }

        let paused_seconds = self.paused_seconds.ok_or_missing("pausedSeconds")?;
        if !paused_seconds.is_finite() || paused_seconds < 0.0 {
            return Err(TrackerError::corrupt(format!(
                "invalid pausedSeconds {}",
                paused_seconds
            )));
        }
        let elapsed = seconds_between(start_time, saved_at);
        if paused_seconds > elapsed + PAUSE_TOLERANCE_SECONDS {
            return Err(TrackerError::corrupt(format!(
                "pausedSeconds {} exceeds elapsed time {:.1}s",
                paused_seconds, elapsed
            )));
        }

        let samples = self.restore_samples(start_time, saved_at)?;
        let pause_intervals = self.restore_pauses(state, start_time, saved_at, paused_seconds)?;

        info!(
            "[Snapshot] Restored {} ({}, {} samples, saved {})",
            session_id,
            state,
            samples.len(),
            saved_at
        );

        let session = ActivitySession::from_recovered(
            session_id,
            state,
            start_time,
            samples,
            pause_intervals,
            created_at,
            saved_at,
        );
        Ok(RecoveredSession { session, saved_at })
    }

    fn restore_samples(
        &self,
        start_time: DateTime<Utc>,
        saved_at: DateTime<Utc>,
    ) -> Result<Vec<GeoSample>> {
        let raw = self.samples.as_ref().ok_or_missing("samples")?;
        let mut samples = Vec::with_capacity(raw.len());

        for (i, s) in raw.iter().enumerate() {
            let sample = GeoSample {
                latitude: s.latitude,
                longitude: s.longitude,
                altitude: s.altitude,
                accuracy: s.accuracy,
                timestamp: parse_instant(&s.timestamp, "sample timestamp")?,
            };
            if !sample.is_valid() {
                return Err(TrackerError::corrupt(format!("sample {} has invalid coordinates", i)));
            }
            if let Some(prev) = samples.last() {
                let prev: &GeoSample = prev;
                if sample.timestamp < prev.timestamp {
                    return Err(TrackerError::corrupt(format!("sample {} is out of order", i)));
                }
            }
            if sample.timestamp > saved_at {
                return Err(TrackerError::corrupt(format!("sample {} is later than savedAt", i)));
            }
            samples.push(sample);
        }

        if samples.first().is_some_and(|s| s.timestamp < start_time) {
            warn!("[Snapshot] First sample precedes startTime; keeping it");
        }
        Ok(samples)
    }

    fn restore_pauses(
        &self,
        state: SessionState,
        start_time: DateTime<Utc>,
        saved_at: DateTime<Utc>,
        paused_seconds: f64,
    ) -> Result<Vec<PauseInterval>> {
        let open_start = self
            .open_pause_start
            .as_deref()
            .map(|v| parse_instant(v, "openPauseStart"))
            .transpose()?;

        match (state, open_start) {
            (SessionState::Paused, None) => {
                return Err(TrackerError::corrupt("PAUSED snapshot without openPauseStart"))
            }
            (s, Some(_)) if s != SessionState::Paused => {
                return Err(TrackerError::corrupt(format!(
                    "openPauseStart present on a {} snapshot",
                    s
                )))
            }
            _ => {}
        }

        let mut intervals: Vec<PauseInterval> = Vec::with_capacity(self.pause_intervals.len() + 1);
        let mut boundary = start_time;
        for p in &self.pause_intervals {
            let from = parse_instant(&p.start_time, "pause startTime")?;
            let to = parse_instant(&p.end_time, "pause endTime")?;
            if from < boundary || to < from {
                return Err(TrackerError::corrupt("pause intervals overlap or are out of order"));
            }
            boundary = to;
            intervals.push(PauseInterval {
                start_time: from,
                end_time: Some(to),
            });
        }

        let open_part = open_start.map_or(0.0, |at| seconds_between(at, saved_at));
        let closed_part: f64 = intervals
            .iter()
            .filter_map(|p| p.end_time.map(|end| seconds_between(p.start_time, end)))
            .sum();

        if intervals.is_empty() && paused_seconds - open_part > PAUSE_TOLERANCE_SECONDS {
            // Minimal documents carry only the total; anchor it at the start
            let closed = paused_seconds - open_part;
            let end = TimeDelta::try_milliseconds((closed * 1000.0).round() as i64)
                .and_then(|d| start_time.checked_add_signed(d))
                .ok_or_else(|| TrackerError::corrupt("pausedSeconds out of range"))?
                .min(saved_at);
            intervals.push(PauseInterval {
                start_time,
                end_time: Some(end),
            });
            boundary = end;
        } else if (closed_part + open_part - paused_seconds).abs() > PAUSE_TOLERANCE_SECONDS {
            return Err(TrackerError::corrupt(format!(
                "pausedSeconds {} disagrees with pause intervals ({:.1}s)",
                paused_seconds,
                closed_part + open_part
            )));
        }

        if boundary > saved_at {
            return Err(TrackerError::corrupt("pause intervals extend past savedAt"));
        }

        if let Some(at) = open_start {
            if at < boundary || at > saved_at {
                return Err(TrackerError::corrupt("openPauseStart overlaps recorded pauses"));
            }
            intervals.push(PauseInterval {
                start_time: at,
                end_time: None,
            });
        }

        Ok(intervals)
    }
}

/// Parse and restore a stored snapshot in one step.
pub fn decode(payload: &str) -> Result<RecoveredSession> {
    SessionSnapshot::from_json(payload)?.restore()
}

/// Capture and serialize a session. `None` for terminal sessions.
pub fn encode(session: &ActivitySession, saved_at: DateTime<Utc>) -> Option<Result<String>> {
    SessionSnapshot::capture(session, saved_at).map(|s| s.to_json())
}

/// A session rebuilt from a snapshot, awaiting the caller's decision.
#[derive(Debug, Clone)]
pub struct RecoveredSession {
    session: ActivitySession,
    saved_at: DateTime<Utc>,
}

impl RecoveredSession {
    pub fn session(&self) -> &ActivitySession {
        &self.session
    }

    /// When the snapshot was written.
    pub fn saved_at(&self) -> DateTime<Utc> {
        self.saved_at
    }

    /// Metrics as they stood at `saved_at`.
    pub fn metrics_at_save(&self) -> &MetricsSnapshot {
        self.session.metrics()
    }

    /// Whether the session was active or paused when saved.
    pub fn was_recording(&self) -> bool {
        self.session.state().is_recording()
    }

    /// Seconds between the save and `now` that nobody has accounted for.
    pub fn gap_seconds(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.saved_at, now).max(0.0)
    }

    /// Keep going as if the process never stopped.
    ///
    /// For an `ACTIVE` session the gap counts as active time.
    pub fn continue_tracking(self) -> ActivitySession {
        self.session
    }

    /// Keep going, recording the gap as paused time.
    pub fn continue_excluding_gap(self, now: DateTime<Utc>) -> Result<ActivitySession> {
        let mut session = self.session;
        if session.state() == SessionState::Active {
            session.pause(self.saved_at)?;
            session.resume(now)?;
        }
        Ok(session)
    }

    /// Complete the session as of the last save.
    pub fn finalize(self) -> Result<ActivitySession> {
        let mut session = self.session;
        if session.state().is_recording() {
            session.stop(self.saved_at)?;
        }
        session.complete(self.saved_at)?;
        Ok(session)
    }

    /// Cancel the session as of the last save.
    pub fn discard(self) -> Result<ActivitySession> {
        let mut session = self.session;
        if session.state().is_recording() {
            session.stop(self.saved_at)?;
        }
        session.cancel(self.saved_at)?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::destination_point;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn sample_at(meters_north: f64, secs: i64) -> GeoSample {
        let (lat, lon) = destination_point(47.0, 8.0, 0.0, meters_north);
        GeoSample::new(lat, lon, t(secs)).with_altitude(400.0 + meters_north / 100.0)
    }

    /// Active 0..30, paused 30..40, active 40..60, paused from 60.
    fn paused_session() -> ActivitySession {
        let mut session = ActivitySession::new("run-7", t(0));
        session.start(t(0)).unwrap();
        session.activate(t(0)).unwrap();
        session.append_sample(sample_at(0.0, 0));
        session.append_sample(sample_at(90.0, 30));
        session.pause(t(30)).unwrap();
        session.resume(t(40)).unwrap();
        session.append_sample(sample_at(150.0, 60));
        session.pause(t(60)).unwrap();
        session
    }

    #[test]
    fn test_restore_reproduces_metrics_at_save() {
        let mut session = paused_session();
        let expected = *session.refresh_metrics(t(75));

        let json = encode(&session, t(75)).unwrap().unwrap();
        let recovered = decode(&json).unwrap();

        let m = recovered.metrics_at_save();
        assert_eq!(recovered.session().state(), SessionState::Paused);
        assert_eq!(m.duration_seconds, expected.duration_seconds);
        assert_eq!(m.paused_seconds, 25.0);
        assert_eq!(m.distance_meters, expected.distance_meters);
        assert_eq!(m.elevation_gain_meters, expected.elevation_gain_meters);
        assert_eq!(recovered.session().samples(), session.samples());
        assert_eq!(recovered.session().pause_intervals(), session.pause_intervals());
    }

    #[test]
    fn test_gap_is_reported_not_applied() {
        let mut session = ActivitySession::new("run-8", t(0));
        session.start(t(0)).unwrap();
        session.activate(t(0)).unwrap();
        let json = encode(&session, t(100)).unwrap().unwrap();

        let recovered = decode(&json).unwrap();
        assert_eq!(recovered.metrics_at_save().duration_seconds, 100.0);
        assert_eq!(recovered.gap_seconds(t(400)), 300.0);
        assert!(recovered.was_recording());

        // Explicitly folding the gap into a pause
        let mut resumed = recovered.continue_excluding_gap(t(400)).unwrap();
        let m = *resumed.refresh_metrics(t(410));
        assert_eq!(m.duration_seconds, 110.0);
        assert_eq!(m.paused_seconds, 300.0);
    }

    #[test]
    fn test_finalize_and_discard_at_save_time() {
        let json = encode(&paused_session(), t(75)).unwrap().unwrap();

        let finalized = decode(&json).unwrap().finalize().unwrap();
        assert_eq!(finalized.state(), SessionState::Completed);
        assert_eq!(finalized.end_time(), Some(t(75)));
        assert_eq!(finalized.metrics().paused_seconds, 25.0);
        assert_eq!(finalized.metrics().duration_seconds, 50.0);

        let discarded = decode(&json).unwrap().discard().unwrap();
        assert_eq!(discarded.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_missing_start_time_is_corrupt() {
        let mut doc = SessionSnapshot::capture(&paused_session(), t(75)).unwrap();
        doc.start_time = None;
        let err = doc.restore().unwrap_err();
        match err {
            TrackerError::CorruptSnapshot { reason } => assert!(reason.contains("startTime")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unparsable_timestamp_is_corrupt() {
        let mut doc = SessionSnapshot::capture(&paused_session(), t(75)).unwrap();
        if let Some(samples) = doc.samples.as_mut() {
            samples[1].timestamp = "yesterday".to_string();
        }
        assert!(matches!(doc.restore(), Err(TrackerError::CorruptSnapshot { .. })));
    }

    #[test]
    fn test_inconsistent_documents_are_corrupt() {
        let base = SessionSnapshot::capture(&paused_session(), t(75)).unwrap();

        let mut doc = base.clone();
        doc.paused_seconds = Some(500.0);
        assert!(doc.restore().is_err());

        let mut doc = base.clone();
        doc.open_pause_start = None;
        assert!(doc.restore().is_err());

        let mut doc = base.clone();
        doc.state = Some("COMPLETED".to_string());
        assert!(doc.restore().is_err());

        let mut doc = base;
        if let Some(samples) = doc.samples.as_mut() {
            samples.swap(0, 2);
        }
        assert!(doc.restore().is_err());

        assert!(decode("{not json").is_err());
        assert!(decode("{}").is_err());

        // Paused longer than the session existed
        let payload = r#"{
            "sessionId": "legacy",
            "state": "ACTIVE",
            "startTime": "2024-05-01T07:00:00Z",
            "pausedSeconds": 1e13,
            "samples": [],
            "savedAt": "2024-05-01T07:02:00Z"
        }"#;
        assert!(matches!(
            decode(payload),
            Err(TrackerError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn test_minimal_document_without_pause_log() {
        let payload = r#"{
            "sessionId": "legacy",
            "state": "ACTIVE",
            "startTime": "2024-05-01T07:00:00Z",
            "pausedSeconds": 20.0,
            "samples": [],
            "savedAt": "2024-05-01T07:02:00Z"
        }"#;
        let recovered = decode(payload).unwrap();
        let m = recovered.metrics_at_save();
        assert_eq!(m.paused_seconds, 20.0);
        assert_eq!(m.duration_seconds, 100.0);
        assert_eq!(recovered.session().created_at(), t(0));
    }

    #[test]
    fn test_terminal_sessions_are_not_captured() {
        let mut session = paused_session();
        session.stop(t(70)).unwrap();
        session.complete(t(70)).unwrap();
        assert!(SessionSnapshot::capture(&session, t(80)).is_none());
    }
}
