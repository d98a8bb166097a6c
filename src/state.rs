//! Session lifecycle state machine.
//!
//! The lifecycle is a closed set of states with a fixed edge table:
//!
//! ```text
//! IDLE ──start──▶ STARTING ──activate──▶ ACTIVE ◀──resume── PAUSED
//!                    │                     │  └───pause────▶  │
//!                  cancel                 stop               stop
//!                    ▼                     ▼                  │
//!                CANCELLED ◀──cancel── STOPPING ◀─────────────┘
//!                                          │
//!                                      complete
//!                                          ▼
//!                                      COMPLETED
//! ```
//!
//! [`transition`] is a pure function. Callers apply side effects only after
//! it returns `Ok`, so a rejected event never touches the session.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// Lifecycle state of an activity session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Created, nothing recorded yet (initial state)
    Idle,
    /// Waiting for the location source to come up
    Starting,
    /// Recording samples
    Active,
    /// Recording suspended by the user
    Paused,
    /// Stop requested, awaiting completion or cancellation
    Stopping,
    /// Finished and finalized (terminal)
    Completed,
    /// Discarded (terminal)
    Cancelled,
}

impl SessionState {
    /// All states, in lifecycle order.
    pub const ALL: [SessionState; 7] = [
        SessionState::Idle,
        SessionState::Starting,
        SessionState::Active,
        SessionState::Paused,
        SessionState::Stopping,
        SessionState::Completed,
        SessionState::Cancelled,
    ];

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Cancelled)
    }

    /// States in which the clock is running for the activity (active or paused).
    pub fn is_recording(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Paused)
    }

    /// Wire name used in snapshots and storage.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Starting => "STARTING",
            SessionState::Active => "ACTIVE",
            SessionState::Paused => "PAUSED",
            SessionState::Stopping => "STOPPING",
            SessionState::Completed => "COMPLETED",
            SessionState::Cancelled => "CANCELLED",
        }
    }

    /// Events that are legal from this state.
    pub fn allowed_events(self) -> Vec<SessionEvent> {
        SessionEvent::ALL
            .iter()
            .copied()
            .filter(|&event| transition(self, event).is_ok())
            .collect()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        SessionState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| TrackerError::corrupt(format!("unknown session state '{}'", s)))
    }
}

/// A lifecycle event requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Start,
    Activate,
    Pause,
    Resume,
    Stop,
    Complete,
    Cancel,
}

impl SessionEvent {
    pub const ALL: [SessionEvent; 7] = [
        SessionEvent::Start,
        SessionEvent::Activate,
        SessionEvent::Pause,
        SessionEvent::Resume,
        SessionEvent::Stop,
        SessionEvent::Complete,
        SessionEvent::Cancel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SessionEvent::Start => "start",
            SessionEvent::Activate => "activate",
            SessionEvent::Pause => "pause",
            SessionEvent::Resume => "resume",
            SessionEvent::Stop => "stop",
            SessionEvent::Complete => "complete",
            SessionEvent::Cancel => "cancel",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply `event` to `from`, returning the next state.
///
/// Fails with [`TrackerError::InvalidStateTransition`] for any edge outside
/// the legal set. Terminal states reject every event.
pub fn transition(from: SessionState, event: SessionEvent) -> Result<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    match (from, event) {
        (S::Idle, E::Start) => Ok(S::Starting),
        (S::Starting, E::Activate) => Ok(S::Active),
        (S::Starting, E::Cancel) => Ok(S::Cancelled),
        (S::Active, E::Pause) => Ok(S::Paused),
        (S::Active, E::Stop) => Ok(S::Stopping),
        (S::Paused, E::Resume) => Ok(S::Active),
        (S::Paused, E::Stop) => Ok(S::Stopping),
        (S::Stopping, E::Complete) => Ok(S::Completed),
        (S::Stopping, E::Cancel) => Ok(S::Cancelled),
        _ => Err(TrackerError::InvalidStateTransition { from, event }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = SessionState::Idle;
        for event in [
            SessionEvent::Start,
            SessionEvent::Activate,
            SessionEvent::Pause,
            SessionEvent::Resume,
            SessionEvent::Stop,
            SessionEvent::Complete,
        ] {
            state = transition(state, event).unwrap();
        }
        assert_eq!(state, SessionState::Completed);
    }

    #[test]
    fn test_legal_edge_count() {
        // Exactly nine edges are legal across the whole table
        let legal = SessionState::ALL
            .iter()
            .flat_map(|&s| SessionEvent::ALL.iter().map(move |&e| (s, e)))
            .filter(|&(s, e)| transition(s, e).is_ok())
            .count();
        assert_eq!(legal, 9);
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for state in [SessionState::Completed, SessionState::Cancelled] {
            assert!(state.is_terminal());
            assert!(state.allowed_events().is_empty());
            for event in SessionEvent::ALL {
                assert!(matches!(
                    transition(state, event),
                    Err(TrackerError::InvalidStateTransition { from, .. }) if from == state
                ));
            }
        }
    }

    #[test]
    fn test_pause_from_idle_fails() {
        let err = transition(SessionState::Idle, SessionEvent::Pause).unwrap_err();
        assert_eq!(
            err,
            TrackerError::InvalidStateTransition {
                from: SessionState::Idle,
                event: SessionEvent::Pause,
            }
        );
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in SessionState::ALL {
            assert_eq!(state.as_str().parse::<SessionState>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert!("RUNNING".parse::<SessionState>().is_err());
    }

    #[test]
    fn test_allowed_events() {
        assert_eq!(
            SessionState::Paused.allowed_events(),
            vec![SessionEvent::Resume, SessionEvent::Stop]
        );
        assert_eq!(
            SessionState::Stopping.allowed_events(),
            vec![SessionEvent::Complete, SessionEvent::Cancel]
        );
    }
}
