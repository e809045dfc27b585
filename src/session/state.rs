//! Session state machine
//!
//! Defines the session states, the intents that drive them, and the
//! transition table. The table is total: every (state, intent) pair maps to
//! exactly one [`Step`].

use crate::capture::{BackendConfig, BackendKind, Resolution};
use crate::recorder::RecordingSummary;
use crate::utils::ErrorResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Current state of the capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No source open
    Idle,
    /// Source open, frames flowing to preview
    Previewing,
    /// Previewing and recording to a file
    Recording,
    /// Releasing the source
    Stopping,
    /// A backend failed; only `reset` leaves this state
    Error,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl SessionState {
    pub const ALL: [SessionState; 5] = [
        SessionState::Idle,
        SessionState::Previewing,
        SessionState::Recording,
        SessionState::Stopping,
        SessionState::Error,
    ];

    /// Whether a frame source is expected to be open
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Previewing | SessionState::Recording)
    }

    /// Transition table
    pub fn on(self, intent: Intent) -> Step {
        use Intent::*;
        use SessionState::*;

        match (self, intent) {
            (Idle, StartPreview) => Step::Enter(Previewing),
            (Idle, StartRecording | ToggleRecording) => Step::Reject,
            (Idle, StopRecording | Stop | Reset) => Step::NoOp,

            (Previewing, StartPreview | StopRecording) => Step::NoOp,
            (Previewing, StartRecording | ToggleRecording) => Step::Enter(Recording),
            (Previewing, Stop) => Step::Enter(Stopping),
            (Previewing, Reset) => Step::Reject,

            (Recording, StartPreview | StartRecording) => Step::NoOp,
            (Recording, StopRecording | ToggleRecording) => Step::Enter(Previewing),
            (Recording, Stop) => Step::Enter(Stopping),
            (Recording, Reset) => Step::Reject,

            (Stopping, Stop) => Step::NoOp,
            (Stopping, _) => Step::Reject,

            (Error, StartPreview | StartRecording | ToggleRecording) => Step::Reject,
            // Stop from Error releases whatever is left but stays in Error
            (Error, StopRecording | Stop) => Step::NoOp,
            (Error, Reset) => Step::Enter(Idle),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Previewing => "previewing",
            SessionState::Recording => "recording",
            SessionState::Stopping => "stopping",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// A request from the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    StartPreview,
    StartRecording,
    StopRecording,
    ToggleRecording,
    Stop,
    Reset,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::StartPreview,
        Intent::StartRecording,
        Intent::StopRecording,
        Intent::ToggleRecording,
        Intent::Stop,
        Intent::Reset,
    ];
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Intent::StartPreview => "start_preview",
            Intent::StartRecording => "start_recording",
            Intent::StopRecording => "stop_recording",
            Intent::ToggleRecording => "toggle_recording",
            Intent::Stop => "stop",
            Intent::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Outcome of applying an intent to a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Perform the intent and move to this state
    Enter(SessionState),
    /// Valid but nothing to do
    NoOp,
    /// Not allowed in this state (`InvalidState`)
    Reject,
}

/// Result of a recording intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RecordingState {
    /// Recording is in progress
    #[serde(rename_all = "camelCase")]
    Recording { output_path: PathBuf },
    /// A recording was just finalized
    Finished(RecordingSummary),
    /// Not recording
    Stopped,
}

/// Snapshot of the session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub state: SessionState,
    pub backend: Option<BackendKind>,
    pub resolution: Option<Resolution>,
    pub fps: Option<u32>,
    /// Set only while recording
    pub output_path: Option<PathBuf>,
    /// Configuration in force from `start_preview` until the next `Idle`
    pub config: Option<BackendConfig>,
    pub preview_started_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            backend: None,
            resolution: None,
            fps: None,
            output_path: None,
            config: None,
            preview_started_at: None,
        }
    }

    pub(crate) fn begin_preview(&mut self, config: &BackendConfig) {
        self.backend = Some(config.backend);
        self.resolution = Some(config.resolution);
        self.fps = Some(config.fps);
        self.config = Some(config.clone());
        self.preview_started_at = Some(Utc::now());
    }

    pub(crate) fn clear_preview(&mut self) {
        self.backend = None;
        self.resolution = None;
        self.fps = None;
        self.output_path = None;
        self.config = None;
        self.preview_started_at = None;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Emitted on every transition, and for failures that leave the state as is
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Increases by one per event
    pub seq: u64,
    pub previous: SessionState,
    pub state: SessionState,
    pub message: String,
    pub error: Option<ErrorResponse>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_total() {
        for state in SessionState::ALL {
            for intent in Intent::ALL {
                match state.on(intent) {
                    Step::Enter(next) => assert_ne!(
                        next, state,
                        "{state} --{intent}--> {next} should be a no-op instead"
                    ),
                    Step::NoOp | Step::Reject => {}
                }
            }
        }
    }

    #[test]
    fn test_recording_requires_preview() {
        assert_eq!(SessionState::Idle.on(Intent::ToggleRecording), Step::Reject);
        assert_eq!(SessionState::Idle.on(Intent::StartRecording), Step::Reject);
        assert_eq!(SessionState::Error.on(Intent::ToggleRecording), Step::Reject);
        assert_eq!(
            SessionState::Previewing.on(Intent::ToggleRecording),
            Step::Enter(SessionState::Recording)
        );
    }

    #[test]
    fn test_documented_no_ops() {
        assert_eq!(SessionState::Previewing.on(Intent::StartPreview), Step::NoOp);
        assert_eq!(SessionState::Recording.on(Intent::StartPreview), Step::NoOp);
        assert_eq!(SessionState::Previewing.on(Intent::StopRecording), Step::NoOp);
        assert_eq!(SessionState::Idle.on(Intent::Stop), Step::NoOp);
        assert_eq!(SessionState::Idle.on(Intent::Reset), Step::NoOp);
    }

    #[test]
    fn test_stop_paths() {
        assert_eq!(
            SessionState::Previewing.on(Intent::Stop),
            Step::Enter(SessionState::Stopping)
        );
        assert_eq!(
            SessionState::Recording.on(Intent::Stop),
            Step::Enter(SessionState::Stopping)
        );
        assert_eq!(
            SessionState::Recording.on(Intent::ToggleRecording),
            Step::Enter(SessionState::Previewing)
        );
    }

    #[test]
    fn test_error_is_terminal_until_reset() {
        for intent in Intent::ALL {
            let step = SessionState::Error.on(intent);
            if intent == Intent::Reset {
                assert_eq!(step, Step::Enter(SessionState::Idle));
            } else {
                assert!(!matches!(step, Step::Enter(_)), "{intent} left Error");
            }
        }
        assert_eq!(SessionState::Previewing.on(Intent::Reset), Step::Reject);
    }

    #[test]
    fn test_stopping_rejects_everything_but_stop() {
        for intent in Intent::ALL {
            let expected = if intent == Intent::Stop { Step::NoOp } else { Step::Reject };
            assert_eq!(SessionState::Stopping.on(intent), expected);
        }
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&SessionState::Previewing).unwrap();
        assert_eq!(json, "\"previewing\"");
    }

    #[test]
    fn test_session_preview_fields() {
        let mut session = Session::new();
        let config = BackendConfig::new(BackendKind::TestPattern, Resolution::new(640, 480), 30);
        session.begin_preview(&config);
        assert_eq!(session.fps, Some(30));
        assert_eq!(session.backend, Some(BackendKind::TestPattern));
        session.output_path = Some(PathBuf::from("out.mp4"));
        session.clear_preview();
        assert!(session.config.is_none());
        assert!(session.output_path.is_none());
    }
}
