//! State shared between the controller and its frame pump
//!
//! Lock order: the recorder slot before the session.

use crate::recorder::{Recorder, RecorderError};
use crate::session::fps::FpsMeter;
use crate::session::state::{Session, SessionState, StatusEvent};
use crate::utils::{ErrorResponse, SessionError};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Status events buffered per subscriber
const EVENT_CAPACITY: usize = 100;

/// The recorder currently receiving frames
pub(crate) struct ActiveRecording {
    pub recorder: Box<dyn Recorder>,
    pub output_path: PathBuf,
    pub consecutive_failures: u32,
    pub last_error: Option<RecorderError>,
}

impl ActiveRecording {
    pub fn new(recorder: Box<dyn Recorder>, output_path: PathBuf) -> Self {
        Self {
            recorder,
            output_path,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    /// Finalize without caring about the outcome beyond a log line
    pub fn finish_best_effort(mut self) {
        match self.recorder.finish() {
            Ok(summary) => tracing::info!(
                "Recording {:?} finalized ({} frames)",
                summary.output_path,
                summary.frames_written
            ),
            Err(e) => tracing::warn!("Recording {:?} not finalized: {}", self.output_path, e),
        }
    }
}

pub(crate) struct Shared {
    pub session: RwLock<Session>,
    pub recorder: Mutex<Option<ActiveRecording>>,
    /// Set when `stop_recording` gave up waiting for the slot; whoever holds
    /// the slot next finalizes the recorder instead of feeding it
    finish_requested: AtomicBool,
    pub fps: Mutex<FpsMeter>,
    events: broadcast::Sender<StatusEvent>,
    seq: AtomicU64,
}

impl Shared {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session: RwLock::new(Session::new()),
            recorder: Mutex::new(None),
            finish_requested: AtomicBool::new(false),
            fps: Mutex::new(FpsMeter::default()),
            events,
            seq: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.read().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn request_finish(&self) {
        self.finish_requested.store(true, Ordering::SeqCst);
    }

    pub fn finish_requested(&self) -> bool {
        self.finish_requested.load(Ordering::SeqCst)
    }

    /// Take the recorder out of `slot` if its finish was requested. Clears
    /// the request either way.
    pub fn take_abandoned(&self, slot: &mut Option<ActiveRecording>) -> Option<ActiveRecording> {
        if self.finish_requested.swap(false, Ordering::SeqCst) {
            slot.take()
        } else {
            None
        }
    }

    /// Take whatever recorder is in `slot`, dropping any pending request
    pub fn take_recorder(&self, slot: &mut Option<ActiveRecording>) -> Option<ActiveRecording> {
        self.finish_requested.store(false, Ordering::SeqCst);
        slot.take()
    }

    /// Move to `to` if the current state is one of `from` (any state when
    /// `from` is None). The event is sent while the lock is held so
    /// subscribers see transitions in order.
    pub fn apply(
        &self,
        from: Option<&[SessionState]>,
        to: SessionState,
        message: impl Into<String>,
        error: Option<&SessionError>,
        update: impl FnOnce(&mut Session),
    ) -> bool {
        let mut session = self.session.write();
        let previous = session.state;
        if let Some(allowed) = from {
            if !allowed.contains(&previous) {
                return false;
            }
        }

        session.state = to;
        update(&mut session);
        match to {
            SessionState::Idle => session.clear_preview(),
            SessionState::Recording => {}
            _ => session.output_path = None,
        }

        let message = message.into();
        match error {
            Some(e) => tracing::warn!("[Session] {} -> {}: {} ({})", previous, to, message, e),
            None => tracing::info!("[Session] {} -> {}: {}", previous, to, message),
        }
        self.emit(previous, to, message, error);
        true
    }

    pub fn transition(
        &self,
        to: SessionState,
        message: impl Into<String>,
        error: Option<&SessionError>,
    ) {
        self.apply(None, to, message, error, |_| {});
    }

    pub fn transition_from(
        &self,
        from: &[SessionState],
        to: SessionState,
        message: impl Into<String>,
        error: Option<&SessionError>,
    ) -> bool {
        self.apply(Some(from), to, message, error, |_| {})
    }

    /// Event without a state change
    pub fn report(&self, message: impl Into<String>, error: Option<&SessionError>) {
        // Write lock keeps seq order equal to send order
        let session = self.session.write();
        let message = message.into();
        if let Some(e) = error {
            tracing::warn!("[Session] {}: {}", message, e);
        } else {
            tracing::debug!("[Session] {}", message);
        }
        self.emit(session.state, session.state, message, error);
    }

    fn emit(
        &self,
        previous: SessionState,
        state: SessionState,
        message: String,
        error: Option<&SessionError>,
    ) {
        let event = StatusEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            previous,
            state,
            message,
            error: error.map(ErrorResponse::from),
            at: Utc::now(),
        };
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
