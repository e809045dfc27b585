//! Session controller
//!
//! Owns the single capture session: turns UI intents into source and
//! recorder calls, enforces the transition table and publishes a
//! [`StatusEvent`] for every transition.

use crate::capture::{BackendConfig, CaptureError, FrameSource, SourceFactory};
use crate::recorder::RecorderFactory;
use crate::session::preview::{PreviewChannel, PreviewReceiver};
use crate::session::pump::FramePump;
use crate::session::shared::{ActiveRecording, Shared};
use crate::session::state::{Intent, RecordingState, Session, SessionState, StatusEvent, Step};
use crate::utils::{SessionError, SessionResult};
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Tunables for the controller
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// How long `stop` waits for the frame pump
    pub stop_timeout: Duration,
    /// Consecutive recorder write failures before the recording is aborted
    pub max_consecutive_write_failures: u32,
    /// Consecutive read failures treated as a dead backend
    pub max_consecutive_read_failures: u32,
    /// Preview frames buffered before new ones are dropped
    pub preview_queue_depth: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(3),
            max_consecutive_write_failures: 5,
            max_consecutive_read_failures: 10,
            preview_queue_depth: 4,
        }
    }
}

struct ActiveCapture {
    source: Arc<dyn FrameSource>,
    pump: FramePump,
}

/// The capture session state machine
pub struct SessionController {
    shared: Arc<Shared>,
    sources: Arc<dyn SourceFactory>,
    recorders: Arc<dyn RecorderFactory>,
    policy: SessionPolicy,
    preview: PreviewChannel,
    active: Option<ActiveCapture>,
}

impl SessionController {
    pub fn new(
        sources: Arc<dyn SourceFactory>,
        recorders: Arc<dyn RecorderFactory>,
        policy: SessionPolicy,
    ) -> Self {
        let preview = PreviewChannel::new(policy.preview_queue_depth);
        Self {
            shared: Arc::new(Shared::new()),
            sources,
            recorders,
            policy,
            preview,
            active: None,
        }
    }

    /// Current state (no side effects)
    pub fn current_state(&self) -> SessionState {
        self.shared.state()
    }

    /// Snapshot of the session
    pub fn session(&self) -> Session {
        self.shared.session.read().clone()
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Subscribe to status events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.subscribe()
    }

    /// Receiver for preview frames. There is one; later calls return None.
    pub fn take_preview_receiver(&mut self) -> Option<PreviewReceiver> {
        self.preview.take_receiver()
    }

    /// Preview frame rate over the last 120 frames
    pub fn measured_fps(&self) -> f64 {
        self.shared.fps.lock().fps()
    }

    /// Report a rejected intent as `InvalidState`
    fn reject(&self, state: SessionState, intent: Intent) -> SessionError {
        let message = match (state, intent) {
            (SessionState::Idle, Intent::StartRecording | Intent::ToggleRecording) => {
                "Start Preview first.".to_string()
            }
            _ => format!("{intent} is not allowed while {state}"),
        };
        self.report_invalid_state(message)
    }

    /// `InvalidState` is a usage error: logged at error level and reported
    fn report_invalid_state(&self, message: String) -> SessionError {
        tracing::error!("Invalid state: {}", message);
        let error = SessionError::invalid_state(message.clone());
        self.shared.report(message, Some(&error));
        error
    }

    /// Open the configured backend and start previewing
    pub fn start_preview(&mut self, config: BackendConfig) -> SessionResult<()> {
        let state = self.current_state();
        match state.on(Intent::StartPreview) {
            Step::Enter(_) => {}
            Step::NoOp => {
                self.shared.report("Preview already running.", None);
                return Ok(());
            }
            Step::Reject => return Err(self.reject(state, Intent::StartPreview)),
        }

        // A previous run may have left a detached pump behind
        self.release_capture();

        let source = match self.sources.open(&config) {
            Ok(source) => source,
            Err(e) => {
                let error = match e {
                    CaptureError::BackendUnavailable(msg) => SessionError::BackendUnavailable(msg),
                    other => SessionError::BackendUnavailable(other.to_string()),
                };
                self.shared
                    .transition(SessionState::Error, "Failed to start preview", Some(&error));
                return Err(error);
            }
        };

        self.shared.fps.lock().reset();
        let message = format!(
            "Preview started ({}, {} @ {}fps)",
            source.backend(),
            config.resolution,
            config.fps
        );
        let mut config = config;
        config.backend = source.backend();
        self.shared.apply(None, SessionState::Previewing, message, None, |session| {
            session.begin_preview(&config)
        });

        match FramePump::spawn(
            source.clone(),
            self.shared.clone(),
            self.preview.sender(),
            self.policy.clone(),
        ) {
            Ok(pump) => {
                self.active = Some(ActiveCapture { source, pump });
                Ok(())
            }
            Err(e) => {
                source.close();
                let error =
                    SessionError::BackendUnavailable(format!("Failed to spawn frame pump: {e}"));
                self.shared
                    .transition(SessionState::Error, "Failed to start preview", Some(&error));
                Err(error)
            }
        }
    }

    /// Start recording to `output_path`
    pub fn start_recording(&mut self, output_path: &Path) -> SessionResult<RecordingState> {
        let state = self.current_state();
        match state.on(Intent::StartRecording) {
            Step::Enter(_) => {}
            Step::NoOp => {
                let current = self.session().output_path.unwrap_or_default();
                self.shared.report("Already recording.", None);
                return Ok(RecordingState::Recording {
                    output_path: current,
                });
            }
            Step::Reject => return Err(self.reject(state, Intent::StartRecording)),
        }

        let config = self.shared.session.read().config.clone();
        let Some(config) = config else {
            return Err(self.report_invalid_state(
                "previewing without a backend configuration".to_string(),
            ));
        };

        let mut recorder = self.recorders.create();
        if let Err(e) = recorder.start(output_path, config.resolution, config.fps) {
            let error = SessionError::from(e);
            self.shared.report("Failed to start recording", Some(&error));
            return Err(error);
        }

        let mut slot = self.shared.recorder.lock();
        // Left over from a stop_recording that timed out
        let stale = self.shared.take_recorder(&mut slot);
        *slot = Some(ActiveRecording::new(recorder, output_path.to_path_buf()));
        let path = output_path.to_path_buf();
        let entered = self.shared.apply(
            Some(&[SessionState::Previewing]),
            SessionState::Recording,
            format!("Recording to {}", output_path.display()),
            None,
            |session| session.output_path = Some(path),
        );

        let orphan = if entered { None } else { slot.take() };
        drop(slot);
        for recording in stale.into_iter().chain(orphan) {
            recording.finish_best_effort();
        }

        if !entered {
            // The backend failed while the recorder was starting
            let state = self.current_state();
            return Err(self.reject(state, Intent::StartRecording));
        }

        Ok(RecordingState::Recording {
            output_path: output_path.to_path_buf(),
        })
    }

    /// Finish the current recording and return to preview
    pub fn stop_recording(&mut self) -> SessionResult<RecordingState> {
        let state = self.current_state();
        match state.on(Intent::StopRecording) {
            Step::Enter(_) => {}
            Step::NoOp => return Ok(RecordingState::Stopped),
            Step::Reject => return Err(self.reject(state, Intent::StopRecording)),
        }

        let taken = match self.shared.recorder.try_lock_for(self.policy.stop_timeout) {
            Some(mut slot) => self.shared.take_recorder(&mut slot),
            None => {
                // The pump finalizes it as soon as it lets go of the slot
                self.shared.request_finish();
                let error = SessionError::Flush(format!(
                    "recorder still busy after {:?}; finalizing in the background",
                    self.policy.stop_timeout
                ));
                self.shared.transition_from(
                    &[SessionState::Recording],
                    SessionState::Previewing,
                    "Recording stopped",
                    Some(&error),
                );
                return Err(error);
            }
        };

        let Some(mut active) = taken else {
            // The pump aborted it concurrently and reports that itself
            self.shared.transition_from(
                &[SessionState::Recording],
                SessionState::Previewing,
                "Recording stopped",
                None,
            );
            return Ok(RecordingState::Stopped);
        };

        match active.recorder.finish() {
            Ok(summary) => {
                self.shared.transition_from(
                    &[SessionState::Recording],
                    SessionState::Previewing,
                    format!(
                        "Saved {} ({} frames)",
                        summary.output_path.display(),
                        summary.frames_written
                    ),
                    None,
                );
                Ok(RecordingState::Finished(summary))
            }
            Err(e) => {
                let error = SessionError::from(e);
                self.shared.transition_from(
                    &[SessionState::Recording],
                    SessionState::Previewing,
                    "Failed to finalize recording",
                    Some(&error),
                );
                Err(error)
            }
        }
    }

    /// Start recording when previewing, stop when recording
    pub fn toggle_recording(&mut self, output_path: &Path) -> SessionResult<RecordingState> {
        let state = self.current_state();
        match state.on(Intent::ToggleRecording) {
            Step::Enter(SessionState::Recording) => self.start_recording(output_path),
            Step::Enter(_) => self.stop_recording(),
            Step::NoOp => Ok(RecordingState::Stopped),
            Step::Reject => Err(self.reject(state, Intent::ToggleRecording)),
        }
    }

    /// Stop recording (if any) and release the source. Ends in `Idle`, or
    /// in `Error` if the pump did not exit in time or the session had
    /// already failed.
    pub fn stop(&mut self) -> SessionState {
        let state = self.current_state();
        match state.on(Intent::Stop) {
            Step::Enter(_) => {}
            Step::NoOp => {
                if state == SessionState::Error {
                    self.release_capture();
                } else {
                    self.shared.report("Nothing to stop.", None);
                }
                return self.current_state();
            }
            Step::Reject => {
                let _ = self.reject(state, Intent::Stop);
                return state;
            }
        }

        if state == SessionState::Recording {
            // Errors are already reported as events
            let _ = self.stop_recording();
        }

        if !self.shared.transition_from(
            &[SessionState::Previewing, SessionState::Recording],
            SessionState::Stopping,
            "Stopping...",
            None,
        ) {
            // Failed in the meantime; stay in Error
            self.release_capture();
            return self.current_state();
        }

        match self.shutdown_capture() {
            Ok(()) => {
                self.shared
                    .transition_from(&[SessionState::Stopping], SessionState::Idle, "Stopped.", None);
            }
            Err(error) => {
                self.shared
                    .transition(SessionState::Error, "Stop timed out", Some(&error));
            }
        }
        self.current_state()
    }

    /// Leave `Error` for `Idle`, releasing all resources
    pub fn reset(&mut self) -> SessionResult<()> {
        let state = self.current_state();
        match state.on(Intent::Reset) {
            Step::Enter(_) => {}
            Step::NoOp => return Ok(()),
            Step::Reject => return Err(self.reject(state, Intent::Reset)),
        }

        self.release_capture();
        self.shared
            .transition_from(&[SessionState::Error], SessionState::Idle, "Reset.", None);
        Ok(())
    }

    /// Close the source and wait for the pump
    fn shutdown_capture(&mut self) -> SessionResult<()> {
        let Some(ActiveCapture { source, pump }) = self.active.take() else {
            self.drain_recorder();
            return Ok(());
        };

        let deadline = Instant::now() + self.policy.stop_timeout;
        pump.request_stop();
        let closed = close_within(source, self.policy.stop_timeout);
        let exited = pump.join(deadline.saturating_duration_since(Instant::now()));
        self.preview.end_run();
        self.drain_recorder();

        if closed && exited {
            Ok(())
        } else {
            Err(SessionError::StopTimeout(self.policy.stop_timeout))
        }
    }

    /// Best-effort release used on error paths
    fn release_capture(&mut self) {
        if let Err(e) = self.shutdown_capture() {
            tracing::error!("Releasing capture resources: {}", e);
        }
    }

    /// Finalize a recorder left in the slot
    fn drain_recorder(&self) {
        match self.shared.recorder.try_lock_for(self.policy.stop_timeout) {
            Some(mut slot) => {
                if let Some(active) = self.shared.take_recorder(&mut slot) {
                    drop(slot);
                    active.finish_best_effort();
                }
            }
            None => tracing::error!("Recorder slot still locked; recording left unfinalized"),
        }
    }
}

/// Close `source` on a helper thread so a wedged driver cannot hold up
/// `stop`. Returns false if `close` did not return within `timeout`; the
/// helper is then left to finish on its own.
fn close_within(source: Arc<dyn FrameSource>, timeout: Duration) -> bool {
    let (done_tx, done) = std::sync::mpsc::channel();
    let closer = source.clone();
    let spawned = std::thread::Builder::new()
        .name("source-close".to_string())
        .spawn(move || {
            closer.close();
            let _ = done_tx.send(());
        });

    if let Err(e) = spawned {
        tracing::warn!("Failed to spawn close thread ({}); closing inline", e);
        source.close();
        return true;
    }

    match done.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => {
            tracing::error!("{} source did not close within {:?}", source.backend(), timeout);
            false
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.active.is_some() || self.current_state().is_live() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{BackendKind, Resolution};
    use crate::recorder::{ffmpeg_available, probe_video, FfmpegRecorderFactory};
    use crate::session::test_support::{
        wait_until, MemoryRecorderFactory, RecorderBehavior, TestSourceFactory, TestSourceKind,
    };
    use tempfile::tempdir;

    fn config() -> BackendConfig {
        BackendConfig::new(BackendKind::Camera, Resolution::new(64, 48), 30)
    }

    fn controller(
        kind: TestSourceKind,
        behavior: RecorderBehavior,
    ) -> (SessionController, Arc<TestSourceFactory>, Arc<MemoryRecorderFactory>) {
        controller_with_policy(kind, behavior, SessionPolicy::default())
    }

    fn controller_with_policy(
        kind: TestSourceKind,
        behavior: RecorderBehavior,
        policy: SessionPolicy,
    ) -> (SessionController, Arc<TestSourceFactory>, Arc<MemoryRecorderFactory>) {
        let sources = Arc::new(TestSourceFactory::new(kind));
        let recorders = Arc::new(MemoryRecorderFactory::new(behavior));
        let controller = SessionController::new(sources.clone(), recorders.clone(), policy);
        (controller, sources, recorders)
    }

    fn drain_states(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<SessionState> {
        let mut states = Vec::new();
        let mut last_seq = None;
        while let Ok(event) = rx.try_recv() {
            if let Some(prev) = last_seq {
                assert_eq!(event.seq, prev + 1);
            }
            last_seq = Some(event.seq);
            if event.previous != event.state {
                states.push(event.state);
            }
        }
        states
    }

    #[test]
    fn test_toggle_from_idle_never_touches_recorder() {
        let (mut controller, _, recorders) = controller(TestSourceKind::Gated, RecorderBehavior::default());
        let mut events = controller.subscribe();
        let err = controller.toggle_recording(Path::new("out.mp4")).unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert_eq!(controller.current_state(), SessionState::Idle);
        assert_eq!(recorders.created(), 0);

        let event = events.try_recv().unwrap();
        assert_eq!(event.state, SessionState::Idle);
        assert_eq!(event.message, "Start Preview first.");
        assert_eq!(event.error.unwrap().code, "INVALID_STATE");
    }

    #[test]
    fn test_ninety_frame_scenario() {
        let (mut controller, sources, recorders) =
            controller(TestSourceKind::Gated, RecorderBehavior::default());
        let mut events = controller.subscribe();

        controller.start_preview(config()).unwrap();
        assert_eq!(controller.current_state(), SessionState::Previewing);

        let state = controller.toggle_recording(Path::new("out.mp4")).unwrap();
        assert!(matches!(state, RecordingState::Recording { .. }));
        assert_eq!(controller.current_state(), SessionState::Recording);
        assert_eq!(
            controller.session().output_path.as_deref(),
            Some(Path::new("out.mp4"))
        );

        sources.gate().release(90);
        assert!(wait_until(Duration::from_secs(5), || recorders.frames_submitted() == 90));

        let state = controller.toggle_recording(Path::new("out.mp4")).unwrap();
        let RecordingState::Finished(summary) = state else {
            panic!("expected a finished recording, got {state:?}");
        };
        assert_eq!(summary.frames_written, 90);
        assert_eq!(summary.fps, 30);
        assert_eq!(controller.current_state(), SessionState::Previewing);
        assert!(controller.session().output_path.is_none());

        assert_eq!(controller.stop(), SessionState::Idle);
        assert_eq!(sources.live(), 0);

        assert_eq!(
            drain_states(&mut events),
            vec![
                SessionState::Previewing,
                SessionState::Recording,
                SessionState::Previewing,
                SessionState::Stopping,
                SessionState::Idle,
            ]
        );
    }

    #[test]
    fn test_recorded_frames_are_fifo() {
        let (mut controller, sources, recorders) =
            controller(TestSourceKind::Gated, RecorderBehavior::default());
        controller.start_preview(config()).unwrap();
        controller.start_recording(Path::new("fifo.mp4")).unwrap();
        sources.gate().release(30);
        assert!(wait_until(Duration::from_secs(5), || recorders.frames_submitted() == 30));

        let sequences = recorders.sequences();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
        controller.stop();
    }

    #[test]
    fn test_preview_frames_in_order() {
        let (mut controller, sources, _) = controller(TestSourceKind::Gated, RecorderBehavior::default());
        let mut preview = controller.take_preview_receiver().unwrap();
        assert!(controller.take_preview_receiver().is_none());

        controller.start_preview(config()).unwrap();
        sources.gate().release(3);

        let mut last = None;
        for _ in 0..3 {
            let frame = preview.blocking_recv().unwrap();
            if let Some(prev) = last {
                assert!(frame.sequence() > prev);
            }
            last = Some(frame.sequence());
        }
        controller.stop();
    }

    #[test]
    fn test_restarted_preview_skips_previous_frames() {
        let (mut controller, sources, _) = controller(TestSourceKind::Gated, RecorderBehavior::default());
        let mut preview = controller.take_preview_receiver().unwrap();

        controller.start_preview(config()).unwrap();
        sources.gate().release(3);
        assert!(wait_until(Duration::from_secs(5), || sources.gate().delivered() == 3));
        // Joining the pump means all three frames are queued and unread
        assert_eq!(controller.stop(), SessionState::Idle);

        controller.start_preview(config()).unwrap();
        sources.gate().release(1);
        let frame = preview.blocking_recv().unwrap();
        assert_eq!(frame.sequence(), 0);
        assert!(preview.try_recv().is_err());
        controller.stop();
    }

    #[test]
    fn test_no_source_leak_across_restarts() {
        let (mut controller, sources, _) =
            controller(TestSourceKind::Pattern, RecorderBehavior::default());

        for _ in 0..20 {
            controller.start_preview(config()).unwrap();
            assert_eq!(sources.live(), 1);
            assert_eq!(controller.stop(), SessionState::Idle);
            assert_eq!(sources.live(), 0);
        }
        assert_eq!(sources.opened(), 20);
    }

    #[test]
    fn test_backend_unavailable_enters_error_until_reset() {
        let (mut controller, sources, _) =
            controller(TestSourceKind::Unavailable, RecorderBehavior::default());

        let err = controller.start_preview(config()).unwrap_err();
        assert!(matches!(err, SessionError::BackendUnavailable(_)));
        assert_eq!(controller.current_state(), SessionState::Error);
        assert_eq!(sources.live(), 0);

        assert!(matches!(
            controller.start_preview(config()),
            Err(SessionError::InvalidState(_))
        ));
        assert!(matches!(
            controller.toggle_recording(Path::new("out.mp4")),
            Err(SessionError::InvalidState(_))
        ));

        // stop from Error stays in Error
        assert_eq!(controller.stop(), SessionState::Error);

        controller.reset().unwrap();
        assert_eq!(controller.current_state(), SessionState::Idle);
        assert!(controller.session().config.is_none());
    }

    #[test]
    fn test_recorder_init_failure_stays_previewing() {
        let behavior = RecorderBehavior {
            fail_start: true,
            ..Default::default()
        };
        let (mut controller, _, _) = controller(TestSourceKind::Gated, behavior);
        let mut events = controller.subscribe();
        controller.start_preview(config()).unwrap();

        let err = controller.toggle_recording(Path::new("/nope/out.mp4")).unwrap_err();
        assert!(matches!(err, SessionError::RecorderInit(_)));
        assert_eq!(controller.current_state(), SessionState::Previewing);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let Some(error) = event.error {
                assert_eq!(error.code, "RECORDER_INIT_ERROR");
                assert_eq!(event.state, SessionState::Previewing);
                saw_error = true;
            }
        }
        assert!(saw_error);
        controller.stop();
    }

    #[test]
    fn test_flush_failure_still_returns_to_preview() {
        let behavior = RecorderBehavior {
            fail_finish: true,
            ..Default::default()
        };
        let (mut controller, sources, _) = controller(TestSourceKind::Gated, behavior);
        controller.start_preview(config()).unwrap();
        controller.toggle_recording(Path::new("out.mp4")).unwrap();
        sources.gate().release(5);

        let err = controller.toggle_recording(Path::new("out.mp4")).unwrap_err();
        assert!(matches!(err, SessionError::Flush(_)));
        assert_eq!(controller.current_state(), SessionState::Previewing);
        controller.stop();
    }

    #[test]
    fn test_write_failures_abort_recording() {
        let behavior = RecorderBehavior {
            fail_submit: true,
            ..Default::default()
        };
        let (mut controller, sources, recorders) = controller(TestSourceKind::Gated, behavior);
        let mut events = controller.subscribe();
        controller.start_preview(config()).unwrap();
        controller.start_recording(Path::new("out.mp4")).unwrap();

        sources.gate().release(5);
        assert!(wait_until(Duration::from_secs(5), || {
            controller.current_state() == SessionState::Previewing
        }));
        assert_eq!(recorders.finished(), 1);

        let aborted = std::iter::from_fn(|| events.try_recv().ok())
            .find(|e| e.previous == SessionState::Recording)
            .unwrap();
        assert_eq!(aborted.error.unwrap().code, "WRITE_ERROR");

        // Nothing left to stop
        assert_eq!(controller.stop_recording().unwrap(), RecordingState::Stopped);
        controller.stop();
    }

    #[test]
    fn test_unexpected_end_of_stream_is_fatal() {
        let (mut controller, sources, recorders) =
            controller(TestSourceKind::Limited(10), RecorderBehavior::default());
        controller.start_preview(config()).unwrap();
        controller.start_recording(Path::new("out.mp4")).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            controller.current_state() == SessionState::Error
        }));
        assert_eq!(recorders.finished(), 1);
        assert_eq!(sources.live(), 0);

        controller.reset().unwrap();
        controller.start_preview(config()).unwrap();
        assert_eq!(controller.current_state(), SessionState::Previewing);
        controller.stop();
    }

    #[test]
    fn test_repeated_read_errors_are_fatal() {
        let (mut controller, _, _) =
            controller(TestSourceKind::ReadErrors, RecorderBehavior::default());
        controller.start_preview(config()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            controller.current_state() == SessionState::Error
        }));
        let session = controller.session();
        assert_eq!(session.state, SessionState::Error);
    }

    #[test]
    fn test_stop_is_bounded_when_pump_hangs() {
        let policy = SessionPolicy {
            stop_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (mut controller, _, _) =
            controller_with_policy(TestSourceKind::Stuck, RecorderBehavior::default(), policy);
        controller.start_preview(config()).unwrap();
        // Let the pump enter the stuck read
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert_eq!(controller.stop(), SessionState::Error);
        assert!(started.elapsed() < Duration::from_secs(1));

        controller.reset().unwrap();
        assert_eq!(controller.current_state(), SessionState::Idle);
    }

    #[test]
    fn test_stop_is_bounded_when_close_blocks() {
        let policy = SessionPolicy {
            stop_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (mut controller, sources, _) =
            controller_with_policy(TestSourceKind::SlowClose, RecorderBehavior::default(), policy);
        let mut events = controller.subscribe();
        controller.start_preview(config()).unwrap();

        let started = Instant::now();
        assert_eq!(controller.stop(), SessionState::Error);
        assert!(started.elapsed() < Duration::from_secs(1));

        let failed = std::iter::from_fn(|| events.try_recv().ok())
            .find(|e| e.state == SessionState::Error)
            .unwrap();
        assert_eq!(failed.error.unwrap().code, "STOP_TIMEOUT");

        // The detached close still releases the device
        assert!(wait_until(Duration::from_secs(5), || sources.live() == 0));
        controller.reset().unwrap();
        assert_eq!(controller.current_state(), SessionState::Idle);
    }

    #[test]
    fn test_stop_recording_timeout_stops_feeding_recorder() {
        let policy = SessionPolicy {
            stop_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let behavior = RecorderBehavior {
            slow_first_submit: Some(Duration::from_millis(600)),
            ..Default::default()
        };
        let (mut controller, sources, recorders) =
            controller_with_policy(TestSourceKind::Gated, behavior, policy);
        let mut events = controller.subscribe();
        controller.start_preview(config()).unwrap();
        controller.start_recording(Path::new("slow.mp4")).unwrap();

        sources.gate().release(1);
        assert!(wait_until(Duration::from_secs(5), || sources.gate().delivered() == 1));
        // Let the pump take the slot and enter the slow submit
        std::thread::sleep(Duration::from_millis(50));

        let err = controller.stop_recording().unwrap_err();
        assert!(matches!(err, SessionError::Flush(_)));
        assert_eq!(controller.current_state(), SessionState::Previewing);

        sources.gate().release(10);
        assert!(wait_until(Duration::from_secs(5), || recorders.finished() == 1));
        assert!(wait_until(Duration::from_secs(5), || sources.gate().delivered() == 11));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(recorders.frames_submitted(), 1);
        assert_eq!(controller.current_state(), SessionState::Previewing);

        let saved = std::iter::from_fn(|| events.try_recv().ok())
            .find(|e| e.message.starts_with("Saved slow.mp4"));
        assert!(saved.is_some());

        // A new recording gets a fresh recorder
        controller.start_recording(Path::new("next.mp4")).unwrap();
        assert_eq!(recorders.created(), 2);
        assert_eq!(controller.stop(), SessionState::Idle);
        assert_eq!(recorders.finished(), 2);
    }

    #[test]
    fn test_documented_no_ops() {
        let (mut controller, _, recorders) = controller(TestSourceKind::Gated, RecorderBehavior::default());
        assert_eq!(controller.stop(), SessionState::Idle);
        assert_eq!(controller.stop_recording().unwrap(), RecordingState::Stopped);
        controller.reset().unwrap();

        controller.start_preview(config()).unwrap();
        controller.start_preview(config()).unwrap();
        assert_eq!(controller.current_state(), SessionState::Previewing);
        assert!(matches!(controller.reset(), Err(SessionError::InvalidState(_))));
        assert_eq!(recorders.created(), 0);
        controller.stop();
    }

    #[test]
    fn test_stop_while_recording_finalizes() {
        let (mut controller, sources, recorders) =
            controller(TestSourceKind::Gated, RecorderBehavior::default());
        controller.start_preview(config()).unwrap();
        controller.start_recording(Path::new("out.mp4")).unwrap();
        sources.gate().release(4);
        assert!(wait_until(Duration::from_secs(5), || recorders.frames_submitted() == 4));

        assert_eq!(controller.stop(), SessionState::Idle);
        assert_eq!(recorders.finished(), 1);
        assert_eq!(sources.live(), 0);
    }

    #[test]
    fn test_ninety_frames_to_mp4() {
        if !ffmpeg_available() {
            eprintln!("ffmpeg not installed; skipping");
            return;
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mp4");

        let sources = Arc::new(TestSourceFactory::new(TestSourceKind::Gated));
        let mut controller = SessionController::new(
            sources.clone(),
            Arc::new(FfmpegRecorderFactory::new()),
            SessionPolicy::default(),
        );
        controller
            .start_preview(BackendConfig::new(
                BackendKind::Camera,
                Resolution::new(640, 480),
                30,
            ))
            .unwrap();
        controller.toggle_recording(&path).unwrap();

        sources.gate().release(90);
        assert!(wait_until(Duration::from_secs(10), || sources.gate().delivered() == 90));
        // The last frame is submitted right after it is delivered
        std::thread::sleep(Duration::from_millis(200));

        let state = controller.toggle_recording(&path).unwrap();
        let RecordingState::Finished(summary) = state else {
            panic!("expected a finished recording, got {state:?}");
        };
        assert_eq!(summary.frames_written, 90);
        assert_eq!(controller.stop(), SessionState::Idle);

        let metadata = probe_video(&path).unwrap();
        assert_eq!(metadata.frame_count, Some(90));
        assert!((metadata.fps - 30.0).abs() < 0.01);
        assert_eq!((metadata.width, metadata.height), (640, 480));
    }
}
