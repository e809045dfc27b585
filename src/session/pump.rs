//! Frame pump
//!
//! One worker thread per open source. It blocks in `read_frame`, forwards
//! every frame to the preview queue and, while recording, to the recorder
//! in the shared handoff slot. The controller stops it by raising the stop
//! flag and closing the source, which unblocks the read.

use crate::capture::{CaptureError, Frame, FrameSource};
use crate::session::controller::SessionPolicy;
use crate::session::preview::PreviewSender;
use crate::session::shared::{ActiveRecording, Shared};
use crate::session::state::SessionState;
use crate::utils::SessionError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Pause between retries after a transient read error
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

pub(crate) struct FramePump {
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
    stopping: Arc<AtomicBool>,
}

impl FramePump {
    pub fn spawn(
        source: Arc<dyn FrameSource>,
        shared: Arc<Shared>,
        preview: PreviewSender,
        policy: SessionPolicy,
    ) -> std::io::Result<Self> {
        let stopping = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = std::sync::mpsc::channel();

        let worker = PumpWorker {
            source,
            shared,
            preview,
            policy,
            stopping: stopping.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("frame-pump".to_string())
            .spawn(move || {
                worker.run();
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            handle: Some(handle),
            done,
            stopping,
        })
    }

    /// Tell the worker that end-of-stream from now on is expected
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Wait for the worker to exit. Returns false if it did not exit in
    /// time, in which case the thread is detached.
    pub fn join(mut self, timeout: Duration) -> bool {
        let exited = match self.done.recv_timeout(timeout) {
            Ok(()) => true,
            // Sender dropped without sending: the worker panicked
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };

        if let Some(handle) = self.handle.take() {
            if exited {
                if handle.join().is_err() {
                    tracing::error!("Frame pump panicked");
                }
            } else {
                tracing::error!("Frame pump did not exit within {:?}; detaching", timeout);
            }
        }
        exited
    }
}

struct PumpWorker {
    source: Arc<dyn FrameSource>,
    shared: Arc<Shared>,
    preview: PreviewSender,
    policy: SessionPolicy,
    stopping: Arc<AtomicBool>,
}

impl PumpWorker {
    fn run(self) {
        tracing::debug!("Frame pump started ({})", self.source.backend());
        let mut read_failures: u32 = 0;
        let mut preview_dropped: u64 = 0;
        let mut frames: u64 = 0;

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            match self.source.read_frame() {
                Ok(frame) => {
                    read_failures = 0;
                    frames += 1;
                    self.shared.fps.lock().record(Instant::now());

                    if !self.preview.offer(frame.clone()) {
                        preview_dropped += 1;
                        if preview_dropped % 100 == 1 {
                            tracing::debug!(
                                "Preview queue full; {} frames dropped",
                                preview_dropped
                            );
                        }
                    }

                    self.record(&frame);
                }
                Err(CaptureError::EndOfStream) => {
                    if !self.stopping.load(Ordering::SeqCst) {
                        self.fail(SessionError::Read("capture stream ended unexpectedly".into()));
                    }
                    break;
                }
                Err(CaptureError::Read(message)) => {
                    if self.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    read_failures += 1;
                    tracing::warn!(
                        "Read error ({}/{}): {}",
                        read_failures,
                        self.policy.max_consecutive_read_failures,
                        message
                    );
                    if read_failures >= self.policy.max_consecutive_read_failures {
                        self.fail(SessionError::Read(format!(
                            "{read_failures} consecutive read failures, last: {message}"
                        )));
                        break;
                    }
                    std::thread::sleep(READ_RETRY_DELAY);
                }
                Err(e) => {
                    if !self.stopping.load(Ordering::SeqCst) {
                        self.fail(SessionError::from(e));
                    }
                    break;
                }
            }
        }

        tracing::debug!(
            "Frame pump exiting after {} frames ({} preview drops)",
            frames,
            preview_dropped
        );
    }

    /// Submit to the active recorder, if any
    fn record(&self, frame: &Frame) {
        let mut slot = self.shared.recorder.lock();
        let exceeded = match slot.as_mut() {
            None => return,
            Some(_) if self.shared.finish_requested() => None,
            Some(active) => self.submit(active, frame),
        };

        if let Some(failures) = exceeded {
            let aborted = self.shared.take_recorder(&mut slot);
            drop(slot);
            if let Some(aborted) = aborted {
                self.abort_recording(aborted, failures);
            }
            return;
        }

        // stop_recording timed out while this slot was held
        if let Some(abandoned) = self.shared.take_abandoned(&mut slot) {
            drop(slot);
            self.finish_abandoned(abandoned);
        }
    }

    /// Returns the failure count once it reaches the abort threshold
    fn submit(&self, active: &mut ActiveRecording, frame: &Frame) -> Option<u32> {
        match active.recorder.submit(frame) {
            Ok(()) => {
                active.consecutive_failures = 0;
                active.last_error = None;
                None
            }
            Err(e) => {
                active.consecutive_failures += 1;
                tracing::warn!(
                    "Write error ({}/{}): {}",
                    active.consecutive_failures,
                    self.policy.max_consecutive_write_failures,
                    e
                );
                active.last_error = Some(e);
                (active.consecutive_failures >= self.policy.max_consecutive_write_failures)
                    .then_some(active.consecutive_failures)
            }
        }
    }

    /// Finalize a recording the controller already left, and report how it went
    fn finish_abandoned(&self, abandoned: ActiveRecording) {
        let ActiveRecording {
            mut recorder,
            output_path,
            ..
        } = abandoned;
        match recorder.finish() {
            Ok(summary) => self.shared.report(
                format!(
                    "Saved {} ({} frames)",
                    summary.output_path.display(),
                    summary.frames_written
                ),
                None,
            ),
            Err(e) => self.shared.report(
                format!("Failed to finalize {}", output_path.display()),
                Some(&SessionError::from(e)),
            ),
        }
    }

    /// Give up on a recording that keeps failing; preview continues
    fn abort_recording(&self, aborted: ActiveRecording, failures: u32) {
        let detail = aborted
            .last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        let error = SessionError::Write(format!(
            "recording aborted after {failures} consecutive write failures: {detail}"
        ));
        aborted.finish_best_effort();

        let message = "Recording aborted";
        if !self.shared.transition_from(
            &[SessionState::Recording],
            SessionState::Previewing,
            message,
            Some(&error),
        ) {
            self.shared.report(message, Some(&error));
        }
    }

    /// Fatal backend error: release everything and enter `Error`
    fn fail(&self, error: SessionError) {
        tracing::error!("Fatal backend error: {}", error);

        let recording = {
            let mut slot = self.shared.recorder.lock();
            self.shared.take_recorder(&mut slot)
        };
        if let Some(recording) = recording {
            recording.finish_best_effort();
        }
        self.source.close();

        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        self.shared.transition_from(
            &[SessionState::Previewing, SessionState::Recording],
            SessionState::Error,
            "Backend failed",
            Some(&error),
        );
    }
}
