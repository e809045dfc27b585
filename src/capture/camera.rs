//! Desktop camera capture using nokhwa
//!
//! This is the development backend (configured as `opencv` for
//! compatibility with existing settings files): it opens a camera by device
//! index on a dedicated capture thread and hands decoded RGB frames over a
//! small bounded queue. Built only with the `camera` feature; without it the
//! source reports the backend as unavailable.

use crate::capture::traits::{
    BackendConfig, BackendKind, CameraInfo, CaptureError, CaptureResult, CaptureTarget, Frame,
    FrameSource, Resolution,
};
use parking_lot::Mutex as ParkingMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Frames buffered between the capture thread and the reader
const FRAME_QUEUE_DEPTH: usize = 2;

/// How long `open` waits for the camera to start streaming
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Reader wake-up interval used to notice `close`
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `close` waits for the capture thread to leave the driver
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type FrameItem = Result<Frame, String>;

/// Get list of available cameras
#[cfg(feature = "camera")]
pub fn list_cameras() -> Vec<CameraInfo> {
    use nokhwa::utils::{ApiBackend, CameraIndex};

    match nokhwa::query(ApiBackend::Auto) {
        Ok(cameras) => cameras
            .into_iter()
            .map(|info| {
                let id = match info.index() {
                    CameraIndex::Index(i) => i.to_string(),
                    CameraIndex::String(s) => s.to_string(),
                };
                CameraInfo {
                    id,
                    name: info.human_name().to_string(),
                    // Common resolutions
                    supported_resolutions: vec![
                        Resolution::new(1920, 1080),
                        Resolution::new(1280, 720),
                        Resolution::new(640, 480),
                    ],
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate cameras: {:?}", e);
            Vec::new()
        }
    }
}

#[cfg(not(feature = "camera"))]
pub fn list_cameras() -> Vec<CameraInfo> {
    Vec::new()
}

/// Body of the capture thread: open the camera, report the outcome on
/// `opened`, then stream frames until `running` clears.
#[cfg(feature = "camera")]
fn capture_loop(
    device_index: u32,
    config: BackendConfig,
    running: Arc<AtomicBool>,
    opened: SyncSender<Result<Resolution, String>>,
    frames: SyncSender<FrameItem>,
) {
    use crate::capture::traits::{FrameClock, PixelFormat};
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{
        CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
        Resolution as CameraResolution,
    };
    use nokhwa::Camera;
    use std::sync::mpsc::TrySendError;

    let requested = CameraFormat::new(
        CameraResolution::new(config.resolution.width, config.resolution.height),
        FrameFormat::MJPEG,
        config.fps,
    );
    let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(requested));

    let mut camera = match Camera::new(CameraIndex::Index(device_index), format) {
        Ok(c) => c,
        Err(e) => {
            let _ = opened.send(Err(format!("Could not open camera device {device_index}: {e}")));
            return;
        }
    };

    if let Err(e) = camera.open_stream() {
        let _ = opened.send(Err(format!("Failed to open camera stream: {e}")));
        return;
    }

    let camera_format = camera.camera_format();
    let actual = Resolution::new(
        camera_format.resolution().width(),
        camera_format.resolution().height(),
    );
    tracing::info!(
        "Camera {} opened: {} @ {}fps, format={:?} (requested {} @ {}fps)",
        device_index,
        actual,
        camera_format.frame_rate(),
        camera_format.format(),
        config.resolution,
        config.fps
    );
    let _ = opened.send(Ok(actual));

    let mut clock = FrameClock::start();
    let mut dropped: u64 = 0;

    while running.load(Ordering::SeqCst) {
        // Blocks until the camera delivers the next frame
        let item = camera
            .frame()
            .and_then(|buffer| buffer.decode_image::<RgbFormat>())
            .map_err(|e| format!("Failed to read frame from camera: {e}"))
            .and_then(|image| {
                let resolution = Resolution::new(image.width(), image.height());
                let (sequence, timestamp) = clock.tick();
                Frame::new(
                    image.into_raw(),
                    resolution,
                    PixelFormat::Rgb24,
                    sequence,
                    timestamp,
                )
                .map_err(|e| e.to_string())
            });

        match frames.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped % 100 == 1 {
                    tracing::debug!("Camera reader is behind; {} frames dropped", dropped);
                }
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    if let Err(e) = camera.stop_stream() {
        tracing::warn!("Error stopping camera stream: {:?}", e);
    }
    tracing::info!("Camera capture thread stopped ({} frames dropped)", dropped);
}

#[cfg(not(feature = "camera"))]
fn capture_loop(
    _device_index: u32,
    _config: BackendConfig,
    _running: Arc<AtomicBool>,
    opened: SyncSender<Result<Resolution, String>>,
    _frames: SyncSender<FrameItem>,
) {
    let _ = opened.send(Err(
        "camera backend not compiled in (enable the `camera` feature)".to_string(),
    ));
}

/// Capture thread that can be joined with a deadline
struct CaptureThread {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl CaptureThread {
    fn spawn(name: String, body: impl FnOnce() + Send + 'static) -> std::io::Result<Self> {
        let (done_tx, done) = std::sync::mpsc::channel();
        let handle = std::thread::Builder::new().name(name).spawn(move || {
            body();
            let _ = done_tx.send(());
        })?;
        Ok(Self { handle, done })
    }

    /// Wait up to `timeout` for the thread to finish. A thread still blocked
    /// in the driver is detached and false is returned.
    fn join(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    tracing::error!("Camera capture thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// Camera source with a dedicated capture thread
pub struct CameraFrameSource {
    opened: AtomicBool,
    running: Arc<AtomicBool>,
    frames: ParkingMutex<Option<Receiver<FrameItem>>>,
    capture_thread: ParkingMutex<Option<CaptureThread>>,
}

impl CameraFrameSource {
    pub fn new() -> Self {
        Self {
            opened: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            frames: ParkingMutex::new(None),
            capture_thread: ParkingMutex::new(None),
        }
    }

    fn join_capture_thread(&self, timeout: Duration) -> bool {
        let thread = self.capture_thread.lock().take();
        thread.map_or(true, |thread| thread.join(timeout))
    }
}

impl Default for CameraFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for CameraFrameSource {
    fn backend(&self) -> BackendKind {
        BackendKind::Camera
    }

    fn open(&self, config: &BackendConfig) -> CaptureResult<()> {
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::InvalidState(
                "camera source can only be opened once".to_string(),
            ));
        }
        config.validate()?;

        let device_index = match &config.target {
            CaptureTarget::Device(index) => *index,
            CaptureTarget::Pipeline(_) => {
                return Err(CaptureError::BackendUnavailable(
                    "camera backend needs a device index, not a pipeline".to_string(),
                ))
            }
        };

        let (opened_tx, opened_rx) = std::sync::mpsc::sync_channel(1);
        let (frames_tx, frames_rx) = std::sync::mpsc::sync_channel(FRAME_QUEUE_DEPTH);

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let thread_config = config.clone();
        let thread = CaptureThread::spawn(format!("camera-{device_index}"), move || {
            capture_loop(device_index, thread_config, running, opened_tx, frames_tx)
        })
        .map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            CaptureError::BackendUnavailable(format!("Failed to spawn capture thread: {e}"))
        })?;
        *self.capture_thread.lock() = Some(thread);

        let outcome = match opened_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(actual)) => {
                if actual != config.resolution {
                    tracing::warn!(
                        "Camera did not honor {}; streaming at {}",
                        config.resolution,
                        actual
                    );
                }
                Ok(())
            }
            Ok(Err(message)) => Err(CaptureError::BackendUnavailable(message)),
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::BackendUnavailable(format!(
                "camera {device_index} did not start within {OPEN_TIMEOUT:?}"
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::BackendUnavailable(
                "camera capture thread exited during open".to_string(),
            )),
        };

        if outcome.is_err() {
            self.running.store(false, Ordering::SeqCst);
            // A timed-out thread is still blocked in the driver; let it go.
            self.join_capture_thread(Duration::ZERO);
            return outcome;
        }

        *self.frames.lock() = Some(frames_rx);
        Ok(())
    }

    fn read_frame(&self) -> CaptureResult<Frame> {
        let guard = self.frames.lock();
        let frames = guard.as_ref().ok_or_else(|| {
            if self.opened.load(Ordering::SeqCst) {
                CaptureError::EndOfStream
            } else {
                CaptureError::InvalidState("read_frame called before open".to_string())
            }
        })?;

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(CaptureError::EndOfStream);
            }
            match frames.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(frame)) => return Ok(frame),
                Ok(Err(message)) => return Err(CaptureError::Read(message)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(CaptureError::EndOfStream),
            }
        }
    }

    fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Without a receiver the capture thread's next send fails. A reader
        // holding the lock returns within one poll interval.
        if let Some(mut frames) = self.frames.try_lock_for(POLL_INTERVAL * 2) {
            frames.take();
        }
        // The capture thread notices within one frame period, unless the
        // driver is wedged inside a read
        if self.join_capture_thread(CLOSE_TIMEOUT) {
            tracing::info!("Camera source closed");
        } else {
            tracing::warn!(
                "Camera capture thread still blocked after {:?}; detaching",
                CLOSE_TIMEOUT
            );
        }
    }

    fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CameraFrameSource {
    fn drop(&mut self) {
        self.close();
    }
}
