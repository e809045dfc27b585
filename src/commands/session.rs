//! Session commands
//!
//! Async entry points for the UI layer. The controller blocks (closing a
//! camera, waiting for ffmpeg), so every call that can block runs on the
//! blocking pool while holding the controller lock.

use crate::capture::{list_cameras, BackendConfig, BackendRegistry, CameraInfo};
use crate::config::Settings;
use crate::recorder::{probe_video, FfmpegRecorderFactory, VideoMetadata};
use crate::session::{
    PreviewReceiver, RecordingState, Session, SessionController, SessionState, StatusEvent,
};
use crate::utils::{ensure_dir, ErrorResponse, SessionError, SessionResult};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Application state for the capture session
#[derive(Clone)]
pub struct SessionHandle {
    controller: Arc<Mutex<SessionController>>,
    settings: Arc<RwLock<Settings>>,
}

impl SessionHandle {
    /// Controller over the built-in backends and the ffmpeg recorder
    pub fn new(settings: Settings) -> Self {
        let controller = SessionController::new(
            Arc::new(BackendRegistry::new(settings.backend_fallback)),
            Arc::new(FfmpegRecorderFactory::new()),
            settings.policy(),
        );
        Self::with_controller(controller, settings)
    }

    pub fn with_controller(controller: SessionController, settings: Settings) -> Self {
        Self {
            controller: Arc::new(Mutex::new(controller)),
            settings: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Run `f` on the blocking pool with exclusive access to the controller
    async fn with_controller_blocking<T, F>(&self, f: F) -> Result<T, ErrorResponse>
    where
        T: Send + 'static,
        F: FnOnce(&mut SessionController) -> SessionResult<T> + Send + 'static,
    {
        let mut controller = self.controller.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *controller))
            .await
            .map_err(|e| ErrorResponse {
                code: "INTERNAL_ERROR".to_string(),
                message: format!("session task failed: {e}"),
            })?
            .map_err(ErrorResponse::from)
    }
}

/// Start previewing with the configured backend
pub async fn start_preview(handle: &SessionHandle) -> Result<(), ErrorResponse> {
    let config = handle.settings.read().backend_config();
    start_preview_with(handle, config).await
}

/// Start previewing with an explicit backend configuration
pub async fn start_preview_with(
    handle: &SessionHandle,
    config: BackendConfig,
) -> Result<(), ErrorResponse> {
    tracing::info!(
        "start_preview: {} {} @ {}fps",
        config.backend,
        config.resolution,
        config.fps
    );
    handle
        .with_controller_blocking(move |controller| controller.start_preview(config))
        .await
}

/// Start recording to a new timestamped file in the output folder, or stop
/// the current recording
pub async fn toggle_recording(handle: &SessionHandle) -> Result<RecordingState, ErrorResponse> {
    let (output_dir, path) = {
        let settings = handle.settings.read();
        (settings.output_dir.clone(), settings.next_capture_path())
    };

    handle
        .with_controller_blocking(move |controller| {
            if controller.current_state() == SessionState::Previewing {
                ensure_dir(&output_dir).map_err(|e| {
                    SessionError::RecorderInit(format!(
                        "Failed to create output folder {:?}: {e}",
                        output_dir
                    ))
                })?;
            }
            controller.toggle_recording(&path)
        })
        .await
}

/// Stop recording and preview; returns the final state
pub async fn stop_all(handle: &SessionHandle) -> Result<SessionState, ErrorResponse> {
    handle
        .with_controller_blocking(|controller| Ok(controller.stop()))
        .await
}

/// Leave the error state
pub async fn reset(handle: &SessionHandle) -> Result<(), ErrorResponse> {
    handle
        .with_controller_blocking(|controller| controller.reset())
        .await
}

/// Choose where new recordings go
pub async fn set_output_dir(handle: &SessionHandle, dir: PathBuf) -> Result<(), ErrorResponse> {
    let created = dir.clone();
    tokio::task::spawn_blocking(move || ensure_dir(&created))
        .await
        .map_err(|e| ErrorResponse {
            code: "INTERNAL_ERROR".to_string(),
            message: e.to_string(),
        })?
        .map_err(|e| ErrorResponse {
            code: "IO_ERROR".to_string(),
            message: format!("Failed to create {:?}: {e}", dir),
        })?;

    tracing::info!("Output folder: {:?}", dir);
    handle.settings.write().output_dir = dir;
    Ok(())
}

pub async fn get_session_state(handle: &SessionHandle) -> SessionState {
    handle.controller.lock().await.current_state()
}

pub async fn get_session(handle: &SessionHandle) -> Session {
    handle.controller.lock().await.session()
}

/// Preview frame rate over the last 120 frames
pub async fn get_measured_fps(handle: &SessionHandle) -> f64 {
    handle.controller.lock().await.measured_fps()
}

/// Subscribe to status events
pub async fn subscribe(handle: &SessionHandle) -> broadcast::Receiver<StatusEvent> {
    handle.controller.lock().await.subscribe()
}

/// Preview frames for the UI; only the first caller gets the receiver
pub async fn take_preview_frames(handle: &SessionHandle) -> Option<PreviewReceiver> {
    handle.controller.lock().await.take_preview_receiver()
}

/// Get list of available cameras
pub async fn get_cameras() -> Result<Vec<CameraInfo>, ErrorResponse> {
    tokio::task::spawn_blocking(list_cameras)
        .await
        .map_err(|e| ErrorResponse {
            code: "INTERNAL_ERROR".to_string(),
            message: e.to_string(),
        })
}

/// Get video metadata using ffprobe
pub async fn get_video_metadata(path: PathBuf) -> Result<VideoMetadata, ErrorResponse> {
    if !path.exists() {
        return Err(ErrorResponse {
            code: "NOT_FOUND".to_string(),
            message: format!("Video file not found: {:?}", path),
        });
    }
    tokio::task::spawn_blocking(move || probe_video(&path))
        .await
        .map_err(|e| ErrorResponse {
            code: "INTERNAL_ERROR".to_string(),
            message: e.to_string(),
        })?
        .map_err(|e| ErrorResponse {
            code: "PROBE_ERROR".to_string(),
            message: e.to_string(),
        })
}

/// Whether a source is currently delivering frames
pub async fn is_live(handle: &SessionHandle) -> bool {
    handle.controller.lock().await.current_state().is_live()
}
