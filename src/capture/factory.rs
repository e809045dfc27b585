//! Backend selection
//!
//! The controller asks a [`SourceFactory`] for an opened source and never
//! branches on the backend itself.

use crate::capture::camera::CameraFrameSource;
use crate::capture::gstreamer::GStreamerFrameSource;
use crate::capture::test_pattern::TestPatternSource;
use crate::capture::traits::{
    BackendConfig, BackendKind, CaptureError, CaptureResult, CaptureTarget, FrameSource,
};
use std::sync::Arc;

/// Creates and opens frame sources for a configuration
pub trait SourceFactory: Send + Sync {
    /// Return an opened source. On failure nothing stays allocated.
    fn open(&self, config: &BackendConfig) -> CaptureResult<Arc<dyn FrameSource>>;
}

/// Default factory over the built-in backends
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    /// Fall back to the desktop camera when GStreamer cannot be used
    pub fallback_to_camera: bool,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self {
            fallback_to_camera: true,
        }
    }
}

impl BackendRegistry {
    pub fn new(fallback_to_camera: bool) -> Self {
        Self { fallback_to_camera }
    }

    fn create(kind: BackendKind) -> Arc<dyn FrameSource> {
        match kind {
            BackendKind::Camera => Arc::new(CameraFrameSource::new()),
            BackendKind::GStreamer => Arc::new(GStreamerFrameSource::new()),
            BackendKind::TestPattern => Arc::new(TestPatternSource::new()),
        }
    }

    fn open_kind(config: &BackendConfig) -> CaptureResult<Arc<dyn FrameSource>> {
        let source = Self::create(config.backend);
        match source.open(config) {
            Ok(()) => Ok(source),
            Err(e) => {
                source.close();
                Err(e)
            }
        }
    }

    /// Camera configuration used when GStreamer is unavailable
    fn camera_fallback(config: &BackendConfig) -> Option<BackendConfig> {
        match config.target {
            CaptureTarget::Device(_) => {
                let mut fallback = config.clone();
                fallback.backend = BackendKind::Camera;
                Some(fallback)
            }
            // A hand-written pipeline has no device index to fall back to
            CaptureTarget::Pipeline(_) => None,
        }
    }
}

impl SourceFactory for BackendRegistry {
    fn open(&self, config: &BackendConfig) -> CaptureResult<Arc<dyn FrameSource>> {
        tracing::info!("[VIDEO_BACKEND] {}", config.backend);
        let err = match Self::open_kind(config) {
            Ok(source) => return Ok(source),
            Err(e) => e,
        };

        let fallback = match (&err, config.backend) {
            (CaptureError::BackendUnavailable(_), BackendKind::GStreamer)
                if self.fallback_to_camera =>
            {
                Self::camera_fallback(config)
            }
            _ => None,
        };

        let Some(fallback) = fallback else {
            return Err(err);
        };

        tracing::warn!("[Fallback] GStreamer unavailable ({}); using camera backend", err);
        Self::open_kind(&fallback).map_err(|fallback_err| {
            CaptureError::BackendUnavailable(format!("{err}; fallback failed: {fallback_err}"))
        })
    }
}
