//! Settings
//!
//! Loads settings from environment variables (after reading a `.env` file,
//! if present) and turns them into a [`BackendConfig`] and a
//! [`SessionPolicy`].

use crate::capture::{BackendConfig, BackendKind, CaptureTarget, Resolution};
use crate::session::SessionPolicy;
use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings loaded from the environment
#[derive(Debug, Clone)]
pub struct Settings {
    /// Video backend (default: opencv)
    pub video_backend: BackendKind,

    /// Camera device index (default: 0)
    pub camera_index: u32,

    /// Custom GStreamer source chain; replaces the device-based sources
    pub gst_pipeline: Option<String>,

    /// Try libcamera before v4l2 (default: true)
    pub prefer_libcamera: bool,

    /// Fall back to the camera backend when GStreamer is unavailable
    pub backend_fallback: bool,

    /// Capture resolution (default: 1280x720)
    pub resolution: Resolution,

    /// Capture frame rate (default: 30)
    pub fps: u32,

    /// Inference model (default: ./models/current.onnx)
    pub model_path: PathBuf,

    /// Where recordings go (default: ./output)
    pub output_dir: PathBuf,

    pub stop_timeout: Duration,
    pub max_write_failures: u32,
    pub max_read_failures: u32,
    pub preview_queue_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            video_backend: BackendKind::Camera,
            camera_index: 0,
            gst_pipeline: None,
            prefer_libcamera: true,
            backend_fallback: true,
            resolution: Resolution::default(),
            fps: 30,
            model_path: PathBuf::from("./models/current.onnx"),
            output_dir: PathBuf::from("./output"),
            stop_timeout: Duration::from_secs(3),
            max_write_failures: 5,
            max_read_failures: 10,
            preview_queue_depth: 4,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Settings {
    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {:?}", path);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through `lookup` instead of the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let video_backend = match get("VIDEO_BACKEND") {
            Some(v) => v
                .parse::<BackendKind>()
                .map_err(anyhow::Error::msg)
                .context("VIDEO_BACKEND")?,
            None => defaults.video_backend,
        };

        let camera_index = match get("CAMERA_INDEX") {
            Some(v) => v
                .parse::<u32>()
                .with_context(|| format!("CAMERA_INDEX must be a device number, got {v:?}"))?,
            None => defaults.camera_index,
        };

        let fps = match get("FPS") {
            Some(v) => v
                .parse::<u32>()
                .with_context(|| format!("FPS must be a whole number, got {v:?}"))?,
            None => defaults.fps,
        };

        // A malformed resolution is not fatal
        let resolution = match get("RESOLUTION") {
            Some(v) => v.parse().unwrap_or_else(|e| {
                tracing::warn!("Ignoring RESOLUTION: {}; using {}", e, defaults.resolution);
                defaults.resolution
            }),
            None => defaults.resolution,
        };

        let flag = |key: &str, default: bool| {
            get(key).and_then(|v| parse_bool(&v)).unwrap_or(default)
        };
        let number = |key: &str, default: u64| {
            get(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default)
        };

        Ok(Self {
            video_backend,
            camera_index,
            gst_pipeline: get("GST_PIPELINE"),
            prefer_libcamera: flag("PREFER_LIBCAMERA", defaults.prefer_libcamera),
            backend_fallback: flag("BACKEND_FALLBACK", defaults.backend_fallback),
            resolution,
            fps,
            model_path: get("MODEL_PATH").map(PathBuf::from).unwrap_or(defaults.model_path),
            output_dir: get("OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
            stop_timeout: Duration::from_millis(number(
                "STOP_TIMEOUT_MS",
                defaults.stop_timeout.as_millis() as u64,
            )),
            max_write_failures: number("MAX_WRITE_FAILURES", defaults.max_write_failures as u64)
                as u32,
            max_read_failures: number("MAX_READ_FAILURES", defaults.max_read_failures as u64)
                as u32,
            preview_queue_depth: number(
                "PREVIEW_QUEUE_DEPTH",
                defaults.preview_queue_depth as u64,
            ) as usize,
        })
    }

    /// Backend configuration for the next preview
    pub fn backend_config(&self) -> BackendConfig {
        let target = match (&self.video_backend, &self.gst_pipeline) {
            (BackendKind::GStreamer, Some(pipeline)) => CaptureTarget::Pipeline(pipeline.clone()),
            _ => CaptureTarget::Device(self.camera_index),
        };
        let mut config = BackendConfig::new(self.video_backend, self.resolution, self.fps)
            .with_target(target);
        config.model_path = Some(self.model_path.clone());
        config.prefer_libcamera = self.prefer_libcamera;
        config
    }

    pub fn policy(&self) -> SessionPolicy {
        SessionPolicy {
            stop_timeout: self.stop_timeout,
            max_consecutive_write_failures: self.max_write_failures.max(1),
            max_consecutive_read_failures: self.max_read_failures.max(1),
            preview_queue_depth: self.preview_queue_depth.max(1),
        }
    }

    /// `capture-YYYYmmdd-HHMMSS.mp4` in the output folder
    pub fn next_capture_path(&self) -> PathBuf {
        capture_path_in(&self.output_dir)
    }
}

pub fn capture_path_in(dir: &Path) -> PathBuf {
    dir.join(format!("capture-{}.mp4", Local::now().format("%Y%m%d-%H%M%S")))
}
