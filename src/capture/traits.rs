//! Capture trait definitions
//!
//! Backend-agnostic types shared by every frame source.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Capture errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Read error: {0}")]
    Read(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// Parses `WIDTHxHEIGHT`, case-insensitive on the separator
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let (w, h) = lower
            .split_once('x')
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width: u32 = w.trim().parse().map_err(|_| format!("invalid width in {s:?}"))?;
        let height: u32 = h.trim().parse().map_err(|_| format!("invalid height in {s:?}"))?;
        Ok(Self::new(width, height))
    }
}

/// Pixel layout of a decoded frame (packed, 8 bits per channel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Bgr24,
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        3
    }

    /// FFmpeg `-pixel_format` name
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgb24 => "rgb24",
        }
    }
}

/// An immutable decoded frame.
///
/// The pixel buffer is reference counted, so cloning a frame to hand it to
/// both the preview queue and the recorder does not copy pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    resolution: Resolution,
    format: PixelFormat,
    sequence: u64,
    timestamp: Duration,
}

impl Frame {
    /// Build a frame, checking the buffer length against the dimensions
    pub fn new(
        data: impl Into<Arc<[u8]>>,
        resolution: Resolution,
        format: PixelFormat,
        sequence: u64,
        timestamp: Duration,
    ) -> CaptureResult<Self> {
        let data = data.into();
        let expected = resolution.pixel_count() * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(CaptureError::Read(format!(
                "frame buffer is {} bytes, expected {} for {} {:?}",
                data.len(),
                expected,
                resolution,
                format
            )));
        }
        Ok(Self {
            data,
            resolution,
            format,
            sequence,
            timestamp,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Position of this frame in its source's stream, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capture time relative to when the source was opened
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }
}

/// Hands out sequence numbers and strictly increasing capture timestamps
#[derive(Debug)]
pub struct FrameClock {
    origin: Instant,
    next_sequence: u64,
    last: Option<Duration>,
}

impl FrameClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
            next_sequence: 0,
            last: None,
        }
    }

    /// Stamp the frame captured now: `(sequence, timestamp)`
    pub fn tick(&mut self) -> (u64, Duration) {
        let mut ts = self.origin.elapsed();
        if let Some(last) = self.last {
            if ts <= last {
                ts = last + Duration::from_nanos(1);
            }
        }
        self.last = Some(ts);
        let seq = self.next_sequence;
        self.next_sequence += 1;
        (seq, ts)
    }
}

/// Which video backend a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Desktop camera capture by device index (configured as `opencv`)
    #[serde(rename = "opencv", alias = "camera")]
    Camera,
    /// GStreamer pipeline (production/embedded)
    GStreamer,
    /// Synthetic test pattern
    #[serde(rename = "testsrc")]
    TestPattern,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Camera => "opencv",
            BackendKind::GStreamer => "gstreamer",
            BackendKind::TestPattern => "testsrc",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "opencv" | "camera" | "native" => Ok(BackendKind::Camera),
            "gstreamer" | "gst" => Ok(BackendKind::GStreamer),
            "testsrc" | "test" | "synthetic" => Ok(BackendKind::TestPattern),
            other => Err(format!("unknown video backend {other:?}")),
        }
    }
}

/// What to capture from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureTarget {
    /// Camera device index (`/dev/videoN` for GStreamer)
    Device(u32),
    /// Source part of a GStreamer pipeline description
    Pipeline(String),
}

impl Default for CaptureTarget {
    fn default() -> Self {
        CaptureTarget::Device(0)
    }
}

/// Backend configuration, immutable for the lifetime of a preview
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub backend: BackendKind,
    pub target: CaptureTarget,
    pub resolution: Resolution,
    pub fps: u32,
    pub model_path: Option<PathBuf>,
    /// Try `libcamerasrc` before `v4l2src` when building GStreamer pipelines
    #[serde(default = "default_prefer_libcamera")]
    pub prefer_libcamera: bool,
}

fn default_prefer_libcamera() -> bool {
    true
}

impl BackendConfig {
    pub fn new(backend: BackendKind, resolution: Resolution, fps: u32) -> Self {
        Self {
            backend,
            target: CaptureTarget::default(),
            resolution,
            fps,
            model_path: None,
            prefer_libcamera: true,
        }
    }

    pub fn with_target(mut self, target: CaptureTarget) -> Self {
        self.target = target;
        self
    }

    /// Reject configurations no backend can satisfy
    pub fn validate(&self) -> CaptureResult<()> {
        if self.fps == 0 {
            return Err(CaptureError::BackendUnavailable(
                "fps must be greater than zero".to_string(),
            ));
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(CaptureError::BackendUnavailable(format!(
                "invalid resolution {}",
                self.resolution
            )));
        }
        Ok(())
    }

    /// Size in bytes of one BGR frame at the configured resolution
    pub fn frame_size(&self) -> usize {
        self.resolution.pixel_count() * PixelFormat::Bgr24.bytes_per_pixel()
    }
}

/// Information about a camera/webcam
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,

    /// Supported resolutions
    pub supported_resolutions: Vec<Resolution>,
}

/// A camera or pipeline producing decoded frames.
///
/// Methods take `&self` so that one thread can block in
/// [`read_frame`](FrameSource::read_frame) while another calls
/// [`close`](FrameSource::close); closing must unblock the reader.
pub trait FrameSource: Send + Sync {
    /// Backend implementing this source
    fn backend(&self) -> BackendKind;

    /// Allocate the capture resource. Callable at most once per instance.
    fn open(&self, config: &BackendConfig) -> CaptureResult<()>;

    /// Block until the next frame is available.
    ///
    /// Returns [`CaptureError::EndOfStream`] once the source is closed or
    /// the backend stops producing frames.
    fn read_frame(&self) -> CaptureResult<Frame>;

    /// Release the capture resource. Idempotent.
    fn close(&self);

    /// Whether the source is open and not yet closed
    fn is_open(&self) -> bool;
}
