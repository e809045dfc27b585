//! Recorder trait definitions

use crate::capture::{Frame, Resolution};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Recorder errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("Recorder init error: {0}")]
    Init(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Flush error: {0}")]
    Flush(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type RecorderResult<T> = Result<T, RecorderError>;

/// Result of a finished recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    /// Path to the finished media file
    pub output_path: PathBuf,

    /// Frames accepted by the encoder
    pub frames_written: u64,

    /// Wall-clock time between the first and last submitted frame
    pub duration_ms: f64,

    /// Nominal frame rate the file was encoded at
    pub fps: u32,

    /// Size of the encoded frames (None if no frame was written)
    pub resolution: Option<Resolution>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Persists frames to a media file.
///
/// A recorder is single use: `start`, any number of `submit`s, then exactly
/// one `finish`. Calls out of that order fail with
/// [`RecorderError::InvalidState`].
pub trait Recorder: Send {
    /// Prepare to write `output_path` at the nominal resolution and rate
    fn start(&mut self, output_path: &Path, resolution: Resolution, fps: u32) -> RecorderResult<()>;

    /// Append one frame
    fn submit(&mut self, frame: &Frame) -> RecorderResult<()>;

    /// Flush and close the file
    fn finish(&mut self) -> RecorderResult<RecordingSummary>;

    /// Frames accepted so far
    fn frames_written(&self) -> u64;
}

/// Makes a fresh recorder for each recording
pub trait RecorderFactory: Send + Sync {
    fn create(&self) -> Box<dyn Recorder>;
}
