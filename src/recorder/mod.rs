//! Recording to media files
//!
//! A [`Recorder`] persists frames while the session is recording. The
//! default implementation encodes through an `ffmpeg` child process.

pub mod ffmpeg;
pub mod probe;
pub mod traits;

pub use ffmpeg::{ffmpeg_available, FfmpegRecorder, FfmpegRecorderFactory};
pub use probe::{count_decoded_frames, probe_video, ProbeError, VideoMetadata};
pub use traits::{Recorder, RecorderError, RecorderFactory, RecorderResult, RecordingSummary};
