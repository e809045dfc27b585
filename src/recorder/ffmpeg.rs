//! FFmpeg-backed recorder
//!
//! Raw frames are piped into an `ffmpeg` child process which encodes and
//! muxes them. The child is spawned on the first frame so the actual frame
//! size and pixel layout are used, not the size the camera was asked for.

use crate::capture::{Frame, PixelFormat, Resolution};
use crate::recorder::traits::{
    Recorder, RecorderError, RecorderFactory, RecorderResult, RecordingSummary,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const DEFAULT_FFMPEG: &str = "ffmpeg";

/// Encoder stderr lines kept for error messages
const STDERR_TAIL_LINES: usize = 20;

/// Output container, chosen from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Mp4,
    Mov,
    Mkv,
    Avi,
}

impl Container {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "mp4" | "m4v" => Some(Container::Mp4),
            "mov" => Some(Container::Mov),
            "mkv" => Some(Container::Mkv),
            "avi" => Some(Container::Avi),
            _ => None,
        }
    }

    /// Encoders to try, best first
    pub fn codec_preference(&self) -> &'static [&'static str] {
        match self {
            Container::Mp4 | Container::Mov => &["libx264", "libopenh264", "mpeg4"],
            Container::Mkv => &["libx264", "mpeg4"],
            Container::Avi => &["mpeg4", "mjpeg"],
        }
    }

    fn faststart(&self) -> bool {
        matches!(self, Container::Mp4 | Container::Mov)
    }
}

/// Whether an ffmpeg binary can be executed
pub fn ffmpeg_available() -> bool {
    Command::new(DEFAULT_FFMPEG)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Names of the video encoders the given ffmpeg binary was built with
fn list_encoders(ffmpeg: &str) -> RecorderResult<Vec<String>> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            RecorderError::Init(format!(
                "FFmpeg not found ({e}). Please install FFmpeg and add it to PATH."
            ))
        })?;

    if !output.status.success() {
        return Err(RecorderError::Init(format!(
            "ffmpeg -encoders failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(parse_encoders(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `ffmpeg -encoders` output (` V....D libx264   description`)
fn parse_encoders(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            (flags.len() == 6 && flags.starts_with('V')).then(|| name.to_string())
        })
        .collect()
}

fn codec_args(codec: &str) -> Vec<String> {
    let args: &[&str] = match codec {
        "libx264" => &["-preset", "veryfast", "-crf", "18", "-pix_fmt", "yuv420p"],
        "libopenh264" => &["-b:v", "6M", "-pix_fmt", "yuv420p"],
        "mjpeg" => &["-q:v", "3", "-pix_fmt", "yuvj420p"],
        _ => &["-q:v", "3", "-pix_fmt", "yuv420p"],
    };
    args.iter().map(|s| s.to_string()).collect()
}

/// Drains the encoder's stderr on its own thread, keeping the last lines.
/// An undrained pipe fills up and stalls the encoder, and with it the
/// thread writing frames.
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    reader: Option<JoinHandle<()>>,
}

impl StderrTail {
    fn spawn(stderr: ChildStderr) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = lines.clone();
        let reader = std::thread::Builder::new()
            .name("ffmpeg-stderr".to_string())
            .spawn(move || {
                for line in BufReader::new(stderr).split(b'\n') {
                    let Ok(line) = line else { break };
                    let line = String::from_utf8_lossy(&line).trim_end().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    tracing::debug!("[ffmpeg] {}", line);
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });

        let reader = match reader {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("Failed to spawn FFmpeg stderr reader: {}", e);
                None
            }
        };
        Self { lines, reader }
    }

    /// Wait for end of stream (the encoder has exited) and return the tail
    fn collect(mut self) -> String {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Running encoder child process
struct EncoderProcess {
    process: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<StderrTail>,
    resolution: Resolution,
    format: PixelFormat,
}

impl EncoderProcess {
    fn spawn(
        ffmpeg: &str,
        output_path: &Path,
        container: Container,
        codec: &str,
        resolution: Resolution,
        format: PixelFormat,
        fps: u32,
    ) -> std::io::Result<Self> {
        let mut cmd = Command::new(ffmpeg);
        cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-nostats"])
            .args(["-f", "rawvideo"])
            .args(["-pixel_format", format.ffmpeg_name()])
            .args(["-video_size", &resolution.to_string()])
            .args(["-framerate", &fps.to_string()])
            .args(["-i", "-"])
            .args(["-c:v", codec])
            .args(codec_args(codec));

        // yuv420p needs even dimensions
        if resolution.width % 2 == 1 || resolution.height % 2 == 1 {
            cmd.args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"]);
        }

        cmd.args(["-g", &(fps * 2).to_string()]);
        if container.faststart() {
            cmd.args(["-movflags", "+faststart"]);
        }

        let mut process = cmd
            .arg(output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = process.stdin.take();
        let stderr = process.stderr.take().map(StderrTail::spawn);

        tracing::info!(
            "Started FFmpeg encoder: {} {} @ {}fps ({}), output: {:?}",
            resolution,
            format.ffmpeg_name(),
            fps,
            codec,
            output_path
        );

        Ok(Self {
            process,
            stdin,
            stderr,
            resolution,
            format,
        })
    }

    fn write_frame(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(data),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "encoder input already closed",
            )),
        }
    }

    /// Close stdin and wait for the muxer to finish the file
    fn finish(mut self) -> Result<(), String> {
        drop(self.stdin.take());
        let status = self
            .process
            .wait()
            .map_err(|e| format!("Failed to wait for FFmpeg: {e}"))?;
        let stderr = self.stderr.take().map(StderrTail::collect).unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(format!("FFmpeg exited with {}: {}", status, stderr.trim()))
        }
    }

    fn kill(&mut self) {
        drop(self.stdin.take());
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

struct ActiveRecording {
    output_path: PathBuf,
    container: Container,
    codec: &'static str,
    fps: u32,
    encoder: Option<EncoderProcess>,
    frames_written: u64,
    first_timestamp: Option<Duration>,
    last_timestamp: Option<Duration>,
    started_at: DateTime<Utc>,
}

enum Phase {
    NotStarted,
    Active(Box<ActiveRecording>),
    Finished,
}

/// Recorder that encodes through an `ffmpeg` child process
pub struct FfmpegRecorder {
    ffmpeg: String,
    phase: Phase,
}

impl FfmpegRecorder {
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_FFMPEG)
    }

    /// Use a specific ffmpeg executable
    pub fn with_binary(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            phase: Phase::NotStarted,
        }
    }

    fn active(&mut self, op: &str) -> RecorderResult<&mut ActiveRecording> {
        match &mut self.phase {
            Phase::Active(active) => Ok(&mut **active),
            Phase::NotStarted => Err(RecorderError::InvalidState(format!(
                "{op} called before start"
            ))),
            Phase::Finished => Err(RecorderError::InvalidState(format!(
                "{op} called after finish"
            ))),
        }
    }
}

impl Default for FfmpegRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder for FfmpegRecorder {
    fn start(&mut self, output_path: &Path, resolution: Resolution, fps: u32) -> RecorderResult<()> {
        if !matches!(self.phase, Phase::NotStarted) {
            return Err(RecorderError::InvalidState(
                "recorder can only be started once".to_string(),
            ));
        }
        if fps == 0 {
            return Err(RecorderError::Init("fps must be greater than zero".to_string()));
        }
        if resolution.width == 0 || resolution.height == 0 {
            return Err(RecorderError::Init(format!("invalid resolution {resolution}")));
        }

        let container = Container::from_path(output_path).ok_or_else(|| {
            RecorderError::Init(format!(
                "unsupported container for {:?} (use .mp4, .mov, .mkv or .avi)",
                output_path
            ))
        })?;

        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RecorderError::Init(format!("Failed to create {:?}: {e}", parent))
            })?;
        }

        // Fail now rather than on the first frame if the path is not writable
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(output_path)
            .map_err(|e| {
                RecorderError::Init(format!("Cannot write {:?}: {e}", output_path))
            })?;

        let encoders = match list_encoders(&self.ffmpeg) {
            Ok(encoders) => encoders,
            Err(e) => {
                let _ = std::fs::remove_file(output_path);
                return Err(e);
            }
        };
        let Some(codec) = container
            .codec_preference()
            .iter()
            .copied()
            .find(|codec| encoders.iter().any(|e| e == codec))
        else {
            let _ = std::fs::remove_file(output_path);
            return Err(RecorderError::Init(format!(
                "no suitable encoder for {:?} (tried {})",
                container,
                container.codec_preference().join(", ")
            )));
        };

        tracing::info!(
            "Recorder ready: {:?} ({:?}/{}) {} @ {}fps",
            output_path,
            container,
            codec,
            resolution,
            fps
        );

        self.phase = Phase::Active(Box::new(ActiveRecording {
            output_path: output_path.to_path_buf(),
            container,
            codec,
            fps,
            encoder: None,
            frames_written: 0,
            first_timestamp: None,
            last_timestamp: None,
            started_at: Utc::now(),
        }));
        Ok(())
    }

    fn submit(&mut self, frame: &Frame) -> RecorderResult<()> {
        let ffmpeg = self.ffmpeg.clone();
        let active = self.active("submit")?;

        if active.encoder.is_none() {
            let encoder = EncoderProcess::spawn(
                &ffmpeg,
                &active.output_path,
                active.container,
                active.codec,
                frame.resolution(),
                frame.format(),
                active.fps,
            )
            .map_err(|e| RecorderError::Write(format!("Failed to start FFmpeg: {e}")))?;
            active.encoder = Some(encoder);
        }

        let Some(encoder) = active.encoder.as_mut() else {
            return Err(RecorderError::Write("encoder not running".to_string()));
        };

        if frame.resolution() != encoder.resolution || frame.format() != encoder.format {
            return Err(RecorderError::Write(format!(
                "frame is {} {:?}, recording is {} {:?}",
                frame.resolution(),
                frame.format(),
                encoder.resolution,
                encoder.format
            )));
        }

        encoder
            .write_frame(frame.data())
            .map_err(|e| RecorderError::Write(format!("Failed to write frame: {e}")))?;

        active.frames_written += 1;
        if active.first_timestamp.is_none() {
            active.first_timestamp = Some(frame.timestamp());
        }
        active.last_timestamp = Some(frame.timestamp());
        Ok(())
    }

    fn finish(&mut self) -> RecorderResult<RecordingSummary> {
        let active = match std::mem::replace(&mut self.phase, Phase::Finished) {
            Phase::Active(active) => active,
            Phase::NotStarted => {
                self.phase = Phase::NotStarted;
                return Err(RecorderError::InvalidState(
                    "finish called before start".to_string(),
                ));
            }
            Phase::Finished => {
                return Err(RecorderError::InvalidState(
                    "recorder already finished".to_string(),
                ))
            }
        };

        let ActiveRecording {
            output_path,
            fps,
            encoder,
            frames_written,
            first_timestamp,
            last_timestamp,
            started_at,
            ..
        } = *active;

        let Some(encoder) = encoder else {
            // Only the writability probe exists on disk
            let _ = std::fs::remove_file(&output_path);
            return Err(RecorderError::Flush(format!(
                "no frames were recorded to {:?}",
                output_path
            )));
        };
        let resolution = encoder.resolution;

        encoder.finish().map_err(RecorderError::Flush)?;

        let size = std::fs::metadata(&output_path)
            .map(|m| m.len())
            .map_err(|e| RecorderError::Flush(format!("{:?} missing after encode: {e}", output_path)))?;
        if size == 0 {
            return Err(RecorderError::Flush(format!("{:?} is empty", output_path)));
        }

        let duration_ms = match (first_timestamp, last_timestamp) {
            (Some(first), Some(last)) => (last - first).as_secs_f64() * 1000.0,
            _ => 0.0,
        };

        tracing::info!(
            "Recording finished: {:?} ({} frames, {} bytes)",
            output_path,
            frames_written,
            size
        );

        Ok(RecordingSummary {
            output_path,
            frames_written,
            duration_ms,
            fps,
            resolution: Some(resolution),
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn frames_written(&self) -> u64 {
        match &self.phase {
            Phase::Active(active) => active.frames_written,
            _ => 0,
        }
    }
}

impl Drop for FfmpegRecorder {
    fn drop(&mut self) {
        if let Phase::Active(active) = &mut self.phase {
            if let Some(encoder) = active.encoder.as_mut() {
                tracing::warn!("Recorder dropped while active; killing FFmpeg");
                encoder.kill();
            }
        }
    }
}

/// Creates [`FfmpegRecorder`]s
#[derive(Debug, Clone)]
pub struct FfmpegRecorderFactory {
    ffmpeg: String,
}

impl FfmpegRecorderFactory {
    pub fn new() -> Self {
        Self {
            ffmpeg: DEFAULT_FFMPEG.to_string(),
        }
    }

    pub fn with_binary(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl Default for FfmpegRecorderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RecorderFactory for FfmpegRecorderFactory {
    fn create(&self) -> Box<dyn Recorder> {
        Box::new(FfmpegRecorder::with_binary(self.ffmpeg.clone()))
    }
}
