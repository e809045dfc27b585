//! Inspect finished recordings with ffprobe/ffmpeg

use serde::{Deserialize, Serialize};
use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to run {0}: {1}")]
    Spawn(&'static str, std::io::Error),

    #[error("{0} failed: {1}")]
    Failed(&'static str, String),

    #[error("Failed to parse ffprobe output: {0}")]
    Parse(String),
}

/// Video file metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_ms: f64,
    /// Decoded frame count, when ffprobe could count them
    pub frame_count: Option<u64>,
    pub codec: String,
}

/// Parse an ffprobe rate ("30/1", "30000/1001" or "29.97")
fn parse_frame_rate(rate: &str) -> f64 {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(1.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => rate.parse().unwrap_or(0.0),
    }
}

fn parse_metadata(json: &serde_json::Value) -> Result<VideoMetadata, ProbeError> {
    let stream = json
        .get("streams")
        .and_then(|s| s.as_array())
        .and_then(|s| s.first())
        .ok_or_else(|| ProbeError::Parse("no video stream found".to_string()))?;

    let width = stream.get("width").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let height = stream.get("height").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let codec = stream
        .get("codec_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let fps = stream
        .get("r_frame_rate")
        .and_then(|v| v.as_str())
        .map(parse_frame_rate)
        .unwrap_or(0.0);
    let frame_count = stream
        .get("nb_read_frames")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<u64>().ok());

    // Container duration is more reliable than the stream's
    let duration_secs = json
        .get("format")
        .and_then(|f| f.get("duration"))
        .and_then(|d| d.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(VideoMetadata {
        width,
        height,
        fps,
        duration_ms: duration_secs * 1000.0,
        frame_count,
        codec,
    })
}

/// Get video metadata using ffprobe
pub fn probe_video(path: &Path) -> Result<VideoMetadata, ProbeError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-count_frames",
            "-show_streams",
            "-show_format",
            "-select_streams",
            "v:0",
        ])
        .arg(path)
        .output()
        .map_err(|e| ProbeError::Spawn("ffprobe", e))?;

    if !output.status.success() {
        return Err(ProbeError::Failed(
            "ffprobe",
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let json: serde_json::Value =
        serde_json::from_slice(&output.stdout).map_err(|e| ProbeError::Parse(e.to_string()))?;
    parse_metadata(&json)
}

/// Decode every frame of the file and count them
pub fn count_decoded_frames(path: &Path) -> Result<u64, ProbeError> {
    let metadata = probe_video(path)?;
    if metadata.width == 0 || metadata.height == 0 {
        return Err(ProbeError::Parse(format!(
            "{:?} has no usable video dimensions",
            path
        )));
    }

    // -s pins the output size so every frame is exactly frame_size bytes
    let mut process = Command::new("ffmpeg")
        .args(["-v", "error", "-i"])
        .arg(path)
        .args([
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
            &format!("{}x{}", metadata.width, metadata.height),
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ProbeError::Spawn("ffmpeg", e))?;

    let frame_size = metadata.width as usize * metadata.height as usize * 3;
    let stdout = process
        .stdout
        .take()
        .ok_or_else(|| ProbeError::Failed("ffmpeg", "failed to capture stdout".to_string()))?;
    let mut reader = BufReader::with_capacity(frame_size * 2, stdout);
    let mut buffer = vec![0u8; frame_size];
    let mut frames = 0u64;

    let read_result = loop {
        match reader.read_exact(&mut buffer) {
            Ok(()) => frames += 1,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    let status = process.wait().map_err(|e| ProbeError::Spawn("ffmpeg", e))?;
    read_result.map_err(|e| ProbeError::Failed("ffmpeg", format!("read error: {e}")))?;
    if !status.success() {
        return Err(ProbeError::Failed("ffmpeg", format!("decoder exited with {status}")));
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("30/1"), 30.0);
        assert!((parse_frame_rate("30000/1001") - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25"), 25.0);
        assert_eq!(parse_frame_rate("0/0"), 0.0);
    }

    #[test]
    fn test_parse_metadata() {
        let json = serde_json::json!({
            "streams": [{
                "codec_name": "h264",
                "width": 1280,
                "height": 720,
                "r_frame_rate": "30/1",
                "nb_read_frames": "90"
            }],
            "format": { "duration": "3.000000" }
        });
        let metadata = parse_metadata(&json).unwrap();
        assert_eq!(metadata.codec, "h264");
        assert_eq!((metadata.width, metadata.height), (1280, 720));
        assert_eq!(metadata.frame_count, Some(90));
        assert_eq!(metadata.duration_ms, 3000.0);
    }

    #[test]
    fn test_parse_metadata_without_streams() {
        let json = serde_json::json!({ "streams": [] });
        assert!(matches!(parse_metadata(&json), Err(ProbeError::Parse(_))));
    }
}
