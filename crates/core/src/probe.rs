//! Metadata probe adapter.
//!
//! Extracts the technical metadata the merge core needs (resolution, duration,
//! codec, frame rate, audio presence, size) from a media reference using ffprobe.
//! The rest of the crate only sees [`MediaMetadata`]; ffprobe's JSON shape stays here.

use crate::queue::SourceRef;
use serde::{Deserialize, Serialize};
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The file was readable but is not a usable video.
    #[error("Invalid media: {0}")]
    InvalidMedia(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Technical metadata attached to every queue entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaMetadata {
    pub width: u32,
    pub height: u32,
    pub duration_seconds: f64,
    pub frame_rate: f64,
    /// Video codec name as reported by the prober (e.g. "h264", "hevc").
    pub codec_id: String,
    pub has_audio: bool,
    pub file_size_bytes: u64,
}

/// Anything that can turn a media reference into [`MediaMetadata`].
///
/// Calls are synchronous; async callers run them on the blocking pool.
pub trait MetadataProbe: Send + Sync {
    fn probe(&self, source: &SourceRef) -> Result<MediaMetadata, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// ffprobe-backed [`MetadataProbe`].
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: String,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl MetadataProbe for FfprobeProbe {
    /// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <source>`
    /// and parses the JSON output.
    fn probe(&self, source: &SourceRef) -> Result<MediaMetadata, ProbeError> {
        let output = Command::new(&self.program)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(source.as_str())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut metadata = parse_ffprobe_output(&stdout)?;

        // Some containers omit format.size; fall back to the filesystem for local files.
        if metadata.file_size_bytes == 0 {
            if let Ok(meta) = std::fs::metadata(source.as_str()) {
                metadata.file_size_bytes = meta.len();
            }
        }

        Ok(metadata)
    }
}

/// Parses an ffprobe rational frame rate such as `30000/1001` or `25`.
///
/// Returns `None` for malformed input and for `0/0`, which ffprobe emits when unknown.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };

    if rate.is_finite() && rate > 0.0 {
        Some(rate)
    } else {
        None
    }
}

/// Parses ffprobe JSON output into [`MediaMetadata`].
///
/// The first video stream provides codec, resolution and frame rate. A file without
/// a video stream, or with a non-positive duration, is rejected as invalid media.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaMetadata, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::InvalidMedia("no video streams".to_string()))?;

    let has_audio = streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let frame_rate = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.avg_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(0.0);

    let duration_seconds = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
        return Err(ProbeError::InvalidMedia(format!(
            "invalid duration ({})",
            duration_seconds
        )));
    }

    let file_size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(MediaMetadata {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        duration_seconds,
        frame_rate,
        codec_id: video.codec_name.clone().unwrap_or_default(),
        has_audio,
        file_size_bytes,
    })
}
