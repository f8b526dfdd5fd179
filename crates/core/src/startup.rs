//! Startup checks for clipmerge
//!
//! Verifies that the external probe and processing tools are installed before any
//! session accepts work:
//! - ffprobe availability check
//! - FFmpeg version check (minimum major version from config)

use clipmerge_config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),
}

/// Check that `<ffprobe> -version` runs successfully.
pub fn check_ffprobe_available(program: &str) -> Result<(), StartupError> {
    let output = Command::new(program).arg("-version").output().map_err(|e| {
        StartupError::FfprobeUnavailable(format!(
            "{} -version failed; is ffprobe installed and in PATH? Error: {}",
            program, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfprobeUnavailable(format!(
            "{} -version exited with {}",
            program, output.status
        )));
    }
    Ok(())
}

/// Parse FFmpeg version output and extract the major version number
///
/// Handles both `ffmpeg version 6.1.1 ...` and git builds such as
/// `ffmpeg version n6.1-12-gabcdef ...`. Returns `None` for snapshot builds
/// (`N-112345-g...`) which carry no release number.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;
    major_str.parse().ok()
}

/// Check that `<ffmpeg> -version` reports at least `min_major`.
pub fn check_ffmpeg_version(program: &str, min_major: u32) -> Result<u32, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::FfmpegVersion(format!("Failed to run {} -version: {}", program, e)))?;

    if !output.status.success() {
        return Err(StartupError::FfmpegVersion(format!("{} -version failed", program)));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < min_major {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got {}",
            min_major, major
        )));
    }
    Ok(major)
}

/// Run all startup checks in order: ffprobe, then ffmpeg.
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_ffprobe_available(&cfg.tools.ffprobe)?;
    let major = check_ffmpeg_version(&cfg.tools.ffmpeg, cfg.tools.min_ffmpeg_major)?;
    info!(ffmpeg_major = major, "external tools available");
    Ok(())
}
