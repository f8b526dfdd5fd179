//! Mode selection and re-encode target resolution.

use crate::queue::{AudioPolicy, FpsSetting, MergeMode, MergeSettings, QueueEntry};
use crate::validation::ValidationReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame rate used when no entry reports a usable one.
const FALLBACK_FPS: f64 = 30.0;

/// Concrete concatenation approach for a job. Never `Smart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolvedStrategy {
    /// Stream-level concatenation without re-encoding.
    Fast,
    /// Full re-encode to a common target.
    Safe,
}

impl fmt::Display for ResolvedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ResolvedStrategy::Fast => "FAST",
            ResolvedStrategy::Safe => "SAFE",
        })
    }
}

/// Maps the user's preference and the validator's verdict to a strategy.
pub fn resolve_strategy(preference: MergeMode, report: &ValidationReport) -> ResolvedStrategy {
    match preference {
        MergeMode::Fast => ResolvedStrategy::Fast,
        MergeMode::Safe => ResolvedStrategy::Safe,
        MergeMode::Smart if report.is_homogeneous => ResolvedStrategy::Fast,
        MergeMode::Smart => ResolvedStrategy::Safe,
    }
}

/// Common output parameters for a re-encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeTarget {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub audio: AudioPolicy,
}

impl MergeTarget {
    /// Resolves `Auto` settings to the maximum found among the entries.
    pub fn resolve(entries: &[QueueEntry], settings: &MergeSettings) -> Self {
        let (width, height) = settings.resolution.dimensions().unwrap_or_else(|| {
            let width = entries.iter().map(|e| e.metadata.width).max().unwrap_or(0);
            let height = entries.iter().map(|e| e.metadata.height).max().unwrap_or(0);
            (even(width), even(height))
        });

        let fps = match settings.fps {
            FpsSetting::Fixed(fps) => fps as f64,
            FpsSetting::Auto => entries
                .iter()
                .map(|e| e.metadata.frame_rate)
                .filter(|r| r.is_finite() && *r > 0.0)
                .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))))
                .unwrap_or(FALLBACK_FPS),
        };

        Self {
            width,
            height,
            fps,
            audio: settings.audio,
        }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Rounds up to the next even number; most encoders reject odd dimensions.
fn even(value: u32) -> u32 {
    value.saturating_add(value % 2)
}
