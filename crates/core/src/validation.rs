//! Compatibility validator.
//!
//! Compares the technical metadata of queued entries and reports what would make a
//! stream-copy concatenation unsafe. Pure and side-effect free.

use crate::queue::{EntryId, QueueEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Frame rates closer than this are considered equal (29.97 vs 29.970029...).
const FPS_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningKind {
    CodecMismatch,
    ResolutionMismatch,
    FpsMismatch,
    MissingAudio,
    LargeFile,
}

impl WarningKind {
    /// Whether this kind of warning breaks homogeneity.
    pub fn affects_homogeneity(&self) -> bool {
        matches!(
            self,
            WarningKind::CodecMismatch | WarningKind::ResolutionMismatch | WarningKind::FpsMismatch
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub affected_entry_ids: Vec<EntryId>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub warnings: Vec<Warning>,
    pub is_homogeneous: bool,
}

impl ValidationReport {
    pub fn has(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    pub fn count(&self, kind: WarningKind) -> usize {
        self.warnings.iter().filter(|w| w.kind == kind).count()
    }
}

/// Validates a sequence of entries.
///
/// Emits at most one warning per mismatch kind across the whole queue, plus one
/// `LargeFile` warning per entry over `large_file_threshold` bytes.
pub fn validate(entries: &[QueueEntry], large_file_threshold: u64) -> ValidationReport {
    let mut warnings = Vec::new();
    let all_ids: Vec<EntryId> = entries.iter().map(|e| e.id).collect();

    let codecs: BTreeSet<&str> = entries
        .iter()
        .map(|e| e.metadata.codec_id.as_str())
        .collect();
    if codecs.len() > 1 {
        warnings.push(Warning {
            kind: WarningKind::CodecMismatch,
            affected_entry_ids: all_ids.clone(),
            detail: format!(
                "codecs differ: {}",
                codecs.into_iter().collect::<Vec<_>>().join(", ")
            ),
        });
    }

    let resolutions: BTreeSet<(u32, u32)> = entries
        .iter()
        .map(|e| (e.metadata.width, e.metadata.height))
        .collect();
    if resolutions.len() > 1 {
        let listed: Vec<String> = resolutions
            .iter()
            .map(|(w, h)| format!("{}x{}", w, h))
            .collect();
        warnings.push(Warning {
            kind: WarningKind::ResolutionMismatch,
            affected_entry_ids: all_ids.clone(),
            detail: format!("resolutions differ: {}", listed.join(", ")),
        });
    }

    let rates = distinct_frame_rates(entries);
    if rates.len() > 1 {
        let listed: Vec<String> = rates.iter().map(|r| format!("{:.2}", r)).collect();
        warnings.push(Warning {
            kind: WarningKind::FpsMismatch,
            affected_entry_ids: all_ids.clone(),
            detail: format!("frame rates differ: {}", listed.join(", ")),
        });
    }

    let silent: Vec<EntryId> = entries
        .iter()
        .filter(|e| !e.metadata.has_audio)
        .map(|e| e.id)
        .collect();
    if !silent.is_empty() && silent.len() < entries.len() {
        warnings.push(Warning {
            kind: WarningKind::MissingAudio,
            detail: format!("{} of {} entries have no audio track", silent.len(), entries.len()),
            affected_entry_ids: silent,
        });
    }

    for entry in entries {
        if entry.metadata.file_size_bytes > large_file_threshold {
            warnings.push(Warning {
                kind: WarningKind::LargeFile,
                affected_entry_ids: vec![entry.id],
                detail: format!(
                    "{} is {} bytes (threshold {})",
                    entry.display_name, entry.metadata.file_size_bytes, large_file_threshold
                ),
            });
        }
    }

    let is_homogeneous = !warnings.iter().any(|w| w.kind.affects_homogeneity());
    debug!(
        entries = entries.len(),
        warnings = warnings.len(),
        is_homogeneous,
        "validated queue"
    );

    ValidationReport {
        warnings,
        is_homogeneous,
    }
}

/// Groups frame rates that fall within the tolerance of each other.
fn distinct_frame_rates(entries: &[QueueEntry]) -> Vec<f64> {
    let mut rates: Vec<f64> = Vec::new();
    for entry in entries {
        let rate = entry.metadata.frame_rate;
        if !rates.iter().any(|r| (r - rate).abs() <= FPS_TOLERANCE) {
            rates.push(rate);
        }
    }
    rates
}
