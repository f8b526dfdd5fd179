//! Queue store for pending merge entries.
//!
//! A [`MergeQueue`] belongs to exactly one session. It owns the ordered entries and the
//! user's merge settings, and enforces capacity, id uniqueness and atomic mutations.

use crate::probe::{MediaMetadata, MetadataProbe, ProbeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default maximum number of entries in a queue.
pub const DEFAULT_CAPACITY: usize = 20;

/// Output name used when the user never picked one.
pub const DEFAULT_OUTPUT_NAME: &str = "merged_video.mp4";

/// Error type for queue mutations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue is full ({capacity} entries)")]
    CapacityExceeded { capacity: usize },

    #[error("No queue entry with id {0}")]
    NotFound(EntryId),

    #[error("Source {0} is already queued")]
    Duplicate(SourceRef),

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),
}

/// Opaque handle to a media source, owned by the download collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRef(String);

impl SourceRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(EntryId)
            .map_err(|e| format!("invalid entry id '{}': {}", s, e))
    }
}

/// A media item the user wants to add, before metadata is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryCandidate {
    pub source_ref: SourceRef,
    pub display_name: String,
}

impl EntryCandidate {
    pub fn new(source_ref: SourceRef, display_name: impl Into<String>) -> Self {
        Self {
            source_ref,
            display_name: display_name.into(),
        }
    }
}

/// One queued media item with its probed metadata. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: EntryId,
    pub source_ref: SourceRef,
    pub display_name: String,
    #[serde(flatten)]
    pub metadata: MediaMetadata,
    pub added_at_sequence: u64,
}

/// Concatenation strategy preference chosen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Stream copy, no re-encode.
    Fast,
    /// Always re-encode to a common target.
    Safe,
    /// Fast when the queue is homogeneous, safe otherwise.
    #[default]
    Smart,
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeMode::Fast => write!(f, "fast"),
            MergeMode::Safe => write!(f, "safe"),
            MergeMode::Smart => write!(f, "smart"),
        }
    }
}

impl FromStr for MergeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(MergeMode::Fast),
            "safe" => Ok(MergeMode::Safe),
            "smart" => Ok(MergeMode::Smart),
            other => Err(format!("unknown merge mode '{}'", other)),
        }
    }
}

/// Target resolution for re-encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResolutionSetting {
    /// Largest resolution found in the queue.
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "2160p")]
    P2160,
}

impl ResolutionSetting {
    /// Fixed output box for explicit settings, `None` for `Auto`.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            ResolutionSetting::Auto => None,
            ResolutionSetting::P720 => Some((1280, 720)),
            ResolutionSetting::P1080 => Some((1920, 1080)),
            ResolutionSetting::P2160 => Some((3840, 2160)),
        }
    }
}

impl FromStr for ResolutionSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(ResolutionSetting::Auto),
            "720" | "720p" => Ok(ResolutionSetting::P720),
            "1080" | "1080p" => Ok(ResolutionSetting::P1080),
            "4k" | "2160" | "2160p" => Ok(ResolutionSetting::P2160),
            other => Err(format!("unknown resolution '{}'", other)),
        }
    }
}

/// Target frame rate for re-encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FpsSetting {
    /// Highest frame rate found in the queue.
    #[default]
    Auto,
    Fixed(u32),
}

impl FromStr for FpsSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "auto" {
            return Ok(FpsSetting::Auto);
        }
        match s.parse::<u32>() {
            Ok(fps) if fps > 0 => Ok(FpsSetting::Fixed(fps)),
            _ => Err(format!("invalid fps '{}'", s)),
        }
    }
}

/// What happens to audio tracks in the merged output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioPolicy {
    /// Keep audio; entries without audio contribute silence.
    #[default]
    KeepAll,
    /// Drop audio entirely.
    Remove,
}

impl FromStr for AudioPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "keep_all" | "keep" => Ok(AudioPolicy::KeepAll),
            "remove" | "none" | "mute" => Ok(AudioPolicy::Remove),
            other => Err(format!("unknown audio policy '{}'", other)),
        }
    }
}

/// Per-queue merge settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeSettings {
    pub mode: MergeMode,
    pub resolution: ResolutionSetting,
    pub fps: FpsSetting,
    pub audio: AudioPolicy,
    pub output_name: Option<String>,
}

impl MergeSettings {
    /// Output file name with the defaulting and extension rules applied.
    pub fn output_file_name(&self) -> String {
        match &self.output_name {
            Some(name) => normalize_output_name(name),
            None => DEFAULT_OUTPUT_NAME.to_string(),
        }
    }
}

/// Partial settings update; `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsUpdate {
    pub mode: Option<MergeMode>,
    pub resolution: Option<ResolutionSetting>,
    pub fps: Option<FpsSetting>,
    pub audio: Option<AudioPolicy>,
    pub output_name: Option<String>,
}

/// Direction for [`MergeQueue::move_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// Immutable copy of a queue taken when a merge starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub session_id: String,
    pub entries: Vec<QueueEntry>,
    pub settings: MergeSettings,
}

impl QueueSnapshot {
    pub fn total_duration_seconds(&self) -> f64 {
        self.entries.iter().map(|e| e.metadata.duration_seconds).sum()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.metadata.file_size_bytes).sum()
    }
}

/// Ordered collection of entries for one session.
#[derive(Debug, Clone)]
pub struct MergeQueue {
    session_id: String,
    entries: Vec<QueueEntry>,
    capacity: usize,
    settings: MergeSettings,
    next_sequence: u64,
}

impl MergeQueue {
    pub fn new(session_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            session_id: session_id.into(),
            entries: Vec::new(),
            capacity,
            settings: MergeSettings::default(),
            next_sequence: 1,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn settings(&self) -> &MergeSettings {
        &self.settings
    }

    pub fn get(&self, id: EntryId) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Checks capacity and duplicates without mutating anything.
    pub fn check_can_add(&self, candidate: &EntryCandidate) -> Result<(), QueueError> {
        if self.entries.len() >= self.capacity {
            return Err(QueueError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        if self
            .entries
            .iter()
            .any(|e| e.source_ref == candidate.source_ref)
        {
            return Err(QueueError::Duplicate(candidate.source_ref.clone()));
        }
        Ok(())
    }

    /// Probes the candidate and appends it.
    ///
    /// Nothing is added when the queue is full, the source is already queued, or
    /// the probe fails.
    pub fn add(
        &mut self,
        candidate: EntryCandidate,
        probe: &dyn MetadataProbe,
    ) -> Result<&QueueEntry, QueueError> {
        self.check_can_add(&candidate)?;
        let metadata = probe.probe(&candidate.source_ref).map_err(|e| {
            warn!(session = %self.session_id, source = %candidate.source_ref, error = %e, "probe failed, entry not added");
            e
        })?;
        self.add_with_metadata(candidate, metadata)
    }

    /// Appends a candidate whose metadata was probed elsewhere.
    pub fn add_with_metadata(
        &mut self,
        candidate: EntryCandidate,
        metadata: MediaMetadata,
    ) -> Result<&QueueEntry, QueueError> {
        self.check_can_add(&candidate)?;

        let entry = QueueEntry {
            id: EntryId::new(),
            source_ref: candidate.source_ref,
            display_name: candidate.display_name,
            metadata,
            added_at_sequence: self.next_sequence,
        };
        self.next_sequence += 1;

        info!(
            session = %self.session_id,
            entry = %entry.id,
            name = %entry.display_name,
            total = self.entries.len() + 1,
            "entry added to queue"
        );
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Removes an entry, keeping the relative order of the others.
    pub fn remove(&mut self, id: EntryId) -> Result<QueueEntry, QueueError> {
        let index = self.index_of(id)?;
        let entry = self.entries.remove(index);
        info!(session = %self.session_id, entry = %id, "entry removed from queue");
        Ok(entry)
    }

    /// Swaps an entry with its neighbour. Returns `false` when the entry already sits
    /// at the boundary in that direction.
    pub fn move_entry(&mut self, id: EntryId, direction: Direction) -> Result<bool, QueueError> {
        let index = self.index_of(id)?;
        let target = match direction {
            Direction::Up if index > 0 => index - 1,
            Direction::Down if index + 1 < self.entries.len() => index + 1,
            _ => {
                debug!(session = %self.session_id, entry = %id, ?direction, "move at boundary ignored");
                return Ok(false);
            }
        };

        self.entries.swap(index, target);
        debug!(session = %self.session_id, entry = %id, from = index, to = target, "entry moved");
        Ok(true)
    }

    /// Empties the queue and returns the removed entries.
    pub fn clear(&mut self) -> Vec<QueueEntry> {
        info!(session = %self.session_id, removed = self.entries.len(), "queue cleared");
        std::mem::take(&mut self.entries)
    }

    pub fn update_settings(&mut self, update: SettingsUpdate) {
        if let Some(mode) = update.mode {
            self.settings.mode = mode;
        }
        if let Some(resolution) = update.resolution {
            self.settings.resolution = resolution;
        }
        if let Some(fps) = update.fps {
            self.settings.fps = fps;
        }
        if let Some(audio) = update.audio {
            self.settings.audio = audio;
        }
        if let Some(name) = update.output_name {
            self.settings.output_name = Some(name);
        }
        debug!(session = %self.session_id, settings = ?self.settings, "settings updated");
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            session_id: self.session_id.clone(),
            entries: self.entries.clone(),
            settings: self.settings.clone(),
        }
    }

    pub fn total_duration_seconds(&self) -> f64 {
        self.entries.iter().map(|e| e.metadata.duration_seconds).sum()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.metadata.file_size_bytes).sum()
    }

    fn index_of(&self, id: EntryId) -> Result<usize, QueueError> {
        self.entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(QueueError::NotFound(id))
    }
}

/// Formats seconds as `HH:MM:SS`.
pub fn format_duration(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Turns a user-supplied output name into a safe file name.
///
/// Path separators are stripped, an empty result falls back to the default name,
/// and a name without extension gets `.mp4`.
pub fn normalize_output_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim().to_string();

    if cleaned.is_empty() {
        return DEFAULT_OUTPUT_NAME.to_string();
    }

    if std::path::Path::new(&cleaned).extension().is_some() {
        cleaned
    } else {
        format!("{}.mp4", cleaned)
    }
}
