//! Progress event model and the coalescing event channel.
//!
//! The pipeline is the only producer. Consumers may be slow; the channel keeps only
//! the latest event per stage so the producer never blocks on delivery, and the
//! terminal event is always delivered.

use crate::pipeline::{JobFailure, JobId};
use crate::queue::EntryId;
use crate::validation::Warning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Stage of the merge state machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Validating,
    Downloading,
    Merging,
    Uploading,
    Done,
    Failed,
}

impl JobStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Done | JobStage::Failed)
    }

    /// Stages in which a cancellation request interrupts work immediately.
    pub fn is_interruptible(&self) -> bool {
        matches!(self, JobStage::Downloading | JobStage::Merging)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Validating => "validating",
            JobStage::Downloading => "downloading",
            JobStage::Merging => "merging",
            JobStage::Uploading => "uploading",
            JobStage::Done => "done",
            JobStage::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySpeed {
    pub entry_id: EntryId,
    pub bytes_per_sec: f64,
}

/// Transfer speed snapshot for the download stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedMetrics {
    pub bytes_per_sec: f64,
    pub per_entry: Vec<EntrySpeed>,
    pub eta_secs: Option<u64>,
}

/// One progress notification for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub stage: JobStage,
    /// Percent complete within `stage`, 0.0..=100.0.
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<SpeedMetrics>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, stage: JobStage, percent: f64) -> Self {
        Self {
            job_id,
            stage,
            percent: percent.clamp(0.0, 100.0),
            speed: None,
            warnings: Vec::new(),
            failure: None,
        }
    }

    pub fn with_speed(mut self, speed: SpeedMetrics) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<Warning>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn failed(job_id: JobId, failure: JobFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(job_id, JobStage::Failed, 100.0)
        }
    }
}

/// Sink for progress events. Implementations must not block.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Reporter that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report(&self, _event: ProgressEvent) {}
}

#[derive(Default)]
struct Buffer {
    pending: BTreeMap<JobStage, ProgressEvent>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    buffer: Mutex<Buffer>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Buffer> {
        // A panicking producer must not take the consumer down with it.
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Producer half of [`progress_channel`]. Closes the channel when dropped.
pub struct ProgressSender {
    shared: Arc<Shared>,
}

impl ProgressReporter for ProgressSender {
    fn report(&self, event: ProgressEvent) {
        {
            let mut buffer = self.shared.lock();
            if buffer.closed {
                return;
            }
            buffer.pending.insert(event.stage, event);
        }
        self.shared.notify.notify_one();
    }
}

impl Drop for ProgressSender {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

/// Consumer half of [`progress_channel`].
pub struct ProgressStream {
    shared: Arc<Shared>,
}

impl ProgressStream {
    /// Waits for the next event. Returns `None` once the producer is gone and every
    /// buffered event has been delivered.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            {
                let mut buffer = self.shared.lock();
                if let Some((_, event)) = buffer.pending.pop_first() {
                    return Some(event);
                }
                if buffer.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Returns a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.shared.lock().pending.pop_first().map(|(_, event)| event)
    }
}

/// Creates a coalescing single-producer, single-consumer event channel.
pub fn progress_channel() -> (ProgressSender, ProgressStream) {
    let shared = Arc::new(Shared::default());
    (
        ProgressSender {
            shared: shared.clone(),
        },
        ProgressStream { shared },
    )
}

/// Aggregate download accounting across concurrently fetched entries.
///
/// Percent is cumulative over all entries and never decreases.
#[derive(Debug)]
pub struct DownloadTally {
    entry_ids: Vec<EntryId>,
    sizes: Vec<u64>,
    bytes: Vec<u64>,
    completed: Vec<bool>,
    last_percent: f64,
    started: Instant,
}

impl DownloadTally {
    pub fn new(entries: impl IntoIterator<Item = (EntryId, u64)>) -> Self {
        let (entry_ids, sizes): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        let n = entry_ids.len();
        Self {
            entry_ids,
            sizes,
            bytes: vec![0; n],
            completed: vec![false; n],
            last_percent: 0.0,
            started: Instant::now(),
        }
    }

    /// Records the cumulative bytes fetched so far for one entry.
    pub fn update(&mut self, index: usize, bytes: u64) {
        if let Some(slot) = self.bytes.get_mut(index) {
            *slot = (*slot).max(bytes);
        }
    }

    pub fn complete(&mut self, index: usize) {
        if let Some(done) = self.completed.get_mut(index) {
            *done = true;
            self.bytes[index] = self.bytes[index].max(self.sizes[index]);
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.iter().sum()
    }

    pub fn percent(&mut self) -> f64 {
        let expected: u64 = self.sizes.iter().sum();
        let raw = if expected == 0 {
            if self.completed.is_empty() {
                100.0
            } else {
                let done = self.completed.iter().filter(|d| **d).count();
                done as f64 * 100.0 / self.completed.len() as f64
            }
        } else {
            let fetched: u64 = self
                .bytes
                .iter()
                .zip(&self.sizes)
                .map(|(b, s)| (*b).min(*s))
                .sum();
            fetched as f64 * 100.0 / expected as f64
        };

        self.last_percent = self.last_percent.max(raw.clamp(0.0, 100.0));
        self.last_percent
    }

    pub fn speed(&self) -> SpeedMetrics {
        self.speed_at(self.started.elapsed())
    }

    /// Speed as if `elapsed` had passed since the tally started.
    pub fn speed_at(&self, elapsed: Duration) -> SpeedMetrics {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return SpeedMetrics::default();
        }

        let per_entry = self
            .entry_ids
            .iter()
            .zip(&self.bytes)
            .map(|(id, b)| EntrySpeed {
                entry_id: *id,
                bytes_per_sec: *b as f64 / secs,
            })
            .collect();

        let bytes_per_sec = self.total_bytes() as f64 / secs;
        let expected: u64 = self.sizes.iter().sum();
        let remaining = expected.saturating_sub(self.total_bytes());
        let eta_secs = if bytes_per_sec > 0.0 && expected > 0 {
            Some((remaining as f64 / bytes_per_sec).ceil() as u64)
        } else {
            None
        };

        SpeedMetrics {
            bytes_per_sec,
            per_entry,
            eta_secs,
        }
    }
}

/// Formats a remaining-time estimate for humans: `45s`, `3m 12s`, `1h 5m`.
pub fn format_eta(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Formats a transfer rate: `512 B/s`, `1.5 MB/s`.
pub fn format_speed(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_sec.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
