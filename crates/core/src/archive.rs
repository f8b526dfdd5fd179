//! Terminal job archive.
//!
//! Finished jobs are written as `<job_id>.json` into the archive directory so a
//! collaborator can show history after the in-memory job is gone.

use crate::delivery::DeliveredArtifact;
use crate::mode::ResolvedStrategy;
use crate::pipeline::{current_timestamp_ms, JobFailure, JobId, JobOutcome, MergeJob};
use crate::progress::JobStage;
use crate::queue::{EntryId, MergeMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub session_id: String,
    pub preference: MergeMode,
    pub strategy: ResolvedStrategy,
    pub entry_ids: Vec<EntryId>,
    pub total_duration_seconds: f64,
    pub total_size_bytes: u64,
    pub output_name: String,
    pub stage: JobStage,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    #[serde(default)]
    pub artifact: Option<DeliveredArtifact>,
    #[serde(default)]
    pub failure: Option<JobFailure>,
}

impl JobRecord {
    pub fn from_job(job: &MergeJob, outcome: &JobOutcome) -> Self {
        let (stage, artifact, failure) = match outcome {
            Ok(artifact) => (JobStage::Done, Some(artifact.clone()), None),
            Err(failure) => (JobStage::Failed, None, Some(failure.clone())),
        };

        Self {
            job_id: job.id,
            session_id: job.snapshot.session_id.clone(),
            preference: job.preference,
            strategy: job.strategy,
            entry_ids: job.snapshot.entries.iter().map(|e| e.id).collect(),
            total_duration_seconds: job.snapshot.total_duration_seconds(),
            total_size_bytes: job.snapshot.total_size_bytes(),
            output_name: job.snapshot.settings.output_file_name(),
            stage,
            started_at_ms: job.started_at_ms,
            finished_at_ms: current_timestamp_ms(),
            artifact,
            failure,
        }
    }
}

/// Writes `record` as `<dir>/<job_id>.json`, creating `dir` if needed.
pub fn save_record(record: &JobRecord, dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(dir.join(format!("{}.json", record.job_id)), json)
}

/// Loads every record in `dir`, oldest first. Unreadable files are skipped.
pub fn load_records(dir: &Path) -> io::Result<Vec<JobRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let parsed = fs::read_to_string(&path).and_then(|content| {
            serde_json::from_str::<JobRecord>(&content)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        });
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job record"),
        }
    }

    records.sort_by_key(|r| r.started_at_ms);
    Ok(records)
}
