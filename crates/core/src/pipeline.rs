//! Merge execution pipeline.
//!
//! Drives one [`MergeJob`] through `Validating → Downloading → Merging → Uploading`
//! and ends in `Done` or `Failed`. Stages run strictly in order; only the download
//! stage fans out, bounded by the configured concurrency.

use crate::archive::{save_record, JobRecord};
use crate::concurrency::ResourcePlan;
use crate::delivery::{check_delivery_limit, DeliveredArtifact, DeliveryCheck, DeliveryChannel};
use crate::fetch::{FetchError, FetchProgress, SourceFetcher};
use crate::metrics::{JobMetrics, SharedMetrics};
use crate::mode::{resolve_strategy, MergeTarget, ResolvedStrategy};
use crate::probe::MetadataProbe;
use crate::progress::{DownloadTally, JobStage, ProgressEvent, ProgressReporter, SpeedMetrics};
use crate::queue::{EntryId, MergeMode, QueueSnapshot, SourceRef};
use crate::tool::{MergeInput, MergeRequest, MergeTool, ToolError};
use crate::validation::{validate, ValidationReport};
use crate::workspace::{JobWorkspace, StorageLedger};
use clipmerge_config::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A FAST output shorter than this share of the summed input durations is treated as
/// a broken concatenation.
const FAST_MIN_DURATION_RATIO: f64 = 0.9;

/// Merge speed factors: processing seconds per second of media.
const FAST_SPEED_FACTOR: f64 = 0.02;
const SAFE_SPEED_FACTOR_1080P: f64 = 0.5;
const PIXELS_1080P: f64 = 1920.0 * 1080.0;

/// The ticker never claims completion; only the tool returning does.
const MAX_ESTIMATED_PERCENT: f64 = 99.0;

/// Upper bound for a merge estimate, whatever the probed durations claim.
const MAX_MERGE_ESTIMATE: Duration = Duration::from_secs(48 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured cause of a failed job.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("Failed to fetch entry {entry_id}: {cause}")]
    Fetch { entry_id: EntryId, cause: String },

    #[error("{strategy} merge failed (exit code {exit_code:?}): {diagnostic}")]
    Merge {
        strategy: ResolvedStrategy,
        exit_code: Option<i32>,
        diagnostic: String,
    },

    #[error("Delivery failed: {reason}")]
    Delivery {
        reason: String,
        size: Option<u64>,
        limit: Option<u64>,
    },

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Storage error: {reason}")]
    Storage { reason: String },
}

/// Terminal failure: the stage it happened in plus the cause.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{stage} stage failed: {error}")]
pub struct JobFailure {
    pub stage: JobStage,
    pub error: PipelineError,
}

impl JobFailure {
    pub fn new(stage: JobStage, error: PipelineError) -> Self {
        Self { stage, error }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error == PipelineError::Cancelled
    }

    /// Entries the failure can be pinned on, if any.
    pub fn affected_entry_ids(&self) -> Vec<EntryId> {
        match &self.error {
            PipelineError::Fetch { entry_id, .. } => vec![*entry_id],
            _ => Vec::new(),
        }
    }
}

/// What a finished job hands back, exactly once.
pub type JobOutcome = Result<DeliveredArtifact, JobFailure>;

/// One merge execution with its frozen inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeJob {
    pub id: JobId,
    pub snapshot: QueueSnapshot,
    /// What the user asked for.
    pub preference: MergeMode,
    /// What will actually run. Fixed at creation.
    pub strategy: ResolvedStrategy,
    pub stage: JobStage,
    pub progress: BTreeMap<JobStage, f64>,
    pub speed: Option<SpeedMetrics>,
    pub started_at_ms: i64,
}

impl MergeJob {
    /// Freezes a snapshot and resolves its strategy against `report`.
    pub fn create(snapshot: QueueSnapshot, report: &ValidationReport) -> Self {
        let preference = snapshot.settings.mode;
        Self {
            id: JobId::new(),
            strategy: resolve_strategy(preference, report),
            preference,
            snapshot,
            stage: JobStage::Validating,
            progress: BTreeMap::new(),
            speed: None,
            started_at_ms: current_timestamp_ms(),
        }
    }

    fn to_metrics(&self) -> JobMetrics {
        JobMetrics {
            id: self.id.to_string(),
            session_id: self.snapshot.session_id.clone(),
            stage: self.stage.as_str().to_string(),
            strategy: self.strategy.to_string(),
            percent: self.progress.get(&self.stage).copied().unwrap_or(0.0) as f32,
            bytes_per_sec: self.speed.as_ref().map(|s| s.bytes_per_sec).unwrap_or(0.0),
            entries: self.snapshot.entries.len(),
            total_bytes: self.snapshot.total_size_bytes(),
        }
    }
}

pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Tunables for the pipeline, resolved from [`Config`] and the [`ResourcePlan`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub temp_dir: PathBuf,
    pub download_concurrency: usize,
    pub tool_slots: usize,
    pub large_file_threshold: u64,
    pub min_output_bytes: u64,
    pub progress_interval: Duration,
    pub archive_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_config(cfg: &Config, plan: &ResourcePlan) -> Self {
        Self {
            temp_dir: cfg.storage.temp_dir.clone(),
            download_concurrency: plan.download_concurrency.max(1),
            tool_slots: plan.tool_slots.max(1),
            large_file_threshold: cfg.queue.large_file_threshold_bytes,
            min_output_bytes: cfg.pipeline.min_output_bytes,
            progress_interval: Duration::from_millis(cfg.pipeline.progress_interval_ms.max(10)),
            archive_dir: cfg.storage.archive_dir.clone(),
        }
    }
}

/// External collaborators the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn MetadataProbe>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub tool: Arc<dyn MergeTool>,
    pub delivery: Arc<dyn DeliveryChannel>,
}

/// Estimated wall time of the merge stage.
pub fn estimate_merge_duration(
    total_media_secs: f64,
    strategy: ResolvedStrategy,
    target: &MergeTarget,
) -> Duration {
    let factor = match strategy {
        ResolvedStrategy::Fast => FAST_SPEED_FACTOR,
        ResolvedStrategy::Safe => SAFE_SPEED_FACTOR_1080P * target.pixels() as f64 / PIXELS_1080P,
    };
    let secs = (total_media_secs.max(0.0) * factor).max(1.0);
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_MERGE_ESTIMATE)
        .min(MAX_MERGE_ESTIMATE)
}

/// Percent of the estimate elapsed, capped below 100.
pub fn estimated_merge_percent(elapsed: Duration, estimate: Duration) -> f64 {
    let ratio = elapsed.as_secs_f64() / estimate.as_secs_f64().max(f64::EPSILON);
    (ratio * 100.0).min(MAX_ESTIMATED_PERCENT)
}

fn lock_tally(tally: &Mutex<DownloadTally>) -> MutexGuard<'_, DownloadTally> {
    tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn merge_failure(strategy: ResolvedStrategy, exit_code: Option<i32>, diagnostic: String) -> JobFailure {
    JobFailure::new(
        JobStage::Merging,
        PipelineError::Merge {
            strategy,
            exit_code,
            diagnostic,
        },
    )
}

/// Executes merge jobs. Shared by every session in the process.
pub struct MergePipeline {
    config: PipelineConfig,
    collaborators: Collaborators,
    /// Limits concurrent external tool runs across all sessions.
    tool_slots: Arc<Semaphore>,
    ledger: StorageLedger,
    metrics: SharedMetrics,
}

impl MergePipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators, metrics: SharedMetrics) -> Self {
        let permits = config.tool_slots.max(1);
        Self {
            config,
            collaborators,
            tool_slots: Arc::new(Semaphore::new(permits)),
            ledger: StorageLedger::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &StorageLedger {
        &self.ledger
    }

    pub fn available_tool_slots(&self) -> usize {
        self.tool_slots.available_permits()
    }

    pub fn validate(&self, snapshot: &QueueSnapshot) -> ValidationReport {
        validate(&snapshot.entries, self.config.large_file_threshold)
    }

    /// Runs `job` to a terminal stage.
    ///
    /// Every event, including the terminal one, goes to `reporter`. The returned
    /// outcome mirrors the terminal event.
    pub async fn execute(
        &self,
        mut job: MergeJob,
        reporter: Arc<dyn ProgressReporter>,
        cancel: CancellationToken,
    ) -> JobOutcome {
        info!(
            job = %job.id,
            session = %job.snapshot.session_id,
            strategy = %job.strategy,
            preference = %job.preference,
            entries = job.snapshot.entries.len(),
            "job started"
        );

        let outcome = self.run_stages(&mut job, &reporter, &cancel).await;

        match &outcome {
            Ok(artifact) => {
                job.stage = JobStage::Done;
                job.progress.insert(JobStage::Done, 100.0);
                reporter.report(ProgressEvent::new(job.id, JobStage::Done, 100.0));
                info!(job = %job.id, location = %artifact.location.display(), "job done");

                let mut metrics = self.metrics.write().await;
                metrics.completed_jobs += 1;
                metrics.total_bytes_delivered += artifact.size_bytes;
                metrics.upsert_job(job.to_metrics());
            }
            Err(failure) => {
                job.stage = JobStage::Failed;
                reporter.report(ProgressEvent::failed(job.id, failure.clone()));
                if failure.is_cancelled() {
                    info!(job = %job.id, stage = %failure.stage, "job cancelled");
                } else {
                    warn!(job = %job.id, stage = %failure.stage, error = %failure.error, "job failed");
                }

                let mut metrics = self.metrics.write().await;
                if failure.is_cancelled() {
                    metrics.cancelled_jobs += 1;
                } else {
                    metrics.failed_jobs += 1;
                }
                metrics.upsert_job(job.to_metrics());
            }
        }

        self.archive(&job, &outcome).await;
        outcome
    }

    async fn run_stages(
        &self,
        job: &mut MergeJob,
        reporter: &Arc<dyn ProgressReporter>,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        let job_id = job.id;
        self.progress(job, reporter, ProgressEvent::new(job_id, JobStage::Validating, 0.0))
            .await;

        // Both are held until this function returns, whatever the exit path.
        let _slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(job = %job_id, "cancelled while waiting for a tool slot");
                return Err(JobFailure::new(JobStage::Validating, PipelineError::Cancelled));
            }
            permit = self.tool_slots.clone().acquire_owned() => permit.map_err(|_| {
                JobFailure::new(
                    JobStage::Validating,
                    PipelineError::Storage {
                        reason: "tool slots closed".to_string(),
                    },
                )
            })?,
        };
        let workspace = self
            .ledger
            .create_workspace(&self.config.temp_dir, &job.id.to_string())
            .map_err(|e| {
                JobFailure::new(
                    JobStage::Validating,
                    PipelineError::Storage {
                        reason: format!("cannot create workspace: {}", e),
                    },
                )
            })?;

        // Validating
        self.enter(job, JobStage::Validating).await;
        let report = self.validate(&job.snapshot);
        if job.strategy == ResolvedStrategy::Fast && !report.is_homogeneous {
            warn!(
                job = %job_id,
                warnings = report.warnings.len(),
                "FAST requested for a non-homogeneous queue, proceeding"
            );
        }
        self.progress(job, reporter, ProgressEvent::new(job_id, JobStage::Validating, 100.0).with_warnings(report.warnings))
            .await;

        // Downloading
        if cancel.is_cancelled() {
            return Err(JobFailure::new(JobStage::Downloading, PipelineError::Cancelled));
        }
        self.enter(job, JobStage::Downloading).await;
        self.progress(job, reporter, ProgressEvent::new(job_id, JobStage::Downloading, 0.0))
            .await;
        let (inputs, speed) = self.download(job, &workspace, reporter, cancel).await?;
        self.progress(
            job,
            reporter,
            ProgressEvent::new(job_id, JobStage::Downloading, 100.0).with_speed(speed),
        )
        .await;

        // Merging
        if cancel.is_cancelled() {
            return Err(JobFailure::new(JobStage::Merging, PipelineError::Cancelled));
        }
        self.enter(job, JobStage::Merging).await;
        let output = self.merge(job, inputs, &workspace, reporter, cancel).await?;
        self.progress(job, reporter, ProgressEvent::new(job_id, JobStage::Merging, 100.0))
            .await;

        // Uploading
        if cancel.is_cancelled() {
            return Err(JobFailure::new(JobStage::Merging, PipelineError::Cancelled));
        }
        self.enter(job, JobStage::Uploading).await;
        self.progress(job, reporter, ProgressEvent::new(job_id, JobStage::Uploading, 0.0))
            .await;
        let artifact = self.upload(job, &output).await?;
        if cancel.is_cancelled() {
            info!(job = %job_id, "cancellation arrived during upload, ignored");
        }
        self.progress(job, reporter, ProgressEvent::new(job_id, JobStage::Uploading, 100.0))
            .await;

        Ok(artifact)
    }

    async fn enter(&self, job: &mut MergeJob, stage: JobStage) {
        job.stage = stage;
        info!(job = %job.id, session = %job.snapshot.session_id, %stage, "stage entered");
        self.metrics.write().await.upsert_job(job.to_metrics());
    }

    async fn progress(&self, job: &mut MergeJob, reporter: &Arc<dyn ProgressReporter>, event: ProgressEvent) {
        job.progress.insert(event.stage, event.percent);
        if let Some(speed) = &event.speed {
            job.speed = Some(speed.clone());
        }
        reporter.report(event);
        self.metrics.write().await.upsert_job(job.to_metrics());
    }

    async fn download(
        &self,
        job: &MergeJob,
        workspace: &JobWorkspace,
        reporter: &Arc<dyn ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<MergeInput>, SpeedMetrics), JobFailure> {
        let entries = &job.snapshot.entries;
        let tally = Arc::new(Mutex::new(DownloadTally::new(
            entries.iter().map(|e| (e.id, e.metadata.file_size_bytes)),
        )));
        let slots = Arc::new(Semaphore::new(self.config.download_concurrency.max(1)));
        let mut set = JoinSet::new();

        for (index, entry) in entries.iter().enumerate() {
            let extension = Path::new(entry.source_ref.as_str())
                .extension()
                .and_then(|e| e.to_str());
            let dest = workspace.input_path(index, extension);
            let source = entry.source_ref.clone();
            let fetcher = self.collaborators.fetcher.clone();
            let slots = slots.clone();

            let progress: FetchProgress = {
                let tally = tally.clone();
                let reporter = reporter.clone();
                let job_id = job.id;
                Arc::new(move |bytes| {
                    let mut tally = lock_tally(&tally);
                    tally.update(index, bytes);
                    let percent = tally.percent();
                    reporter.report(
                        ProgressEvent::new(job_id, JobStage::Downloading, percent)
                            .with_speed(tally.speed()),
                    );
                })
            };

            set.spawn(async move {
                let result = match slots.acquire_owned().await {
                    Ok(_permit) => fetcher.fetch(&source, &dest, progress).await.map(|_| dest),
                    Err(_) => Err(FetchError::Transfer("download slots closed".to_string())),
                };
                (index, result)
            });
        }

        let mut paths: Vec<Option<PathBuf>> = vec![None; entries.len()];
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    return Err(JobFailure::new(JobStage::Downloading, PipelineError::Cancelled));
                }
                next = set.join_next() => match next {
                    None => break,
                    Some(Ok((index, Ok(path)))) => {
                        debug!(job = %job.id, entry = %entries[index].id, "entry downloaded");
                        let mut tally = lock_tally(&tally);
                        tally.complete(index);
                        let percent = tally.percent();
                        reporter.report(
                            ProgressEvent::new(job.id, JobStage::Downloading, percent)
                                .with_speed(tally.speed()),
                        );
                        paths[index] = Some(path);
                    }
                    Some(Ok((index, Err(e)))) => {
                        set.abort_all();
                        while set.join_next().await.is_some() {}
                        let entry_id = entries[index].id;
                        warn!(job = %job.id, entry = %entry_id, error = %e, "entry download failed");
                        return Err(JobFailure::new(
                            JobStage::Downloading,
                            PipelineError::Fetch { entry_id, cause: e.to_string() },
                        ));
                    }
                    Some(Err(join_err)) => {
                        set.abort_all();
                        while set.join_next().await.is_some() {}
                        return Err(JobFailure::new(
                            JobStage::Downloading,
                            PipelineError::Storage { reason: format!("download task failed: {}", join_err) },
                        ));
                    }
                }
            }
        }

        let mut inputs = Vec::with_capacity(entries.len());
        for (entry, path) in entries.iter().zip(paths) {
            let path = path.ok_or_else(|| {
                JobFailure::new(
                    JobStage::Downloading,
                    PipelineError::Fetch {
                        entry_id: entry.id,
                        cause: "download did not complete".to_string(),
                    },
                )
            })?;
            inputs.push(MergeInput {
                path,
                has_audio: entry.metadata.has_audio,
                duration_seconds: entry.metadata.duration_seconds,
            });
        }

        let speed = lock_tally(&tally).speed();
        Ok((inputs, speed))
    }

    async fn merge(
        &self,
        job: &MergeJob,
        inputs: Vec<MergeInput>,
        workspace: &JobWorkspace,
        reporter: &Arc<dyn ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobFailure> {
        let strategy = job.strategy;
        let target = MergeTarget::resolve(&job.snapshot.entries, &job.snapshot.settings);
        let total_media_secs = job.snapshot.total_duration_seconds();
        let estimate = estimate_merge_duration(total_media_secs, strategy, &target);
        debug!(job = %job.id, ?target, estimate_secs = estimate.as_secs_f64(), "merge target resolved");

        let request = MergeRequest {
            inputs,
            output: workspace.output_path(&job.snapshot.settings.output_file_name()),
            strategy,
            target,
            scratch_dir: workspace.path().to_path_buf(),
        };

        let ticker = {
            let reporter = reporter.clone();
            let job_id = job.id;
            let interval = self.config.progress_interval;
            tokio::spawn(async move {
                let started = Instant::now();
                loop {
                    tokio::time::sleep(interval).await;
                    let percent = estimated_merge_percent(started.elapsed(), estimate);
                    reporter.report(ProgressEvent::new(job_id, JobStage::Merging, percent));
                }
            })
        };

        let result = self.collaborators.tool.merge(&request, cancel).await;
        ticker.abort();
        let _ = ticker.await;

        let output = match result {
            Ok(path) => path,
            Err(ToolError::Cancelled) => {
                return Err(JobFailure::new(JobStage::Merging, PipelineError::Cancelled))
            }
            Err(ToolError::Failed {
                exit_code,
                diagnostic,
            }) => return Err(merge_failure(strategy, exit_code, diagnostic)),
            Err(ToolError::Io(e)) => return Err(merge_failure(strategy, None, e.to_string())),
        };

        if cancel.is_cancelled() {
            return Err(JobFailure::new(JobStage::Merging, PipelineError::Cancelled));
        }

        let size = tokio::fs::metadata(&output).await.map(|m| m.len()).unwrap_or(0);
        if size < self.config.min_output_bytes {
            return Err(merge_failure(
                strategy,
                None,
                format!(
                    "output missing or too small ({} bytes, minimum {})",
                    size, self.config.min_output_bytes
                ),
            ));
        }

        if strategy == ResolvedStrategy::Fast {
            self.verify_fast_output(&output, total_media_secs).await?;
        }

        Ok(output)
    }

    /// Stream copy can "succeed" while silently dropping segments; re-probe the result.
    async fn verify_fast_output(&self, output: &Path, expected_secs: f64) -> Result<(), JobFailure> {
        let probe = self.collaborators.probe.clone();
        let source = SourceRef::new(output.to_string_lossy());
        let probed = tokio::task::spawn_blocking(move || probe.probe(&source))
            .await
            .map_err(|e| merge_failure(ResolvedStrategy::Fast, None, format!("output probe task failed: {}", e)))?;

        let metadata = probed.map_err(|e| {
            merge_failure(ResolvedStrategy::Fast, None, format!("output could not be probed: {}", e))
        })?;

        if metadata.duration_seconds < expected_secs * FAST_MIN_DURATION_RATIO {
            return Err(merge_failure(
                ResolvedStrategy::Fast,
                None,
                format!(
                    "output is {:.1}s but inputs total {:.1}s; streams are likely incompatible",
                    metadata.duration_seconds, expected_secs
                ),
            ));
        }
        Ok(())
    }

    async fn upload(&self, job: &MergeJob, output: &Path) -> Result<DeliveredArtifact, JobFailure> {
        let delivery = &self.collaborators.delivery;
        let size = tokio::fs::metadata(output).await.map(|m| m.len()).map_err(|e| {
            JobFailure::new(
                JobStage::Uploading,
                PipelineError::Delivery {
                    reason: e.to_string(),
                    size: None,
                    limit: None,
                },
            )
        })?;

        if let DeliveryCheck::Reject { size, limit } = check_delivery_limit(size, delivery.max_bytes()) {
            return Err(JobFailure::new(
                JobStage::Uploading,
                PipelineError::Delivery {
                    reason: format!("artifact is {} bytes, limit is {} bytes", size, limit),
                    size: Some(size),
                    limit: Some(limit),
                },
            ));
        }

        let file_name = job.snapshot.settings.output_file_name();
        delivery.deliver(output, &file_name).await.map_err(|e| {
            JobFailure::new(
                JobStage::Uploading,
                PipelineError::Delivery {
                    reason: e.to_string(),
                    size: Some(size),
                    limit: Some(delivery.max_bytes()),
                },
            )
        })
    }

    async fn archive(&self, job: &MergeJob, outcome: &JobOutcome) {
        let Some(dir) = self.config.archive_dir.clone() else {
            return;
        };
        let record = JobRecord::from_job(job, outcome);
        let job_id = job.id;
        match tokio::task::spawn_blocking(move || save_record(&record, &dir)).await {
            Ok(Ok(())) => debug!(job = %job_id, "job archived"),
            Ok(Err(e)) => warn!(job = %job_id, error = %e, "failed to archive job"),
            Err(e) => warn!(job = %job_id, error = %e, "archive task failed"),
        }
    }
}
