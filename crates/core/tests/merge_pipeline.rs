//! End-to-end merge scenarios driven through the session registry with in-process
//! collaborators in place of ffprobe, ffmpeg and the network.

use async_trait::async_trait;
use clipmerge_core::{
    load_records, new_shared_metrics, Collaborators, DirectoryDelivery, EntryCandidate,
    FetchError, FetchProgress, JobStage, MediaMetadata, MergeJob, MergePipeline, MergeRequest,
    MergeTool, MetadataProbe, PipelineConfig, PipelineError, ProbeError, ProgressEvent,
    ProgressReporter, QueueError, QueueSnapshot, ResolvedStrategy, SessionError, SessionId,
    SessionLimits, SessionRegistry, SettingsUpdate, SharedMetrics, SourceFetcher, SourceRef,
    ToolError, WarningKind,
};
use clipmerge_core::MergeMode;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const ENTRY_BYTES: u64 = 8 * 1024;
const OUTPUT_BYTES: usize = 2048;

fn metadata(width: u32, height: u32) -> MediaMetadata {
    MediaMetadata {
        width,
        height,
        duration_seconds: 10.0,
        frame_rate: 30.0,
        codec_id: "h264".to_string(),
        has_audio: true,
        file_size_bytes: ENTRY_BYTES,
    }
}

/// Known sources get their registered metadata; anything else is treated as a merge
/// output lasting `output_duration` seconds.
struct FakeProbe {
    sources: Mutex<HashMap<String, MediaMetadata>>,
    output_duration: f64,
}

impl FakeProbe {
    fn new(output_duration: f64) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            output_duration,
        }
    }

    fn register(&self, source: &str, metadata: MediaMetadata) {
        self.sources.lock().unwrap().insert(source.to_string(), metadata);
    }
}

impl MetadataProbe for FakeProbe {
    fn probe(&self, source: &SourceRef) -> Result<MediaMetadata, ProbeError> {
        if let Some(metadata) = self.sources.lock().unwrap().get(source.as_str()) {
            return Ok(metadata.clone());
        }
        if source.as_str().contains("broken") {
            return Err(ProbeError::InvalidMedia("no video streams".to_string()));
        }
        Ok(MediaMetadata {
            duration_seconds: self.output_duration,
            ..metadata(1920, 1080)
        })
    }
}

/// Writes `ENTRY_BYTES` per source in four chunks.
struct FakeFetcher {
    chunk_delay: Duration,
    fail_on: Option<String>,
}

impl FakeFetcher {
    fn quick() -> Self {
        Self {
            chunk_delay: Duration::from_millis(5),
            fail_on: None,
        }
    }

    fn slow() -> Self {
        Self {
            chunk_delay: Duration::from_secs(30),
            fail_on: None,
        }
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn fetch(&self, source: &SourceRef, dest: &Path, progress: FetchProgress) -> Result<u64, FetchError> {
        if self.fail_on.as_deref() == Some(source.as_str()) {
            return Err(FetchError::NotFound(source.to_string()));
        }
        let chunk = vec![0u8; (ENTRY_BYTES / 4) as usize];
        let mut written = 0u64;
        for _ in 0..4 {
            tokio::time::sleep(self.chunk_delay).await;
            let mut data = tokio::fs::read(dest).await.unwrap_or_default();
            data.extend_from_slice(&chunk);
            tokio::fs::write(dest, &data).await?;
            written += chunk.len() as u64;
            progress(written);
        }
        Ok(written)
    }
}

/// Records each request's strategy and writes a fixed-size output. With
/// `wait_for_cancel` it blocks until cancelled, like a long encode.
#[derive(Default)]
struct FakeTool {
    strategies: Mutex<Vec<ResolvedStrategy>>,
    fail: bool,
    wait_for_cancel: bool,
}

#[async_trait]
impl MergeTool for FakeTool {
    async fn merge(&self, request: &MergeRequest, cancel: &CancellationToken) -> Result<PathBuf, ToolError> {
        self.strategies.lock().unwrap().push(request.strategy);
        if self.wait_for_cancel {
            tokio::fs::write(&request.output, vec![7u8; OUTPUT_BYTES / 2]).await?;
            cancel.cancelled().await;
            return Err(ToolError::Cancelled);
        }
        if self.fail {
            return Err(ToolError::Failed {
                exit_code: Some(1),
                diagnostic: "Non-monotonous DTS in output stream".to_string(),
            });
        }
        tokio::fs::write(&request.output, vec![7u8; OUTPUT_BYTES]).await?;
        Ok(request.output.clone())
    }
}

struct Harness {
    temp: TempDir,
    registry: SessionRegistry,
    probe: Arc<FakeProbe>,
    tool: Arc<FakeTool>,
    metrics: SharedMetrics,
    session: SessionId,
}

struct Setup {
    fetcher: FakeFetcher,
    tool: FakeTool,
    output_duration: f64,
    delivery_limit: u64,
    archive: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            fetcher: FakeFetcher::quick(),
            tool: FakeTool::default(),
            output_duration: 20.0,
            delivery_limit: u64::MAX,
            archive: false,
        }
    }
}

impl Harness {
    async fn new(setup: Setup) -> Self {
        let temp = TempDir::new().unwrap();
        let probe = Arc::new(FakeProbe::new(setup.output_duration));
        let tool = Arc::new(setup.tool);
        let metrics = new_shared_metrics();

        let config = PipelineConfig {
            temp_dir: temp.path().join("work"),
            download_concurrency: 2,
            tool_slots: 1,
            large_file_threshold: u64::MAX,
            min_output_bytes: 1024,
            progress_interval: Duration::from_millis(10),
            archive_dir: setup.archive.then(|| temp.path().join("archive")),
        };
        let pipeline = MergePipeline::new(
            config,
            Collaborators {
                probe: probe.clone(),
                fetcher: Arc::new(setup.fetcher),
                tool: tool.clone(),
                delivery: Arc::new(DirectoryDelivery::new(temp.path().join("out"), setup.delivery_limit)),
            },
            metrics.clone(),
        );

        let registry = SessionRegistry::new(
            Arc::new(pipeline),
            probe.clone(),
            SessionLimits {
                capacity: 20,
                min_entries_to_merge: 2,
            },
            metrics.clone(),
        );
        let session = SessionId::from("chat-42");
        registry.open(&session).await;

        Self {
            temp,
            registry,
            probe,
            tool,
            metrics,
            session,
        }
    }

    async fn add(&self, source: &str, metadata: MediaMetadata) -> clipmerge_core::QueueEntry {
        self.add_to(&self.session, source, metadata).await
    }

    async fn add_to(&self, session: &SessionId, source: &str, metadata: MediaMetadata) -> clipmerge_core::QueueEntry {
        self.probe.register(source, metadata);
        self.registry
            .add(session, EntryCandidate::new(SourceRef::new(source), source))
            .await
            .unwrap()
    }

    /// Freezes the harness session's queue into a job without going through the registry.
    async fn job(&self) -> MergeJob {
        let summary = self.registry.summary(&self.session).await.unwrap();
        let snapshot = QueueSnapshot {
            session_id: self.session.as_str().to_string(),
            entries: summary.entries,
            settings: summary.settings,
        };
        let report = self.registry.pipeline().validate(&snapshot);
        MergeJob::create(snapshot, &report)
    }

    fn live_workspaces(&self) -> usize {
        self.registry.pipeline().ledger().live()
    }

    fn leftover_job_dirs(&self) -> usize {
        match std::fs::read_dir(self.temp.path().join("work")) {
            Ok(dir) => dir.count(),
            Err(_) => 0,
        }
    }
}

async fn drain(events: &mut clipmerge_core::ProgressStream) -> Vec<ProgressEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    seen
}

async fn wait_for_stage(events: &mut clipmerge_core::ProgressStream, stage: JobStage) {
    loop {
        let event = events.recv().await.expect("stream ended early");
        if event.stage == stage {
            return;
        }
    }
}

/// Keeps every event and cancels the job once validation reports completion.
struct CancelAfterValidation {
    cancel: CancellationToken,
    seen: Mutex<Vec<ProgressEvent>>,
}

impl ProgressReporter for CancelAfterValidation {
    fn report(&self, event: ProgressEvent) {
        if event.stage == JobStage::Validating && event.percent >= 100.0 {
            self.cancel.cancel();
        }
        self.seen.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn homogeneous_smart_queue_merges_fast_to_done() {
    let h = Harness::new(Setup::default()).await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    let (mut events, result) = handle.split();
    let seen = drain(&mut events).await;
    let artifact = result.take_result().await.unwrap().unwrap();

    assert_eq!(*h.tool.strategies.lock().unwrap(), vec![ResolvedStrategy::Fast]);
    assert_eq!(artifact.file_name, "merged_video.mp4");
    assert_eq!(artifact.size_bytes, OUTPUT_BYTES as u64);
    assert!(artifact.location.exists());

    let downloads: Vec<f64> = seen
        .iter()
        .filter(|e| e.stage == JobStage::Downloading)
        .map(|e| e.percent)
        .collect();
    assert!(!downloads.is_empty());
    assert!(downloads.windows(2).all(|w| w[0] <= w[1]), "{:?}", downloads);
    assert_eq!(downloads.last().copied(), Some(100.0));

    let stages: Vec<JobStage> = seen.iter().map(|e| e.stage).collect();
    assert!(stages.windows(2).all(|w| w[0] <= w[1]), "{:?}", stages);
    assert_eq!(stages.last(), Some(&JobStage::Done));

    assert_eq!(h.live_workspaces(), 0);
    assert_eq!(h.leftover_job_dirs(), 0);

    let metrics = h.metrics.read().await;
    assert_eq!(metrics.completed_jobs, 1);
    assert_eq!(metrics.running_jobs, 0);
    assert_eq!(metrics.total_bytes_delivered, OUTPUT_BYTES as u64);
}

#[tokio::test]
async fn mixed_resolutions_resolve_to_safe_and_surface_warnings() {
    let h = Harness::new(Setup::default()).await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1280, 720)).await;

    let mut handle = h.registry.start_merge(&h.session).await.unwrap();
    let seen = drain(handle.events()).await;
    handle.take_result().await.unwrap().unwrap();

    assert_eq!(*h.tool.strategies.lock().unwrap(), vec![ResolvedStrategy::Safe]);
    let validating = seen
        .iter()
        .find(|e| e.stage == JobStage::Validating)
        .expect("validating event");
    assert!(validating
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::ResolutionMismatch));
}

#[tokio::test]
async fn strategy_is_frozen_when_merge_starts() {
    let h = Harness::new(Setup::default()).await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();

    h.registry
        .update_settings(
            &h.session,
            SettingsUpdate {
                mode: Some(MergeMode::Safe),
                ..SettingsUpdate::default()
            },
        )
        .await
        .unwrap();
    h.add("/media/c.mp4", metadata(640, 360)).await;

    handle.take_result().await.unwrap().unwrap();
    assert_eq!(*h.tool.strategies.lock().unwrap(), vec![ResolvedStrategy::Fast]);
}

#[tokio::test]
async fn cancel_during_download_fails_cancelled_and_frees_storage() {
    let h = Harness::new(Setup {
        fetcher: FakeFetcher::slow(),
        ..Setup::default()
    })
    .await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    let (mut events, result) = handle.split();
    loop {
        let event = events.recv().await.expect("stream ended before download");
        if event.stage == JobStage::Downloading {
            break;
        }
    }

    let cancelled = h.registry.cancel(&h.session).await.unwrap();
    assert_eq!(cancelled, result.job_id());

    let failure = result.take_result().await.unwrap().unwrap_err();
    assert!(failure.is_cancelled());
    assert_eq!(failure.stage, JobStage::Downloading);

    let rest = drain(&mut events).await;
    let last = rest.last().expect("terminal event");
    assert_eq!(last.stage, JobStage::Failed);
    assert_eq!(last.failure.as_ref().map(|f| f.is_cancelled()), Some(true));

    assert_eq!(h.live_workspaces(), 0);
    assert_eq!(h.leftover_job_dirs(), 0);
    assert!(h.tool.strategies.lock().unwrap().is_empty());
    assert_eq!(h.metrics.read().await.cancelled_jobs, 1);
}

#[tokio::test]
async fn second_merge_is_refused_while_one_runs() {
    let h = Harness::new(Setup {
        fetcher: FakeFetcher::slow(),
        ..Setup::default()
    })
    .await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    let err = h.registry.start_merge(&h.session).await.unwrap_err();
    assert!(matches!(err, SessionError::MergeInProgress(id) if id == handle.job_id));

    let summary = h.registry.summary(&h.session).await.unwrap();
    assert_eq!(summary.running_job, Some(handle.job_id));

    h.registry.cancel(&h.session).await.unwrap();
    assert!(handle.take_result().await.unwrap().unwrap_err().is_cancelled());
}

#[tokio::test]
async fn full_queue_rejects_add_and_stays_unchanged() {
    let h = Harness::new(Setup::default()).await;
    for n in 0..20 {
        h.add(&format!("/media/clip{:02}.mp4", n), metadata(1920, 1080)).await;
    }
    let before: Vec<_> = h
        .registry
        .summary(&h.session)
        .await
        .unwrap()
        .entries
        .iter()
        .map(|e| e.id)
        .collect();

    h.probe.register("/media/extra.mp4", metadata(1920, 1080));
    let err = h
        .registry
        .add(
            &h.session,
            EntryCandidate::new(SourceRef::new("/media/extra.mp4"), "extra.mp4"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Queue(QueueError::CapacityExceeded { capacity: 20 })
    ));

    let after: Vec<_> = h
        .registry
        .summary(&h.session)
        .await
        .unwrap()
        .entries
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn probe_failure_leaves_queue_untouched() {
    let h = Harness::new(Setup::default()).await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;

    let err = h
        .registry
        .add(
            &h.session,
            EntryCandidate::new(SourceRef::new("/media/broken.mp4"), "broken.mp4"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Queue(QueueError::Probe(_))));
    assert_eq!(h.registry.summary(&h.session).await.unwrap().entries.len(), 1);
}

#[tokio::test]
async fn fast_tool_error_is_a_merge_failure() {
    let h = Harness::new(Setup {
        tool: FakeTool {
            fail: true,
            ..FakeTool::default()
        },
        ..Setup::default()
    })
    .await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    let failure = handle.take_result().await.unwrap().unwrap_err();

    assert_eq!(failure.stage, JobStage::Merging);
    match failure.error {
        PipelineError::Merge {
            strategy,
            exit_code,
            diagnostic,
        } => {
            assert_eq!(strategy, ResolvedStrategy::Fast);
            assert_eq!(exit_code, Some(1));
            assert!(diagnostic.contains("Non-monotonous DTS"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(h.live_workspaces(), 0);
}

#[tokio::test]
async fn truncated_fast_output_is_detected() {
    let h = Harness::new(Setup {
        output_duration: 5.0,
        ..Setup::default()
    })
    .await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    let failure = handle.take_result().await.unwrap().unwrap_err();

    assert_eq!(failure.stage, JobStage::Merging);
    assert!(matches!(
        failure.error,
        PipelineError::Merge {
            strategy: ResolvedStrategy::Fast,
            exit_code: None,
            ..
        }
    ));
}

#[tokio::test]
async fn absurd_durations_fail_the_job_instead_of_losing_it() {
    let h = Harness::new(Setup::default()).await;
    let huge = MediaMetadata {
        duration_seconds: 1e300,
        ..metadata(1920, 1080)
    };
    h.add("/media/a.mp4", huge.clone()).await;
    h.add("/media/b.mp4", huge).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    let (mut events, result) = handle.split();
    let seen = drain(&mut events).await;
    let failure = result.take_result().await.unwrap().unwrap_err();

    assert_eq!(failure.stage, JobStage::Merging);
    assert!(matches!(
        failure.error,
        PipelineError::Merge {
            strategy: ResolvedStrategy::Fast,
            exit_code: None,
            ..
        }
    ));
    assert_eq!(seen.last().map(|e| e.stage), Some(JobStage::Failed));
    assert_eq!(h.live_workspaces(), 0);
    assert_eq!(h.metrics.read().await.failed_jobs, 1);
}

#[tokio::test]
async fn oversized_artifact_is_a_delivery_failure() {
    let h = Harness::new(Setup {
        delivery_limit: 100,
        ..Setup::default()
    })
    .await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    let failure = handle.take_result().await.unwrap().unwrap_err();

    assert_eq!(failure.stage, JobStage::Uploading);
    assert_eq!(
        failure.error,
        PipelineError::Delivery {
            reason: format!("artifact is {} bytes, limit is 100 bytes", OUTPUT_BYTES),
            size: Some(OUTPUT_BYTES as u64),
            limit: Some(100),
        }
    );
    assert_eq!(h.metrics.read().await.failed_jobs, 1);
}

#[tokio::test]
async fn single_fetch_failure_fails_whole_job() {
    let h = Harness::new(Setup {
        fetcher: FakeFetcher {
            fail_on: Some("/media/b.mp4".to_string()),
            ..FakeFetcher::quick()
        },
        ..Setup::default()
    })
    .await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    let bad = h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    let failure = handle.take_result().await.unwrap().unwrap_err();

    assert_eq!(failure.stage, JobStage::Downloading);
    assert_eq!(failure.affected_entry_ids(), vec![bad.id]);
    assert!(h.tool.strategies.lock().unwrap().is_empty());
    assert_eq!(h.live_workspaces(), 0);
}

#[tokio::test]
async fn finished_jobs_are_archived() {
    let h = Harness::new(Setup {
        archive: true,
        ..Setup::default()
    })
    .await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    let job_id = handle.job_id;
    handle.take_result().await.unwrap().unwrap();

    let records = load_records(&h.temp.path().join("archive")).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job_id, job_id);
    assert_eq!(records[0].stage, JobStage::Done);
    assert_eq!(records[0].strategy, ResolvedStrategy::Fast);
    assert_eq!(records[0].session_id, "chat-42");
}

#[tokio::test]
async fn ending_session_cancels_running_job() {
    let h = Harness::new(Setup {
        fetcher: FakeFetcher::slow(),
        ..Setup::default()
    })
    .await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    h.registry.end_session(&h.session).await.unwrap();

    assert!(handle.take_result().await.unwrap().unwrap_err().is_cancelled());
    assert_eq!(h.live_workspaces(), 0);
    assert!(!h.registry.contains(&h.session).await);
}

#[tokio::test]
async fn clear_keeps_running_job_guarded_and_cancellable() {
    let h = Harness::new(Setup {
        fetcher: FakeFetcher::slow(),
        ..Setup::default()
    })
    .await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    assert_eq!(h.registry.clear(&h.session).await.unwrap(), 2);

    let summary = h.registry.summary(&h.session).await.unwrap();
    assert!(summary.entries.is_empty());
    assert_eq!(summary.running_job, Some(handle.job_id));

    h.add("/media/c.mp4", metadata(1920, 1080)).await;
    h.add("/media/d.mp4", metadata(1920, 1080)).await;
    let err = h.registry.start_merge(&h.session).await.unwrap_err();
    assert!(matches!(err, SessionError::MergeInProgress(id) if id == handle.job_id));

    assert_eq!(h.registry.cancel(&h.session).await.unwrap(), handle.job_id);
    assert!(handle.take_result().await.unwrap().unwrap_err().is_cancelled());
    assert_eq!(h.live_workspaces(), 0);
}

#[tokio::test]
async fn cancel_while_waiting_for_tool_slot_is_prompt() {
    let h = Harness::new(Setup {
        fetcher: FakeFetcher::slow(),
        ..Setup::default()
    })
    .await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;
    let holder = h.registry.start_merge(&h.session).await.unwrap();
    let (mut holder_events, holder_result) = holder.split();
    wait_for_stage(&mut holder_events, JobStage::Downloading).await;

    let other = SessionId::from("chat-43");
    h.registry.open(&other).await;
    h.add_to(&other, "/media/c.mp4", metadata(1920, 1080)).await;
    h.add_to(&other, "/media/d.mp4", metadata(1920, 1080)).await;
    let waiting = h.registry.start_merge(&other).await.unwrap();
    let (mut waiting_events, waiting_result) = waiting.split();
    wait_for_stage(&mut waiting_events, JobStage::Validating).await;

    assert_eq!(h.registry.cancel(&other).await.unwrap(), waiting_result.job_id());
    let failure = tokio::time::timeout(Duration::from_secs(2), waiting_result.take_result())
        .await
        .expect("queued job ignored cancellation")
        .unwrap()
        .unwrap_err();
    assert!(failure.is_cancelled());
    assert_eq!(failure.stage, JobStage::Validating);

    let rest = drain(&mut waiting_events).await;
    assert!(rest.iter().all(|e| e.stage != JobStage::Downloading));
    assert_eq!(rest.last().map(|e| e.stage), Some(JobStage::Failed));

    h.registry.cancel(&h.session).await.unwrap();
    assert!(holder_result.take_result().await.unwrap().unwrap_err().is_cancelled());
    assert_eq!(h.live_workspaces(), 0);
    assert!(h.tool.strategies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_during_merge_stops_tool_and_frees_storage() {
    let h = Harness::new(Setup {
        tool: FakeTool {
            wait_for_cancel: true,
            ..FakeTool::default()
        },
        ..Setup::default()
    })
    .await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let handle = h.registry.start_merge(&h.session).await.unwrap();
    let (mut events, result) = handle.split();
    wait_for_stage(&mut events, JobStage::Merging).await;

    h.registry.cancel(&h.session).await.unwrap();
    let failure = result.take_result().await.unwrap().unwrap_err();
    assert!(failure.is_cancelled());
    assert_eq!(failure.stage, JobStage::Merging);

    let rest = drain(&mut events).await;
    let last = rest.last().expect("terminal event");
    assert_eq!(last.stage, JobStage::Failed);
    assert_eq!(last.failure.as_ref().map(|f| f.is_cancelled()), Some(true));

    assert_eq!(*h.tool.strategies.lock().unwrap(), vec![ResolvedStrategy::Fast]);
    assert_eq!(h.live_workspaces(), 0);
    assert_eq!(h.leftover_job_dirs(), 0);
    assert_eq!(h.metrics.read().await.cancelled_jobs, 1);
}

#[tokio::test]
async fn cancel_during_validation_is_honored_before_downloading() {
    let h = Harness::new(Setup::default()).await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let job = h.job().await;
    let cancel = CancellationToken::new();
    let reporter = Arc::new(CancelAfterValidation {
        cancel: cancel.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let failure = h
        .registry
        .pipeline()
        .execute(job, reporter.clone(), cancel)
        .await
        .unwrap_err();

    assert!(failure.is_cancelled());
    assert_eq!(failure.stage, JobStage::Downloading);

    let seen = reporter.seen.lock().unwrap();
    assert!(seen.iter().all(|e| e.stage != JobStage::Downloading));
    assert_eq!(seen.last().map(|e| e.stage), Some(JobStage::Failed));
    drop(seen);

    assert!(h.tool.strategies.lock().unwrap().is_empty());
    assert_eq!(h.live_workspaces(), 0);
    assert_eq!(h.leftover_job_dirs(), 0);
}

#[tokio::test]
async fn job_cancelled_before_it_starts_creates_no_workspace() {
    let h = Harness::new(Setup::default()).await;
    h.add("/media/a.mp4", metadata(1920, 1080)).await;
    h.add("/media/b.mp4", metadata(1920, 1080)).await;

    let job = h.job().await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let failure = h
        .registry
        .pipeline()
        .execute(job, Arc::new(clipmerge_core::NullReporter), cancel)
        .await
        .unwrap_err();

    assert!(failure.is_cancelled());
    assert_eq!(failure.stage, JobStage::Validating);
    assert!(h.tool.strategies.lock().unwrap().is_empty());
    assert_eq!(h.leftover_job_dirs(), 0);
    assert_eq!(h.metrics.read().await.cancelled_jobs, 1);
}
