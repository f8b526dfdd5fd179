//! clipmerge core
//!
//! Per-session merge queues, compatibility validation, FAST/SAFE strategy selection
//! and the staged merge pipeline that downloads, concatenates and delivers a job.

pub mod archive;
pub mod concurrency;
pub mod delivery;
pub mod fetch;
pub mod logging;
pub mod metrics;
pub mod metrics_server;
pub mod mode;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod queue;
pub mod session;
pub mod startup;
pub mod tool;
pub mod validation;
pub mod workspace;

pub use clipmerge_config as config;
pub use clipmerge_config::Config;
pub use archive::{load_records, save_record, JobRecord};
pub use concurrency::ResourcePlan;
pub use delivery::{
    check_delivery_limit, DeliveredArtifact, DeliveryChannel, DeliveryCheck, DeliveryError,
    DirectoryDelivery,
};
pub use fetch::{FetchError, FetchProgress, LocalFileFetcher, SourceFetcher};
pub use logging::init_tracing;
pub use metrics::{
    collect_system_metrics, new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics,
    SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use mode::{resolve_strategy, MergeTarget, ResolvedStrategy};
pub use pipeline::{
    Collaborators, JobFailure, JobId, JobOutcome, MergeJob, MergePipeline, PipelineConfig,
    PipelineError,
};
pub use probe::{FfprobeProbe, MediaMetadata, MetadataProbe, ProbeError};
pub use progress::{
    format_eta, format_speed, progress_channel, JobStage, NullReporter, ProgressEvent,
    ProgressReporter, ProgressSender, ProgressStream, SpeedMetrics,
};
pub use queue::{
    format_duration, AudioPolicy, Direction, EntryCandidate, EntryId, FpsSetting, MergeMode,
    MergeQueue, MergeSettings, QueueEntry, QueueError, QueueSnapshot, ResolutionSetting,
    SettingsUpdate, SourceRef,
};
pub use session::{
    CommandReply, JobHandle, JobResult, QueueSummary, SessionCommand, SessionError, SessionId,
    SessionLimits, SessionRegistry,
};
pub use startup::{run_startup_checks, StartupError};
pub use tool::{FfmpegTool, MergeInput, MergeRequest, MergeTool, ToolError};
pub use validation::{validate, ValidationReport, Warning, WarningKind};
pub use workspace::{JobWorkspace, StorageLedger};
