//! Session registry
//!
//! Maps a session identifier to the session's own [`MergeQueue`] and at most one
//! active job. Operations on one session are serialized behind that session's lock;
//! different sessions never share mutable state and run in parallel.

use crate::metrics::SharedMetrics;
use crate::pipeline::{JobId, JobOutcome, MergeJob, MergePipeline};
use crate::probe::{MetadataProbe, ProbeError};
use crate::progress::{progress_channel, ProgressReporter, ProgressStream};
use crate::queue::{
    format_duration, Direction, EntryCandidate, EntryId, MergeQueue, MergeSettings, QueueEntry,
    QueueError, SettingsUpdate,
};
use crate::validation::{validate, ValidationReport};
use clipmerge_config::Config;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error type for session-level operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Need at least {need} entries to merge, queue has {have}")]
    NotEnoughEntries { have: usize, need: usize },

    #[error("Job {0} is still running for this session")]
    MergeInProgress(JobId),

    #[error("No session {0}")]
    NoSuchSession(SessionId),

    #[error("No running job in this session")]
    NoActiveJob,

    #[error("Result of job {0} was lost before delivery")]
    ResultLost(JobId),
}

/// Identifier of one user session (for example a chat id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Queue limits applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub capacity: usize,
    pub min_entries_to_merge: usize,
}

impl SessionLimits {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            capacity: cfg.queue.capacity,
            min_entries_to_merge: cfg.queue.min_entries_to_merge,
        }
    }
}

/// Result half of a [`JobHandle`]. Consumed by the single retrieval.
#[derive(Debug)]
pub struct JobResult {
    job_id: JobId,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobResult {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Waits for the job to reach a terminal stage and hands back its outcome.
    pub async fn take_result(self) -> Result<JobOutcome, SessionError> {
        self.rx.await.map_err(|_| SessionError::ResultLost(self.job_id))
    }
}

/// Returned by [`SessionRegistry::start_merge`] as soon as the job is spawned.
pub struct JobHandle {
    pub job_id: JobId,
    pub session_id: SessionId,
    events: ProgressStream,
    result: JobResult,
}

impl JobHandle {
    pub fn events(&mut self) -> &mut ProgressStream {
        &mut self.events
    }

    /// Separates the event stream from the result so they can be consumed by
    /// different tasks.
    pub fn split(self) -> (ProgressStream, JobResult) {
        (self.events, self.result)
    }

    pub async fn take_result(self) -> Result<JobOutcome, SessionError> {
        self.result.take_result().await
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Read-only view of a session for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSummary {
    pub session_id: SessionId,
    pub entries: Vec<QueueEntry>,
    pub capacity: usize,
    pub settings: MergeSettings,
    pub output_name: String,
    pub total_duration_seconds: f64,
    /// `HH:MM:SS`
    pub total_duration: String,
    pub total_size_bytes: u64,
    pub running_job: Option<JobId>,
}

/// Closed set of operations a UI collaborator can route to a session.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Add(EntryCandidate),
    Remove(EntryId),
    Move { id: EntryId, direction: Direction },
    Clear,
    UpdateSettings(SettingsUpdate),
    Validate,
    StartMerge,
    Cancel,
    Summary,
}

#[derive(Debug)]
pub enum CommandReply {
    Added(QueueEntry),
    Removed(QueueEntry),
    Moved { moved: bool },
    Cleared { removed: usize },
    SettingsUpdated(MergeSettings),
    Validated(ValidationReport),
    MergeStarted(JobHandle),
    CancelRequested(JobId),
    Summary(QueueSummary),
}

struct ActiveJob {
    job_id: JobId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveJob {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

struct Session {
    queue: MergeQueue,
    active: Option<ActiveJob>,
}

impl Session {
    fn running_job(&self) -> Option<JobId> {
        self.active
            .as_ref()
            .filter(|job| job.is_running())
            .map(|job| job.job_id)
    }
}

/// Owns every live session of the process.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    pipeline: Arc<MergePipeline>,
    probe: Arc<dyn MetadataProbe>,
    limits: SessionLimits,
    metrics: SharedMetrics,
}

impl SessionRegistry {
    pub fn new(
        pipeline: Arc<MergePipeline>,
        probe: Arc<dyn MetadataProbe>,
        limits: SessionLimits,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pipeline,
            probe,
            limits,
            metrics,
        }
    }

    pub fn pipeline(&self) -> &Arc<MergePipeline> {
        &self.pipeline
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Creates the session's empty queue. Returns `false` if it already existed.
    pub async fn open(&self, session_id: &SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return false;
        }
        sessions.insert(
            session_id.clone(),
            Arc::new(Mutex::new(Session {
                queue: MergeQueue::new(session_id.as_str(), self.limits.capacity),
                active: None,
            })),
        );
        let count = sessions.len();
        drop(sessions);

        self.metrics.write().await.active_sessions = count;
        info!(session = %session_id, "session opened");
        true
    }

    /// Evicts the session. A job still running for it is cancelled.
    pub async fn end_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let (session, count) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .remove(session_id)
                .ok_or_else(|| SessionError::NoSuchSession(session_id.clone()))?;
            (session, sessions.len())
        };
        self.metrics.write().await.active_sessions = count;

        let session = session.lock().await;
        if let Some(active) = session.active.as_ref().filter(|job| job.is_running()) {
            info!(session = %session_id, job = %active.job_id, "session ended with running job, cancelling");
            active.cancel.cancel();
        }
        info!(session = %session_id, entries = session.queue.len(), "session ended");
        Ok(())
    }

    async fn session(&self, session_id: &SessionId) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NoSuchSession(session_id.clone()))
    }

    /// Probes the candidate and appends it to the session's queue.
    ///
    /// The queue is not touched unless the whole add succeeds.
    pub async fn add(
        &self,
        session_id: &SessionId,
        candidate: EntryCandidate,
    ) -> Result<QueueEntry, SessionError> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        session.queue.check_can_add(&candidate)?;

        let probe = self.probe.clone();
        let source = candidate.source_ref.clone();
        let metadata = tokio::task::spawn_blocking(move || probe.probe(&source))
            .await
            .map_err(|e| QueueError::Probe(ProbeError::FfprobeFailed(format!("probe task failed: {}", e))))?
            .map_err(|e| {
                warn!(session = %session_id, source = %candidate.source_ref, error = %e, "probe failed, entry not added");
                QueueError::Probe(e)
            })?;

        Ok(session.queue.add_with_metadata(candidate, metadata)?.clone())
    }

    pub async fn remove(&self, session_id: &SessionId, entry_id: EntryId) -> Result<QueueEntry, SessionError> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        Ok(session.queue.remove(entry_id)?)
    }

    pub async fn move_entry(
        &self,
        session_id: &SessionId,
        entry_id: EntryId,
        direction: Direction,
    ) -> Result<bool, SessionError> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        Ok(session.queue.move_entry(entry_id, direction)?)
    }

    /// Empties the queue. A job already executing works on its own snapshot and keeps
    /// running; it still blocks a new merge and can still be cancelled.
    pub async fn clear(&self, session_id: &SessionId) -> Result<usize, SessionError> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        if session.active.as_ref().is_some_and(|job| !job.is_running()) {
            session.active = None;
        }
        if let Some(job_id) = session.running_job() {
            debug!(session = %session_id, job = %job_id, "queue cleared while job keeps running");
        }
        Ok(session.queue.clear().len())
    }

    pub async fn update_settings(
        &self,
        session_id: &SessionId,
        update: SettingsUpdate,
    ) -> Result<MergeSettings, SessionError> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        session.queue.update_settings(update);
        Ok(session.queue.settings().clone())
    }

    pub async fn validate(&self, session_id: &SessionId) -> Result<ValidationReport, SessionError> {
        let session = self.session(session_id).await?;
        let session = session.lock().await;
        let report = validate(session.queue.entries(), self.pipeline.config().large_file_threshold);
        debug!(
            session = %session_id,
            warnings = report.warnings.len(),
            homogeneous = report.is_homogeneous,
            "queue validated"
        );
        Ok(report)
    }

    pub async fn summary(&self, session_id: &SessionId) -> Result<QueueSummary, SessionError> {
        let session = self.session(session_id).await?;
        let session = session.lock().await;
        let queue = &session.queue;
        let total_duration_seconds = queue.total_duration_seconds();

        Ok(QueueSummary {
            session_id: session_id.clone(),
            entries: queue.entries().to_vec(),
            capacity: queue.capacity(),
            settings: queue.settings().clone(),
            output_name: queue.settings().output_file_name(),
            total_duration_seconds,
            total_duration: format_duration(total_duration_seconds),
            total_size_bytes: queue.total_size_bytes(),
            running_job: session.running_job(),
        })
    }

    /// Freezes the queue into a job and starts it in the background.
    ///
    /// Returns as soon as the job is spawned; progress and the result arrive through
    /// the returned handle.
    pub async fn start_merge(&self, session_id: &SessionId) -> Result<JobHandle, SessionError> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;

        if let Some(job_id) = session.running_job() {
            return Err(SessionError::MergeInProgress(job_id));
        }

        let have = session.queue.len();
        let need = self.limits.min_entries_to_merge;
        if have < need {
            return Err(SessionError::NotEnoughEntries { have, need });
        }

        let snapshot = session.queue.snapshot();
        let report = self.pipeline.validate(&snapshot);
        let job = MergeJob::create(snapshot, &report);
        let job_id = job.id;
        info!(
            session = %session_id,
            job = %job_id,
            preference = %job.preference,
            strategy = %job.strategy,
            entries = have,
            "merge started"
        );

        let (sender, events) = progress_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let task = {
            let pipeline = self.pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let reporter: Arc<dyn ProgressReporter> = Arc::new(sender);
                let outcome = pipeline.execute(job, reporter, cancel).await;
                if result_tx.send(outcome).is_err() {
                    debug!(job = %job_id, "job result dropped, handle is gone");
                }
            })
        };

        session.active = Some(ActiveJob {
            job_id,
            cancel,
            task,
        });

        Ok(JobHandle {
            job_id,
            session_id: session_id.clone(),
            events,
            result: JobResult { job_id, rx: result_rx },
        })
    }

    /// Requests cancellation of the session's running job.
    ///
    /// Downloads and the merge tool stop right away; a request arriving during
    /// validation or upload is honored at the next stage boundary.
    pub async fn cancel(&self, session_id: &SessionId) -> Result<JobId, SessionError> {
        let session = self.session(session_id).await?;
        let session = session.lock().await;
        let active = session
            .active
            .as_ref()
            .filter(|job| job.is_running())
            .ok_or(SessionError::NoActiveJob)?;

        info!(session = %session_id, job = %active.job_id, "cancellation requested");
        active.cancel.cancel();
        Ok(active.job_id)
    }

    pub async fn dispatch(
        &self,
        session_id: &SessionId,
        command: SessionCommand,
    ) -> Result<CommandReply, SessionError> {
        match command {
            SessionCommand::Add(candidate) => self.add(session_id, candidate).await.map(CommandReply::Added),
            SessionCommand::Remove(id) => self.remove(session_id, id).await.map(CommandReply::Removed),
            SessionCommand::Move { id, direction } => self
                .move_entry(session_id, id, direction)
                .await
                .map(|moved| CommandReply::Moved { moved }),
            SessionCommand::Clear => self
                .clear(session_id)
                .await
                .map(|removed| CommandReply::Cleared { removed }),
            SessionCommand::UpdateSettings(update) => self
                .update_settings(session_id, update)
                .await
                .map(CommandReply::SettingsUpdated),
            SessionCommand::Validate => self.validate(session_id).await.map(CommandReply::Validated),
            SessionCommand::StartMerge => self.start_merge(session_id).await.map(CommandReply::MergeStarted),
            SessionCommand::Cancel => self.cancel(session_id).await.map(CommandReply::CancelRequested),
            SessionCommand::Summary => self.summary(session_id).await.map(CommandReply::Summary),
        }
    }
}
