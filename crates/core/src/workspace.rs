//! Per-job temporary storage.
//!
//! Every job gets its own `job_<id>` directory under the configured temp root. The
//! directory lives exactly as long as its [`JobWorkspace`]; dropping the workspace
//! removes it on every exit path, including cancellation and panics in the job task.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Counts live job workspaces so tests and metrics can verify nothing leaks.
#[derive(Debug, Clone, Default)]
pub struct StorageLedger {
    live: Arc<AtomicUsize>,
}

impl StorageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workspaces currently allocated.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Creates `<root>/job_<job_key>` and registers it.
    pub fn create_workspace(&self, root: &Path, job_key: &str) -> io::Result<JobWorkspace> {
        let path = root.join(format!("job_{}", job_key));
        fs::create_dir_all(&path)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!(path = %path.display(), "workspace created");
        Ok(JobWorkspace {
            path,
            ledger: self.clone(),
        })
    }
}

/// Scoped temp directory for one job.
#[derive(Debug)]
pub struct JobWorkspace {
    path: PathBuf,
    ledger: StorageLedger,
}

impl JobWorkspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Local path for the `index`-th downloaded input, keeping the source extension.
    pub fn input_path(&self, index: usize, extension: Option<&str>) -> PathBuf {
        let ext = extension.filter(|e| !e.is_empty()).unwrap_or("mp4");
        self.path.join(format!("input_{:03}.{}", index, ext))
    }

    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.path.join(file_name)
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove workspace");
            }
        }
        self.ledger.live.fetch_sub(1, Ordering::SeqCst);
        debug!(path = %self.path.display(), "workspace released");
    }
}
