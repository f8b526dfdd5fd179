//! Artifact delivery for the upload stage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Artifact is {size} bytes, delivery limit is {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of the delivery size check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryCheck {
    Accept,
    Reject { size: u64, limit: u64 },
}

/// Rejects artifacts strictly larger than `limit` bytes.
pub fn check_delivery_limit(size: u64, limit: u64) -> DeliveryCheck {
    if size > limit {
        DeliveryCheck::Reject { size, limit }
    } else {
        DeliveryCheck::Accept
    }
}

/// What the caller gets back once a job is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredArtifact {
    pub location: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
}

/// Where finished artifacts go.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Largest artifact this channel accepts.
    fn max_bytes(&self) -> u64;

    /// Hands the artifact over. The source file may be moved.
    async fn deliver(&self, artifact: &Path, file_name: &str) -> Result<DeliveredArtifact, DeliveryError>;
}

/// Delivers into a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryDelivery {
    dir: PathBuf,
    max_bytes: u64,
}

impl DirectoryDelivery {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }
}

/// Moves `from` to `to`, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

/// Picks `name`, or `stem (n).ext` if it already exists in `dir`.
fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1u32..)
        .map(|n| dir.join(format!("{} ({}){}", stem, n, ext)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[async_trait]
impl DeliveryChannel for DirectoryDelivery {
    fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    async fn deliver(&self, artifact: &Path, file_name: &str) -> Result<DeliveredArtifact, DeliveryError> {
        let size = fs::metadata(artifact)?.len();
        if let DeliveryCheck::Reject { size, limit } = check_delivery_limit(size, self.max_bytes) {
            return Err(DeliveryError::TooLarge { size, limit });
        }

        let dir = self.dir.clone();
        let from = artifact.to_path_buf();
        let name = file_name.to_string();
        let location = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            fs::create_dir_all(&dir)?;
            let dest = unique_destination(&dir, &name);
            move_file(&from, &dest)?;
            Ok(dest)
        })
        .await
        .map_err(|e| DeliveryError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        debug!(from = %artifact.display(), to = %location.display(), "artifact moved");
        info!(location = %location.display(), size, "artifact delivered");

        Ok(DeliveredArtifact {
            file_name: location
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            location,
            size_bytes: size,
        })
    }
}
