//! Source materialization for the download stage.

use crate::queue::SourceRef;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Called with the cumulative number of bytes written so far.
pub type FetchProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Materializes a media source into local storage.
///
/// Dropping the returned future aborts the transfer; the caller owns cleanup of `dest`.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Name of the fetcher (for logging)
    fn name(&self) -> &'static str;

    /// Copies `source` to `dest`, returning the number of bytes written.
    async fn fetch(
        &self,
        source: &SourceRef,
        dest: &Path,
        progress: FetchProgress,
    ) -> Result<u64, FetchError>;
}

/// Fetcher for sources that are already paths on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileFetcher;

#[async_trait]
impl SourceFetcher for LocalFileFetcher {
    fn name(&self) -> &'static str {
        "local-file"
    }

    async fn fetch(
        &self,
        source: &SourceRef,
        dest: &Path,
        progress: FetchProgress,
    ) -> Result<u64, FetchError> {
        let mut input = match tokio::fs::File::open(source.as_str()).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(source.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut output = tokio::fs::File::create(dest).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            output.write_all(&buf[..n]).await?;
            written += n as u64;
            progress(written);
        }
        output.flush().await?;

        debug!(source = %source, dest = %dest.display(), bytes = written, "source fetched");
        Ok(written)
    }
}
