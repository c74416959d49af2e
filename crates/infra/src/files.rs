//! Final destination of reassembled uploads.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("invalid relative path: {0}")]
    InvalidPath(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    /// Write `bytes` at `relative` (below the store root), replacing any
    /// existing file. Returns the absolute path written.
    async fn write(&self, relative: &str, bytes: &[u8]) -> Result<PathBuf, FileStoreError>;
}

/// Filesystem store rooted at a directory.
///
/// Writes go to a temporary file in the target directory, are fsynced, then
/// renamed into place, so readers never observe a partial file.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, FileStoreError> {
        let rel = Path::new(relative.trim_start_matches('/'));
        let safe = rel
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
        if !safe || rel.as_os_str().is_empty() {
            return Err(FileStoreError::InvalidPath(relative.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait::async_trait]
impl FileStore for LocalFileStore {
    async fn write(&self, relative: &str, bytes: &[u8]) -> Result<PathBuf, FileStoreError> {
        let path = self.resolve(relative)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| FileStoreError::InvalidPath(relative.to_string()))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::now_v7()));
        if let Err(err) = write_synced(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "file written");
        Ok(path)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}
