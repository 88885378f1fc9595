use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::utils::sanitize_filename;

/// where an assembled upload ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub size: u64,
    /// hex sha256 of the whole file
    pub sha256: String,
}

/// durable sink for assembled uploads
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn persist(&self, filename: &str, content: Bytes) -> std::io::Result<StoredFile>;
}

/// writes uploads into a single directory
#[derive(Debug, Clone)]
pub struct DiskStorage {
    files_dir: PathBuf,
}

impl DiskStorage {
    pub fn new(files_dir: PathBuf) -> Self {
        Self { files_dir }
    }
}

#[async_trait]
impl StorageSink for DiskStorage {
    async fn persist(&self, filename: &str, content: Bytes) -> std::io::Result<StoredFile> {
        // sanitize filename to prevent directory traversal
        let sanitized = sanitize_filename(filename);
        let path = self.files_dir.join(&sanitized);
        tracing::trace!("Sanitized filename: {} -> {}", filename, sanitized);

        let mut file = fs::File::create(&path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;

        let sha256 = hex::encode(Sha256::digest(&content));
        tracing::debug!("Wrote {} bytes to {:?}", content.len(), path);

        Ok(StoredFile {
            path,
            size: content.len() as u64,
            sha256,
        })
    }
}
