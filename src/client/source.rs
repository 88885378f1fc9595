use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// something an upload can read byte ranges from
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// name announced to the server
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    async fn read_range(&self, offset: u64, len: usize) -> std::io::Result<Bytes>;
}

/// a file on disk, reopened for every chunk so reads can run in parallel
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;

        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());

        Ok(Self {
            path,
            name,
            size: metadata.len(),
        })
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;

        Ok(Bytes::from(buf))
    }
}

/// bytes already in memory
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Bytes,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let start = offset as usize;
        let end = start.saturating_add(len);

        if end > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("range {}..{} past end of {} bytes", start, end, self.data.len()),
            ));
        }

        Ok(self.data.slice(start..end))
    }
}
