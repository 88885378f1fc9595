use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::models::UNKNOWN_SESSION_ERROR;
use crate::registry::{short_id, ChunkAdmission, RegistryError, SessionRegistry};
use crate::storage::{StorageSink, StoredFile};

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("{}", UNKNOWN_SESSION_ERROR)]
    UnknownSession,

    #[error("Chunk uploading was not completed")]
    IncompleteChunk { declared: u64, received: u64 },

    #[error("Chunk id is out of range")]
    ChunkOutOfRange { index: usize, chunk_count: usize },

    #[error("Assembled file size does not match declared content length")]
    SizeMismatch { declared: u64, assembled: u64 },

    #[error("Failed to persist uploaded file")]
    Storage(#[source] std::io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// acknowledgement for one accepted chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// bytes recorded for this index
    pub size: u64,
    /// set when this chunk finished the upload
    pub completed: Option<StoredFile>,
}

/// turns incoming chunks into finished files
#[derive(Clone)]
pub struct ChunkAssembler {
    registry: Arc<SessionRegistry>,
    storage: Arc<dyn StorageSink>,
}

impl ChunkAssembler {
    pub fn new(registry: Arc<SessionRegistry>, storage: Arc<dyn StorageSink>) -> Self {
        Self { registry, storage }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// register a new upload, returns its session id
    /// a zero chunk upload has nothing to wait for and is persisted right away
    pub async fn open(
        &self,
        filename: String,
        total_size: u64,
        chunk_count: usize,
    ) -> Result<String, AssemblyError> {
        let session_id = self
            .registry
            .create_session(filename.clone(), total_size, chunk_count)?;

        if chunk_count == 0 {
            self.registry.remove(&session_id);
            let stored = self.persist(&filename, total_size, Bytes::new()).await?;
            tracing::info!("✅ Stored empty upload {:?}", stored.path);
        }

        Ok(session_id)
    }

    /// admit one chunk; assembles and persists the file when it is the last one
    pub async fn accept_chunk(
        &self,
        session_id: &str,
        index: usize,
        bytes: Bytes,
        declared_len: u64,
    ) -> Result<ChunkReceipt, AssemblyError> {
        let handle = self
            .registry
            .get_session(session_id)
            .ok_or(AssemblyError::UnknownSession)?;

        // store, count and completion check run under one lock per session
        let mut session = handle.lock().await;

        // lost the race against the request that finished this session
        if session.is_closed() {
            return Err(AssemblyError::UnknownSession);
        }

        let received = bytes.len() as u64;
        if received != declared_len {
            tracing::warn!(
                "Chunk {} of {} truncated: declared {} bytes, got {}",
                index,
                short_id(session_id),
                declared_len,
                received
            );
            return Err(AssemblyError::IncompleteChunk {
                declared: declared_len,
                received,
            });
        }

        if index >= session.chunk_count {
            return Err(AssemblyError::ChunkOutOfRange {
                index,
                chunk_count: session.chunk_count,
            });
        }

        let size = match session.store_chunk(index, bytes) {
            ChunkAdmission::Stored(size) => {
                tracing::debug!(
                    "📦 Received chunk {} ({}/{}) for {}",
                    index,
                    session.received(),
                    session.chunk_count,
                    short_id(session_id)
                );
                size
            }
            ChunkAdmission::Duplicate(size) => {
                tracing::debug!("Chunk {} for {} already stored, keeping it", index, short_id(session_id));
                size
            }
        };

        if !session.is_complete() {
            return Ok(ChunkReceipt {
                size,
                completed: None,
            });
        }

        let content = session.take_content();
        let filename = session.filename.clone();
        let total_size = session.total_size;

        // the session goes away whether or not the write succeeds
        self.registry.remove(session_id);
        drop(session);

        let stored = self.persist(&filename, total_size, content).await?;

        tracing::info!(
            "✅ Completed upload: {} ({} bytes, sha256 {})",
            filename,
            stored.size,
            stored.sha256
        );

        Ok(ChunkReceipt {
            size,
            completed: Some(stored),
        })
    }

    async fn persist(
        &self,
        filename: &str,
        total_size: u64,
        content: Bytes,
    ) -> Result<StoredFile, AssemblyError> {
        let assembled = content.len() as u64;
        if assembled != total_size {
            tracing::warn!(
                "Discarding {}: declared {} bytes, assembled {}",
                filename,
                total_size,
                assembled
            );
            return Err(AssemblyError::SizeMismatch {
                declared: total_size,
                assembled,
            });
        }

        self.storage.persist(filename, content).await.map_err(|e| {
            tracing::error!("Failed to persist {}: {}", filename, e);
            AssemblyError::Storage(e)
        })
    }
}
