use std::sync::Arc;

use crate::assembler::ChunkAssembler;
use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::storage::{DiskStorage, StorageSink};

/// shared application state
#[derive(Clone)]
pub struct AppState {
    /// largest chunk body read into memory
    pub max_chunk_size: usize,
    /// uploads in progress, keyed by session id
    pub registry: Arc<SessionRegistry>,
    pub assembler: ChunkAssembler,
}

impl AppState {
    /// create state writing finished uploads into `config.files_dir`
    pub fn new(config: &Config) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session_ttl));
        let storage = Arc::new(DiskStorage::new(config.files_dir.clone()));

        Self::with_storage(config.max_chunk_size, registry, storage)
    }

    pub fn with_storage(
        max_chunk_size: usize,
        registry: Arc<SessionRegistry>,
        storage: Arc<dyn StorageSink>,
    ) -> Self {
        Self {
            max_chunk_size,
            assembler: ChunkAssembler::new(registry.clone(), storage),
            registry,
        }
    }
}
