use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// bytes of entropy behind every session id (hex encoded on the wire)
pub const SESSION_ID_BYTES: usize = 32;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to generate session id: {0}")]
    Entropy(#[from] rand::Error),
}

/// what happened when a chunk was handed to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAdmission {
    /// first time this index was seen
    Stored(u64),
    /// index already held bytes, the original length is kept
    Duplicate(u64),
}

impl ChunkAdmission {
    pub fn size(&self) -> u64 {
        match *self {
            ChunkAdmission::Stored(size) | ChunkAdmission::Duplicate(size) => size,
        }
    }
}

/// one upload being reassembled on the server
#[derive(Debug)]
pub struct UploadSession {
    pub filename: String,
    pub total_size: u64,
    pub chunk_count: usize,
    chunks: BTreeMap<usize, Bytes>,
    received: usize,
    closed: bool,
    touched_at: Instant,
}

impl UploadSession {
    pub fn new(filename: String, total_size: u64, chunk_count: usize) -> Self {
        Self {
            filename,
            total_size,
            chunk_count,
            chunks: BTreeMap::new(),
            received: 0,
            closed: false,
            touched_at: Instant::now(),
        }
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn chunk_len(&self, index: usize) -> Option<u64> {
        self.chunks.get(&index).map(|c| c.len() as u64)
    }

    /// store bytes at `index`; an accepted index is never overwritten
    pub fn store_chunk(&mut self, index: usize, bytes: Bytes) -> ChunkAdmission {
        self.touched_at = Instant::now();

        if let Some(existing) = self.chunks.get(&index) {
            return ChunkAdmission::Duplicate(existing.len() as u64);
        }

        let size = bytes.len() as u64;
        self.chunks.insert(index, bytes);
        self.received += 1;
        ChunkAdmission::Stored(size)
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.chunk_count
    }

    /// true once assembly has been attempted; later requests must not touch it
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// join every chunk in index order and close the session
    pub fn take_content(&mut self) -> Bytes {
        self.closed = true;

        let total: usize = self.chunks.values().map(|c| c.len()).sum();
        let mut content = BytesMut::with_capacity(total);

        // BTreeMap iterates in ascending key order
        for chunk in std::mem::take(&mut self.chunks).into_values() {
            content.extend_from_slice(&chunk);
        }

        content.freeze()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.touched_at)
    }
}

pub type SessionHandle = Arc<Mutex<UploadSession>>;

/// process wide table of uploads in progress
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// allocate a session under a fresh random id
    pub fn create_session(
        &self,
        filename: String,
        total_size: u64,
        chunk_count: usize,
    ) -> Result<String, RegistryError> {
        let session_id = generate_session_id()?;
        let session = UploadSession::new(filename, total_size, chunk_count);

        self.sessions
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));

        Ok(session_id)
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.remove(session_id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// drop sessions idle for longer than the ttl, returns how many went
    /// sessions locked by an in-flight request count as active
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();

        self.sessions.retain(|id, session| match session.try_lock() {
            Ok(session) => {
                let keep = session.idle_for(now) < self.ttl;
                if !keep {
                    tracing::info!(
                        "⌛ Expired upload session for {} ({}/{} chunks, id {})",
                        session.filename,
                        session.received(),
                        session.chunk_count,
                        short_id(id)
                    );
                }
                keep
            }
            Err(_) => true,
        });

        before.saturating_sub(self.sessions.len())
    }

    /// sweep expired sessions every `every` until the runtime shuts down
    pub fn spawn_expiry_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(registry) = registry.upgrade() else {
                    break;
                };

                let purged = registry.purge_expired();
                if purged > 0 {
                    tracing::debug!("Purged {} expired sessions, {} active", purged, registry.len());
                }
            }
        })
    }
}

fn generate_session_id() -> Result<String, RegistryError> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// leading part of a session id, enough to correlate log lines
pub fn short_id(session_id: &str) -> &str {
    session_id.get(..12).unwrap_or(session_id)
}
