use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;

use super::progress::{Progress, ProgressListener};
use super::source::ChunkSource;
use super::transport::{
    ChunkTransport, InitRequest, OutgoingChunk, ProgressEvent, ProgressReporter, TransferError,
};
use crate::config::ClientConfig;
use crate::registry::short_id;
use crate::utils::chunk_count;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Can't initialize file uploading: {0}")]
    Init(#[source] TransferError),

    #[error("Chunk {index} failed: {source}")]
    Chunk {
        index: usize,
        #[source]
        source: TransferError,
    },

    #[error("Upload session is gone on the server (chunk {index}): {source}")]
    SessionLost {
        index: usize,
        #[source]
        source: TransferError,
    },

    #[error("Upload canceled by user")]
    Aborted,

    #[error("Invalid upload options: {0}")]
    InvalidOptions(String),

    #[error("Can't {action} while the upload is {phase:?}")]
    InvalidState {
        action: &'static str,
        phase: UploadPhase,
    },
}

impl UploadError {
    /// a chunk failure leaves the queue intact, `resume` picks it up again.
    /// a lost session is not resumable, the upload has to start over
    pub fn is_resumable(&self) -> bool {
        matches!(self, UploadError::Chunk { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// bytes per chunk
    pub chunk_size: u64,
    /// max chunk transfers in flight at once
    pub concurrency: usize,
    /// a chunk transfer running longer than this fails as a transport error
    pub chunk_timeout: Option<Duration>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            concurrency: 2,
            chunk_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl UploadOptions {
    pub fn new(chunk_size: u64, concurrency: usize) -> Self {
        Self {
            chunk_size,
            concurrency,
            ..Self::default()
        }
    }

    pub fn with_chunk_timeout(mut self, chunk_timeout: Option<Duration>) -> Self {
        self.chunk_timeout = chunk_timeout;
        self
    }

    fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidOptions("chunk size must be positive".into()));
        }
        if usize::try_from(self.chunk_size).is_err() {
            return Err(UploadError::InvalidOptions("chunk size does not fit in memory".into()));
        }
        if self.concurrency == 0 {
            return Err(UploadError::InvalidOptions("concurrency must be positive".into()));
        }
        Ok(())
    }
}

impl From<&ClientConfig> for UploadOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            concurrency: config.concurrency,
            chunk_timeout: Some(config.chunk_timeout),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    /// nothing started, `start` is allowed
    Idle,
    Running,
    /// stopped after a chunk failure, `resume` is allowed
    Halted,
    Completed,
    Aborted,
    /// the server dropped the session, only `reset` and a new `start` help
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Completed,
    /// queued again after its last attempt failed
    Failed,
}

/// one slice of the source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTask {
    pub index: usize,
    pub range: Range<u64>,
    pub status: ChunkStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub session_id: String,
    pub chunk_count: usize,
    pub total_size: u64,
}

// the uploader's abort token; `reset` swaps the token inside the cell so
// handles taken earlier keep reaching the current upload
type SharedToken = Arc<Mutex<CancellationToken>>;

fn current_token(cell: &SharedToken) -> CancellationToken {
    cell.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Cancels a running upload from anywhere.
///
/// A handle stays bound to its [`Uploader`] across [`Uploader::reset`]:
/// after a reset it aborts the next upload, not the finished one.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    token: SharedToken,
}

impl AbortHandle {
    pub fn abort(&self) {
        current_token(&self.token).cancel();
    }

    pub fn is_aborted(&self) -> bool {
        current_token(&self.token).is_cancelled()
    }
}

struct InFlight {
    cancel: CancellationToken,
    len: u64,
    /// last byte offset reported by the transport
    offset: u64,
}

// every index lives in exactly one of pending, in_flight, completed
struct TransferState {
    session_id: String,
    pending: VecDeque<usize>,
    in_flight: HashMap<usize, InFlight>,
    completed: HashSet<usize>,
    failed: HashSet<usize>,
    confirmed_bytes: u64,
    aborted: bool,
}

impl TransferState {
    fn new(session_id: String, chunk_count: usize) -> Self {
        Self {
            session_id,
            pending: (0..chunk_count).collect(),
            in_flight: HashMap::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
            confirmed_bytes: 0,
            aborted: false,
        }
    }
}

struct ActiveUpload {
    source: Arc<dyn ChunkSource>,
    chunk_size: u64,
    chunk_count: usize,
    total_size: u64,
    state: TransferState,
}

impl ActiveUpload {
    fn chunk_range(&self, index: usize) -> Range<u64> {
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_size);
        start..end
    }

    fn progress(&self) -> Progress {
        let in_flight: u64 = self.state.in_flight.values().map(|f| f.offset).sum();
        Progress {
            loaded: (self.state.confirmed_bytes + in_flight).min(self.total_size),
            total: self.total_size,
        }
    }

    fn report(&self) -> UploadReport {
        UploadReport {
            session_id: self.state.session_id.clone(),
            chunk_count: self.chunk_count,
            total_size: self.total_size,
        }
    }
}

/// Sends one source through a [`ChunkTransport`] in fixed-size chunks.
///
/// Chunk indices leave the queue in ascending order and at most
/// `concurrency` transfers run at once. A failed chunk goes back to the
/// front of the queue and the upload halts with [`UploadError::Chunk`];
/// nothing is retried until the caller invokes [`Uploader::resume`].
pub struct Uploader<T: ChunkTransport> {
    transport: Arc<T>,
    options: UploadOptions,
    listener: Option<Arc<dyn ProgressListener>>,
    abort: SharedToken,
    phase: UploadPhase,
    upload: Option<ActiveUpload>,
}

impl<T: ChunkTransport> Uploader<T> {
    pub fn new(transport: Arc<T>, options: UploadOptions) -> Self {
        Self {
            transport,
            options,
            listener: None,
            abort: Arc::new(Mutex::new(CancellationToken::new())),
            phase: UploadPhase::Idle,
            upload: None,
        }
    }

    pub fn with_listener(mut self, listener: impl ProgressListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn set_listener(&mut self, listener: Arc<dyn ProgressListener>) {
        self.listener = Some(listener);
    }

    /// change chunk size and concurrency before the upload starts
    pub fn configure(&mut self, chunk_size: u64, concurrency: usize) -> Result<(), UploadError> {
        if self.phase != UploadPhase::Idle {
            return Err(UploadError::InvalidState {
                action: "configure",
                phase: self.phase,
            });
        }

        let options = UploadOptions {
            chunk_size,
            concurrency,
            chunk_timeout: self.options.chunk_timeout,
        };
        options.validate()?;
        self.options = options;
        Ok(())
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    pub fn session_id(&self) -> Option<&str> {
        self.upload.as_ref().map(|u| u.state.session_id.as_str())
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.abort.clone(),
        }
    }

    /// tear down every in-flight transfer; no further chunk is sent
    pub fn abort(&self) {
        current_token(&self.abort).cancel();
    }

    pub fn progress(&self) -> Option<Progress> {
        self.upload.as_ref().map(ActiveUpload::progress)
    }

    /// queued indices in the order they will be sent
    pub fn pending_chunks(&self) -> Vec<usize> {
        self.upload
            .as_ref()
            .map(|u| u.state.pending.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn chunk_tasks(&self) -> Vec<ChunkTask> {
        let Some(upload) = &self.upload else {
            return Vec::new();
        };

        (0..upload.chunk_count)
            .map(|index| {
                let state = &upload.state;
                let status = if state.completed.contains(&index) {
                    ChunkStatus::Completed
                } else if state.in_flight.contains_key(&index) {
                    ChunkStatus::InFlight
                } else if state.failed.contains(&index) {
                    ChunkStatus::Failed
                } else {
                    ChunkStatus::Pending
                };

                ChunkTask {
                    index,
                    range: upload.chunk_range(index),
                    status,
                }
            })
            .collect()
    }

    /// forget the previous upload so `start` can run again
    pub fn reset(&mut self) {
        self.upload = None;
        self.phase = UploadPhase::Idle;

        let mut token = self.abort.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// Open a session for `source` and send every chunk.
    ///
    /// Chunk transfers are owned by the returned future: dropping it
    /// cancels them, and the uploader then needs [`Uploader::reset`].
    pub async fn start(
        &mut self,
        source: impl ChunkSource + 'static,
    ) -> Result<UploadReport, UploadError> {
        if self.phase != UploadPhase::Idle {
            return Err(UploadError::InvalidState {
                action: "start",
                phase: self.phase,
            });
        }
        self.options.validate()?;

        let abort = current_token(&self.abort);
        if abort.is_cancelled() {
            self.phase = UploadPhase::Aborted;
            return Err(UploadError::Aborted);
        }

        let source: Arc<dyn ChunkSource> = Arc::new(source);
        let total_size = source.size();
        let chunk_size = self.options.chunk_size;
        let chunks = chunk_count(total_size, chunk_size);

        let request = InitRequest {
            name: source.name().to_string(),
            size: total_size,
            chunk_count: chunks,
        };

        self.phase = UploadPhase::Running;

        let transport = self.transport.clone();
        let init = tokio::select! {
            biased;
            _ = abort.cancelled() => None,
            result = transport.init(&request) => Some(result),
        };

        let session_id = match init {
            None => {
                self.phase = UploadPhase::Aborted;
                return Err(UploadError::Aborted);
            }
            Some(Err(e)) => {
                tracing::warn!("Failed to initialize upload of {}: {}", request.name, e);
                self.phase = UploadPhase::Idle;
                return Err(UploadError::Init(e));
            }
            Some(Ok(session_id)) => session_id,
        };

        tracing::info!(
            "📤 Uploading {} ({} bytes, {} chunks of {}, session {})",
            request.name,
            total_size,
            chunks,
            chunk_size,
            short_id(&session_id)
        );

        let chunk_count = chunks as usize;
        self.upload = Some(ActiveUpload {
            source,
            chunk_size,
            chunk_count,
            total_size,
            state: TransferState::new(session_id, chunk_count),
        });

        self.drive().await
    }

    /// continue a halted upload with the chunks still queued
    pub async fn resume(&mut self) -> Result<UploadReport, UploadError> {
        if self.phase != UploadPhase::Halted {
            return Err(UploadError::InvalidState {
                action: "resume",
                phase: self.phase,
            });
        }

        if current_token(&self.abort).is_cancelled() {
            self.phase = UploadPhase::Aborted;
            return Err(UploadError::Aborted);
        }

        if let Some(upload) = &self.upload {
            tracing::info!(
                "Resuming upload {} with {} chunks left",
                short_id(&upload.state.session_id),
                upload.state.pending.len()
            );
        }

        self.phase = UploadPhase::Running;
        self.drive().await
    }

    async fn drive(&mut self) -> Result<UploadReport, UploadError> {
        let Some(mut upload) = self.upload.take() else {
            self.phase = UploadPhase::Idle;
            return Err(UploadError::InvalidState {
                action: "send chunks",
                phase: UploadPhase::Idle,
            });
        };

        let abort = current_token(&self.abort);
        let result = run(
            &mut upload,
            &self.transport,
            &self.options,
            self.listener.as_deref(),
            &abort,
        )
        .await;

        self.phase = match &result {
            Ok(_) => UploadPhase::Completed,
            Err(UploadError::Aborted) => UploadPhase::Aborted,
            Err(UploadError::SessionLost { .. }) => UploadPhase::Failed,
            Err(_) => UploadPhase::Halted,
        };

        match &result {
            Ok(report) => tracing::info!(
                "✅ Upload {} finished ({} bytes)",
                short_id(&report.session_id),
                report.total_size
            ),
            Err(UploadError::Aborted) => tracing::info!(
                "Upload {} aborted",
                short_id(&upload.state.session_id)
            ),
            Err(e) => tracing::warn!(
                "Upload {} halted: {}",
                short_id(&upload.state.session_id),
                e
            ),
        }

        self.upload = Some(upload);
        result
    }
}

// spawned chunk transfers, dropping this aborts every one of them
struct Transfers {
    set: JoinSet<(usize, Result<u64, TransferError>)>,
    tasks: HashMap<Id, usize>,
}

fn emit(upload: &ActiveUpload, listener: Option<&dyn ProgressListener>) {
    if let Some(listener) = listener {
        listener.on_progress(upload.progress());
    }
}

// the single control flow: dispatch, then fold one event back in, repeat
async fn run<T: ChunkTransport>(
    upload: &mut ActiveUpload,
    transport: &Arc<T>,
    options: &UploadOptions,
    listener: Option<&dyn ProgressListener>,
    abort: &CancellationToken,
) -> Result<UploadReport, UploadError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut transfers = Transfers {
        set: JoinSet::new(),
        tasks: HashMap::new(),
    };
    let mut failure: Option<UploadError> = None;

    loop {
        if failure.is_none() && !upload.state.aborted {
            dispatch(upload, transport, options, &tx, abort, &mut transfers);
        }

        if upload.state.in_flight.is_empty() {
            if upload.state.aborted {
                return Err(UploadError::Aborted);
            }
            if let Some(failure) = failure {
                return Err(failure);
            }
            if upload.state.pending.is_empty() {
                return Ok(upload.report());
            }
        }

        tokio::select! {
            biased;
            _ = abort.cancelled(), if !upload.state.aborted => {
                upload.state.aborted = true;
                for flight in upload.state.in_flight.values() {
                    flight.cancel.cancel();
                }
                tracing::debug!(
                    "Abort requested, cancelling {} transfers",
                    upload.state.in_flight.len()
                );
            }
            // drain offsets before the completion they precede
            Some(event) = rx.recv() => {
                handle_progress(upload, event);
                emit(upload, listener);
            }
            Some(joined) = transfers.set.join_next_with_id() => {
                let finished = match joined {
                    Ok((id, (index, outcome))) => {
                        transfers.tasks.remove(&id);
                        Some((index, outcome))
                    }
                    Err(e) => transfers.tasks.remove(&e.id()).map(|index| {
                        tracing::error!("Transfer task for chunk {} died: {}", index, e);
                        (index, Err(TransferError::Task(e)))
                    }),
                };

                if let Some((index, outcome)) = finished {
                    handle_finished(upload, index, outcome, &mut failure);
                    emit(upload, listener);
                }
            }
            else => return Err(UploadError::Aborted),
        }
    }
}

// fill free slots from the front of the queue
fn dispatch<T: ChunkTransport>(
    upload: &mut ActiveUpload,
    transport: &Arc<T>,
    options: &UploadOptions,
    tx: &UnboundedSender<ProgressEvent>,
    abort: &CancellationToken,
    transfers: &mut Transfers,
) {
    while upload.state.in_flight.len() < options.concurrency {
        let Some(index) = upload.state.pending.pop_front() else {
            break;
        };

        let range = upload.chunk_range(index);
        let len = range.end - range.start;
        let cancel = abort.child_token();

        upload.state.failed.remove(&index);
        upload.state.in_flight.insert(
            index,
            InFlight {
                cancel: cancel.clone(),
                len,
                offset: 0,
            },
        );

        tracing::trace!("Dispatching chunk {} ({}..{})", index, range.start, range.end);

        let transport = transport.clone();
        let source = upload.source.clone();
        let session_id = upload.state.session_id.clone();
        let chunk_timeout = options.chunk_timeout;
        let reporter = ProgressReporter::new(index, tx.clone());

        let task = transfers.set.spawn(async move {
            let transfer = async {
                let data = source.read_range(range.start, len as usize).await?;
                let chunk = OutgoingChunk {
                    session_id,
                    index,
                    data,
                };

                let acknowledged = match chunk_timeout {
                    Some(limit) => tokio::time::timeout(limit, transport.send_chunk(chunk, reporter))
                        .await
                        .map_err(|_| TransferError::Timeout)??,
                    None => transport.send_chunk(chunk, reporter).await?,
                };

                if acknowledged != len {
                    return Err(TransferError::AckMismatch {
                        sent: len,
                        acknowledged,
                    });
                }

                Ok::<u64, TransferError>(acknowledged)
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
                outcome = transfer => outcome,
            };

            (index, outcome)
        });

        transfers.tasks.insert(task.id(), index);
    }
}

fn handle_progress(upload: &mut ActiveUpload, event: ProgressEvent) {
    // reports from a transfer that already finished are stale
    if let Some(flight) = upload.state.in_flight.get_mut(&event.index) {
        flight.offset = flight.offset.max(event.offset.min(flight.len));
    }
}

fn handle_finished(
    upload: &mut ActiveUpload,
    index: usize,
    outcome: Result<u64, TransferError>,
    failure: &mut Option<UploadError>,
) {
    let state = &mut upload.state;

    let Some(flight) = state.in_flight.remove(&index) else {
        return;
    };

    match outcome {
        Ok(_) if !state.aborted => {
            state.confirmed_bytes += flight.len;
            state.completed.insert(index);
            tracing::debug!(
                "Chunk {} acknowledged ({}/{})",
                index,
                state.completed.len(),
                upload.chunk_count
            );
        }
        Ok(_) => {
            // landed after abort, the upload is over regardless
            state.confirmed_bytes += flight.offset;
            state.pending.push_front(index);
        }
        Err(e) => {
            state.confirmed_bytes += flight.offset;
            state.pending.push_front(index);

            if e.is_cancelled() || state.aborted {
                tracing::debug!("Chunk {} cancelled", index);
                return;
            }

            tracing::warn!("Chunk {} failed: {}", index, e);
            state.failed.insert(index);

            let lost = matches!(failure, Some(UploadError::SessionLost { .. }));
            if e.is_session_lost() && !lost {
                *failure = Some(UploadError::SessionLost { index, source: e });
            } else if failure.is_none() {
                *failure = Some(UploadError::Chunk { index, source: e });
            }
        }
    }
}
