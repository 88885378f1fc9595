use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Response};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::models::{
    ServerReply, HEADER_CHUNKS_QUANTITY, HEADER_CHUNK_ID, HEADER_CONTENT_ID,
    HEADER_CONTENT_LENGTH, HEADER_CONTENT_NAME, UNKNOWN_SESSION_ERROR,
};

/// body slices yielded to the connection between progress reports
const PROGRESS_SLICE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Server acknowledged {acknowledged} bytes, {sent} were sent")]
    AckMismatch { sent: u64, acknowledged: u64 },

    #[error("Unexpected server reply: {0}")]
    Protocol(String),

    #[error("Chunk transfer timed out")]
    Timeout,

    #[error("Upload canceled by user")]
    Cancelled,

    #[error("Failed to read source: {0}")]
    Source(#[from] std::io::Error),

    #[error("Chunk transfer task failed: {0}")]
    Task(#[source] tokio::task::JoinError),
}

impl TransferError {
    /// cancellation is requested by the caller, never worth resuming
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// the server no longer holds the session: it expired, was never there,
    /// or was discarded by a server fault. only a fresh init helps
    pub fn is_session_lost(&self) -> bool {
        match self {
            TransferError::Rejected { status, message } => {
                *status >= 500 || message == UNKNOWN_SESSION_ERROR
            }
            _ => false,
        }
    }
}

/// what the server needs to open a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequest {
    pub name: String,
    pub size: u64,
    pub chunk_count: u64,
}

/// one chunk on its way out
#[derive(Debug, Clone)]
pub struct OutgoingChunk {
    pub session_id: String,
    pub index: usize,
    pub data: Bytes,
}

/// byte offset reached by one in-flight chunk
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProgressEvent {
    pub(crate) index: usize,
    pub(crate) offset: u64,
}

/// feeds per-chunk byte offsets back into the uploader
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    index: usize,
    tx: Option<UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    pub(crate) fn new(index: usize, tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { index, tx: Some(tx) }
    }

    /// a reporter nobody listens to
    pub fn detached(index: usize) -> Self {
        Self { index, tx: None }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// `offset` bytes of this chunk have left the client
    pub fn report(&self, offset: u64) {
        if let Some(tx) = &self.tx {
            // the uploader may already have returned
            let _ = tx.send(ProgressEvent {
                index: self.index,
                offset,
            });
        }
    }
}

/// the wire between uploader and server
#[async_trait]
pub trait ChunkTransport: Send + Sync + 'static {
    /// open a session, returns its id
    async fn init(&self, request: &InitRequest) -> Result<String, TransferError>;

    /// send one chunk, returns the byte count the server recorded for it
    async fn send_chunk(
        &self,
        chunk: OutgoingChunk,
        progress: ProgressReporter,
    ) -> Result<u64, TransferError>;
}

/// chunk protocol over plain http requests
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransferError> {
        let client = Client::builder().tcp_nodelay(true).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

// decode a json reply and turn any non-200 into an error
async fn read_reply(response: Response) -> Result<ServerReply, TransferError> {
    let http_status = response.status();
    let text = response.text().await?;

    let reply: ServerReply = match serde_json::from_str(&text) {
        Ok(reply) => reply,
        Err(_) if !http_status.is_success() => {
            return Err(TransferError::Rejected {
                status: http_status.as_u16(),
                message: text,
            });
        }
        Err(e) => {
            return Err(TransferError::Protocol(format!("{} ({})", e, text)));
        }
    };

    if !http_status.is_success() || reply.status != 200 {
        let status = if reply.status != 200 {
            reply.status
        } else {
            http_status.as_u16()
        };

        return Err(TransferError::Rejected {
            status,
            message: reply.error.unwrap_or_default(),
        });
    }

    Ok(reply)
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn init(&self, request: &InitRequest) -> Result<String, TransferError> {
        tracing::debug!(
            "Requesting upload session for {} ({} bytes, {} chunks)",
            request.name,
            request.size,
            request.chunk_count
        );

        // header values must be visible ascii
        let name: String = request
            .name
            .chars()
            .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
            .collect();

        let response = self
            .client
            .post(self.url("/upload/init"))
            .header(HEADER_CONTENT_NAME, name)
            .header(HEADER_CONTENT_LENGTH, request.size)
            .header(HEADER_CHUNKS_QUANTITY, request.chunk_count)
            .send()
            .await?;

        read_reply(response)
            .await?
            .file_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransferError::Protocol("Can't create file id".to_string()))
    }

    async fn send_chunk(
        &self,
        chunk: OutgoingChunk,
        progress: ProgressReporter,
    ) -> Result<u64, TransferError> {
        let len = chunk.data.len();
        let data = chunk.data;

        // report each slice as it is handed to the connection
        let slices = (0..len).step_by(PROGRESS_SLICE).map(move |start| {
            let end = (start + PROGRESS_SLICE).min(len);
            (data.slice(start..end), end as u64)
        });
        let body = futures::stream::iter(slices).map(move |(slice, sent)| {
            progress.report(sent);
            Ok::<Bytes, std::io::Error>(slice)
        });

        let response = self
            .client
            .post(self.url("/upload"))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .header(HEADER_CONTENT_ID, chunk.session_id.as_str())
            .header(HEADER_CHUNK_ID, chunk.index)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;

        read_reply(response)
            .await?
            .size
            .ok_or_else(|| TransferError::Protocol("reply has no size".to_string()))
    }
}
