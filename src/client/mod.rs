//! Client side of the chunk protocol.
//!
//! [`Uploader`] slices a [`ChunkSource`] into fixed-size chunks and pushes
//! them through a [`ChunkTransport`] with bounded concurrency. Progress is
//! reported to a [`ProgressListener`]; the terminal outcome is the `Result`
//! of [`Uploader::start`] / [`Uploader::resume`].

mod progress;
mod source;
mod transport;
mod uploader;

pub use progress::{Progress, ProgressListener};
pub use source::{ChunkSource, FileSource, MemorySource};
pub use transport::{
    ChunkTransport, HttpTransport, InitRequest, OutgoingChunk, ProgressReporter, TransferError,
};
pub use uploader::{
    AbortHandle, ChunkStatus, ChunkTask, UploadError, UploadOptions, UploadPhase, UploadReport,
    Uploader,
};
