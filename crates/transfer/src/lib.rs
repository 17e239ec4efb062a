//! Chunked upload transfer with resume support and progress tracking.
//!
//! The [`TransferEngine`] pushes a local file to a pre-signed write URL,
//! either in one request or as strictly ordered base64 chunks. Every
//! acknowledged chunk is checkpointed into a [`ResumeStore`] before the
//! next one is read, so an interrupted transfer picks up where the remote
//! store last confirmed.

mod chunked;
mod engine;
mod progress;
mod resume;
mod retry;
mod sink;
mod types;

pub use chunked::{ChunkReader, checksum_bytes};
pub use engine::{TransferConfig, TransferEngine};
pub use progress::{ProgressCallback, ProgressEvent, ProgressReporter, SubscriptionId};
pub use resume::{
    Checkpoint, FileResumeStore, MemoryResumeStore, ResumeError, ResumeFuture, ResumeStore,
};
pub use retry::RetryPolicy;
pub use sink::{ChunkSink, ChunkTransferError, HttpChunkSink, SinkFuture};
pub use types::{Chunk, EncodedChunk, TransferJob, TransferOutcome};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source {path} is {actual} bytes but {declared} were declared")]
    SizeMismatch {
        path: String,
        declared: u64,
        actual: u64,
    },

    /// Retry ceiling exceeded; `offset` is the last acknowledged byte offset.
    #[error("chunk at offset {offset} failed after {retries} retries: {source}")]
    ChunkTransferFatal {
        offset: u64,
        retries: u32,
        #[source]
        source: ChunkTransferError,
    },

    #[error("background task failed: {0}")]
    Join(String),
}

impl TransferError {
    /// Number of chunk retries spent before the error, if any.
    pub fn retries(&self) -> u32 {
        match self {
            TransferError::ChunkTransferFatal { retries, .. } => *retries,
            _ => 0,
        }
    }
}
