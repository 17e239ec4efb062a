//! Upload error types.

use reelsync_protocol::UploadStatus;

use crate::task::TaskId;

/// Failure to update the remote record after a completed upload.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("record endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid auth token")]
    InvalidToken,

    #[error("{0}")]
    Other(String),
}

/// Errors produced by the upload queue.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("signing failed: {0}")]
    Sign(#[from] reelsync_signer::SignRequestError),

    #[error("transfer failed: {0}")]
    Transfer(#[from] reelsync_transfer::TransferError),

    #[error("sink setup failed: {0}")]
    Sink(#[from] reelsync_transfer::ChunkTransferError),

    #[error("checkpoint error: {0}")]
    Persistence(#[from] reelsync_transfer::ResumeError),

    #[error("record update failed: {0}")]
    Notify(#[from] NotifyError),

    #[error("invalid upload request: {0}")]
    InvalidRequest(String),

    #[error("no task {0}")]
    NotFound(TaskId),

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: UploadStatus,
        to: UploadStatus,
    },

    #[error("task {task_id} already restarted {restarts} times")]
    RestartsExhausted { task_id: TaskId, restarts: u32 },
}
