//! Upload task model.

use std::borrow::Borrow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use reelsync_protocol::UploadStatus;
use serde::{Deserialize, Serialize};

/// Stable identity of an upload: `"{folder}/{resource_name}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(folder: &str, resource_name: &str) -> Self {
        Self(format!("{folder}/{resource_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Generates resource names of the form `"{owner}-{purpose}-{seq}"`.
///
/// The sequence starts at the current UNIX time in milliseconds and
/// increases by one per name, so names never repeat within a process and
/// are unlikely to collide across restarts.
pub struct ResourceNamer {
    next: AtomicU64,
}

impl Default for ResourceNamer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceNamer {
    pub fn new() -> Self {
        Self::starting_at(Utc::now().timestamp_millis().max(0) as u64)
    }

    pub fn starting_at(seq: u64) -> Self {
        Self {
            next: AtomicU64::new(seq),
        }
    }

    /// Returns the next name for `owner` and `purpose`.
    pub fn next_name(&self, owner: &str, purpose: &str) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{owner}-{purpose}-{seq}")
    }
}

/// Guesses a MIME type from the file extension.
pub fn detect_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("mp4" | "m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("3gp") => "video/3gpp",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("heic") => "image/heic",
        _ => "application/octet-stream",
    }
}

/// What a caller submits to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub source: PathBuf,
    /// Detected from the extension when `None`.
    #[serde(default)]
    pub mime_type: Option<String>,
    pub folder: String,
    pub resource_name: String,
    #[serde(default)]
    pub is_static: bool,
    /// Delete `source` once the upload completes.
    #[serde(default)]
    pub ephemeral: bool,
    /// Forwarded untouched to the record updater.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Read from file metadata when `None`.
    #[serde(default)]
    pub total_size: Option<u64>,
}

impl UploadRequest {
    pub fn new(source: impl Into<PathBuf>, folder: &str, resource_name: &str) -> Self {
        Self {
            source: source.into(),
            mime_type: None,
            folder: folder.to_string(),
            resource_name: resource_name.to_string(),
            is_static: false,
            ephemeral: false,
            metadata: serde_json::Value::Null,
            total_size: None,
        }
    }

    pub fn with_mime_type(mut self, mime: &str) -> Self {
        self.mime_type = Some(mime.to_string());
        self
    }

    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    pub fn with_ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_total_size(mut self, size: u64) -> Self {
        self.total_size = Some(size);
        self
    }

    pub fn task_id(&self) -> TaskId {
        TaskId::new(&self.folder, &self.resource_name)
    }
}

/// One upload tracked by the coordinator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    pub id: TaskId,
    pub source: PathBuf,
    pub mime_type: String,
    pub total_size: u64,
    pub folder: String,
    pub resource_name: String,
    pub is_static: bool,
    pub ephemeral: bool,
    pub metadata: serde_json::Value,
    #[serde(skip)]
    pub write_url: Option<String>,
    pub public_url: Option<String>,
    pub uploaded_bytes: u64,
    pub status: UploadStatus,
    /// Chunk retries accumulated across all attempts.
    pub retry_count: u32,
    /// Explicit retries after failure.
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadTask {
    pub(crate) fn from_request(req: UploadRequest, total_size: u64) -> Self {
        let now = Utc::now();
        let mime_type = req
            .mime_type
            .unwrap_or_else(|| detect_mime_type(&req.source).to_string());
        Self {
            id: TaskId::new(&req.folder, &req.resource_name),
            source: req.source,
            mime_type,
            total_size,
            folder: req.folder,
            resource_name: req.resource_name,
            is_static: req.is_static,
            ephemeral: req.ephemeral,
            metadata: req.metadata,
            write_url: None,
            public_url: None,
            uploaded_bytes: 0,
            status: UploadStatus::Queued,
            retry_count: 0,
            restart_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fraction of bytes acknowledged; 1.0 for an empty asset.
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 1.0;
        }
        (self.uploaded_bytes as f64 / self.total_size as f64).min(1.0)
    }

    /// The request that reproduces this task, with the detected MIME type
    /// and size pinned. Persisted so an interrupted upload can be resumed
    /// by a later process.
    pub fn request(&self) -> UploadRequest {
        UploadRequest {
            source: self.source.clone(),
            mime_type: Some(self.mime_type.clone()),
            folder: self.folder.clone(),
            resource_name: self.resource_name.clone(),
            is_static: self.is_static,
            ephemeral: self.ephemeral,
            metadata: self.metadata.clone(),
            total_size: Some(self.total_size),
        }
    }

    /// Applies a legal status change. Returns `false` and leaves the task
    /// untouched otherwise.
    pub(crate) fn set_status(&mut self, next: UploadStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    /// Raises the acknowledged byte count, clamped to the total.
    pub(crate) fn advance(&mut self, uploaded_bytes: u64) {
        let bytes = uploaded_bytes.min(self.total_size);
        if bytes > self.uploaded_bytes {
            self.uploaded_bytes = bytes;
            self.updated_at = Utc::now();
        }
    }
}
