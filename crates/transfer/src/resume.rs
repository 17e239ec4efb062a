use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::checksum_bytes;

/// Errors from checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Future returned by [`ResumeStore`] operations.
pub type ResumeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ResumeError>> + Send + 'a>>;

/// A persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub task_id: String,
    /// Last acknowledged byte offset.
    pub offset: u64,
    /// Caller data needed to restart the transfer in a later process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<serde_json::Value>,
}

impl Checkpoint {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            offset: 0,
            manifest: None,
        }
    }
}

/// Durable mapping from task identity to the last acknowledged byte offset.
///
/// Implementations serialize writes per task and never let a stored offset
/// go backwards; only [`clear`](ResumeStore::clear) removes it.
pub trait ResumeStore: Send + Sync {
    /// Returns the checkpointed offset for a task, if any.
    fn get<'a>(&'a self, task_id: &'a str) -> ResumeFuture<'a, Option<u64>>;

    /// Records `offset` for a task. Offsets below the stored one are ignored.
    fn put<'a>(&'a self, task_id: &'a str, offset: u64) -> ResumeFuture<'a, ()>;

    /// Attaches `manifest` to a task's checkpoint, creating it at offset 0
    /// when absent. The stored offset is kept.
    fn register<'a>(&'a self, task_id: &'a str, manifest: &'a serde_json::Value) -> ResumeFuture<'a, ()>;

    /// Forgets a task's checkpoint. Clearing an absent task is not an error.
    fn clear<'a>(&'a self, task_id: &'a str) -> ResumeFuture<'a, ()>;

    /// Every stored checkpoint, ordered by task id.
    fn list(&self) -> ResumeFuture<'_, Vec<Checkpoint>>;
}

// ---------------------------------------------------------------------------
// FileResumeStore
// ---------------------------------------------------------------------------

/// Checkpoints persisted as one small JSON file per task.
///
/// File names are the hex SHA-256 of the task id, so arbitrary ids map to
/// safe names. Writes land in a temp file that is renamed over the
/// checkpoint, so a crash mid-write leaves the previous offset intact.
pub struct FileResumeStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileResumeStore {
    /// Creates a store rooted at `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the directory holding checkpoint files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", checksum_bytes(task_id.as_bytes())))
    }

    fn lock_for(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(task_id.to_string()).or_default())
    }

    /// Drops the lock of a cleared task unless another caller holds it.
    fn release_lock(&self, task_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one in `lock`.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(task_id);
        }
    }

    async fn load(&self, task_id: &str) -> Result<Option<Checkpoint>, ResumeError> {
        let path = self.path_for(task_id);
        match read_checkpoint(&path).await? {
            Some(cp) if cp.task_id == task_id => Ok(Some(cp)),
            Some(cp) => {
                warn!(
                    task = %task_id,
                    stored = %cp.task_id,
                    "checkpoint file belongs to another task, ignoring"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn store(&self, checkpoint: &Checkpoint) -> Result<(), ResumeError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&checkpoint.task_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(checkpoint)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

async fn read_checkpoint(path: &Path) -> Result<Option<Checkpoint>, ResumeError> {
    let data = match tokio::fs::read(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

impl ResumeStore for FileResumeStore {
    fn get<'a>(&'a self, task_id: &'a str) -> ResumeFuture<'a, Option<u64>> {
        Box::pin(async move {
            let lock = self.lock_for(task_id);
            let _guard = lock.lock().await;
            Ok(self.load(task_id).await?.map(|cp| cp.offset))
        })
    }

    fn put<'a>(&'a self, task_id: &'a str, offset: u64) -> ResumeFuture<'a, ()> {
        Box::pin(async move {
            let lock = self.lock_for(task_id);
            let _guard = lock.lock().await;

            let mut checkpoint = self
                .load(task_id)
                .await?
                .unwrap_or_else(|| Checkpoint::new(task_id));
            if checkpoint.offset > offset {
                debug!(task = %task_id, existing = checkpoint.offset, offset, "ignoring regressing checkpoint");
                return Ok(());
            }
            checkpoint.offset = offset;
            self.store(&checkpoint).await?;
            debug!(task = %task_id, offset, "checkpoint persisted");
            Ok(())
        })
    }

    fn register<'a>(&'a self, task_id: &'a str, manifest: &'a serde_json::Value) -> ResumeFuture<'a, ()> {
        Box::pin(async move {
            let lock = self.lock_for(task_id);
            let _guard = lock.lock().await;

            let mut checkpoint = self
                .load(task_id)
                .await?
                .unwrap_or_else(|| Checkpoint::new(task_id));
            checkpoint.manifest = Some(manifest.clone());
            self.store(&checkpoint).await?;
            debug!(task = %task_id, offset = checkpoint.offset, "manifest registered");
            Ok(())
        })
    }

    fn clear<'a>(&'a self, task_id: &'a str) -> ResumeFuture<'a, ()> {
        Box::pin(async move {
            let lock = self.lock_for(task_id);
            let guard = lock.lock().await;
            let result = match tokio::fs::remove_file(self.path_for(task_id)).await {
                Ok(()) => {
                    debug!(task = %task_id, "checkpoint cleared");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
            drop(guard);
            self.release_lock(task_id, lock);
            result
        })
    }

    fn list(&self) -> ResumeFuture<'_, Vec<Checkpoint>> {
        Box::pin(async move {
            let mut out = Vec::new();
            let mut rd = match tokio::fs::read_dir(&self.dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = rd.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_checkpoint(&path).await {
                    Ok(Some(cp)) => out.push(cp),
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
                }
            }
            out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
            Ok(out)
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryResumeStore
// ---------------------------------------------------------------------------

/// In-process checkpoint store with the same semantics as [`FileResumeStore`].
#[derive(Default)]
pub struct MemoryResumeStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Checkpoint>> {
        self.checkpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Synchronous read, for inspection.
    pub fn offset(&self, task_id: &str) -> Option<u64> {
        self.map().get(task_id).map(|cp| cp.offset)
    }

    /// Synchronous write, for seeding a checkpoint.
    pub fn seed(&self, task_id: &str, offset: u64) {
        self.map()
            .entry(task_id.to_string())
            .or_insert_with(|| Checkpoint::new(task_id))
            .offset = offset;
    }
}

impl ResumeStore for MemoryResumeStore {
    fn get<'a>(&'a self, task_id: &'a str) -> ResumeFuture<'a, Option<u64>> {
        Box::pin(async move { Ok(self.offset(task_id)) })
    }

    fn put<'a>(&'a self, task_id: &'a str, offset: u64) -> ResumeFuture<'a, ()> {
        Box::pin(async move {
            let mut map = self.map();
            let cp = map
                .entry(task_id.to_string())
                .or_insert_with(|| Checkpoint::new(task_id));
            if offset > cp.offset {
                cp.offset = offset;
            }
            Ok(())
        })
    }

    fn register<'a>(&'a self, task_id: &'a str, manifest: &'a serde_json::Value) -> ResumeFuture<'a, ()> {
        Box::pin(async move {
            self.map()
                .entry(task_id.to_string())
                .or_insert_with(|| Checkpoint::new(task_id))
                .manifest = Some(manifest.clone());
            Ok(())
        })
    }

    fn clear<'a>(&'a self, task_id: &'a str) -> ResumeFuture<'a, ()> {
        Box::pin(async move {
            self.map().remove(task_id);
            Ok(())
        })
    }

    fn list(&self) -> ResumeFuture<'_, Vec<Checkpoint>> {
        Box::pin(async move {
            let mut out: Vec<Checkpoint> = self.map().values().cloned().collect();
            out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
            Ok(out)
        })
    }
}
