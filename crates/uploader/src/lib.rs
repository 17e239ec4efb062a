//! Upload queue for user-recorded media.
//!
//! Callers submit [`UploadRequest`]s to an [`UploadCoordinator`]. Each
//! task is signed, streamed through the resumable transfer engine, and on
//! completion handed to the [`CompletionNotifier`], which updates the
//! remote record and cleans up local state.
//!
//! # Pipeline
//!
//! 1. **Enqueue**: deduplicate by identity, wait for a transfer slot
//! 2. **Sign**: obtain write and public URLs
//! 3. **Transfer**: single request or checkpointed chunks
//! 4. **Notify**: record update, checkpoint purge, ephemeral cleanup
//! 5. **Retire**: drop from the queue, fire all-complete for the batch
//!
//! Each task's request is persisted next to its checkpoint, so
//! [`UploadCoordinator::recover`] can pick interrupted uploads back up in
//! a later process.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod notifier;
pub mod task;

// Re-export primary types for convenience.
pub use config::{CONFIG_ENV, RetryConfig, UploaderConfig, config_dir, default_config_path};
pub use coordinator::{CoordinatorSettings, Enqueued, UploadCoordinator};
pub use error::{NotifyError, UploadError};
pub use events::UploadEvent;
pub use notifier::{
    CompletionNotifier, HttpRecordUpdater, LogRecordUpdater, NotifyFuture, RecordUpdater,
    cache_busted_url,
};
pub use task::{ResourceNamer, TaskId, UploadRequest, UploadTask, detect_mime_type};
