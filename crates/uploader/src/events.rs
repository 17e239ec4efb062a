use reelsync_protocol::{RecordUpdate, UploadStatus};

use crate::task::{TaskId, UploadTask};

/// Event published by the coordinator for UI consumers.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// A task entered a new lifecycle state.
    StatusChanged { task_id: TaskId, status: UploadStatus },
    /// Acknowledged bytes advanced.
    Progress {
        task_id: TaskId,
        uploaded_bytes: u64,
        total_bytes: u64,
    },
    /// Every byte is stored and the task was retired. `task` is its final
    /// state, including the chunk retries it took.
    Completed {
        task: Box<UploadTask>,
        public_url: String,
    },
    /// The transfer stopped with an error. `retryable` is `false` once
    /// the restart budget is spent.
    Failed {
        task_id: TaskId,
        error: String,
        retryable: bool,
    },
    /// The record update after completion failed; `update` can be handed
    /// back to `UploadCoordinator::renotify`.
    NotifyFailed {
        task_id: TaskId,
        update: RecordUpdate,
        error: String,
    },
    /// The task was cancelled and removed.
    Cancelled { task_id: TaskId },
    /// The queue drained after at least one completion.
    AllComplete { completed: usize },
}

impl UploadEvent {
    /// Task the event refers to, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            UploadEvent::Completed { task, .. } => Some(&task.id),
            UploadEvent::StatusChanged { task_id, .. }
            | UploadEvent::Progress { task_id, .. }
            | UploadEvent::Failed { task_id, .. }
            | UploadEvent::NotifyFailed { task_id, .. }
            | UploadEvent::Cancelled { task_id } => Some(task_id),
            UploadEvent::AllComplete { .. } => None,
        }
    }
}
