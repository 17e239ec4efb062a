//! Upload coordinator.
//!
//! Owns the set of active tasks, schedules their transfers onto the
//! runtime, and runs completion side effects exactly once per task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reelsync_protocol::constants::DEFAULT_SIGN_TIMEOUT;
use reelsync_protocol::{RecordUpdate, UploadStatus};
use reelsync_signer::{
    HttpSigner, SignRequest, SignRequestError, SignedDestination, SignedRequestProvider,
};
use reelsync_transfer::{
    FileResumeStore, HttpChunkSink, ProgressEvent, ProgressReporter, SubscriptionId,
    TransferEngine, TransferJob, TransferOutcome,
};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::events::UploadEvent;
use crate::notifier::{CompletionNotifier, HttpRecordUpdater, LogRecordUpdater, RecordUpdater};
use crate::task::{TaskId, UploadRequest, UploadTask};

/// Scheduling limits for [`UploadCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Explicit retries allowed after a task fails.
    pub max_restarts: u32,
    pub max_concurrent_transfers: usize,
    pub sign_timeout: Duration,
    /// Ask the backend to delete the object of a cancelled task that was
    /// already signed.
    pub delete_remote_on_cancel: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            max_concurrent_transfers: 3,
            sign_timeout: DEFAULT_SIGN_TIMEOUT,
            delete_remote_on_cancel: true,
        }
    }
}

/// Result of [`UploadCoordinator::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Added(TaskId),
    /// A task with this identity is already active; nothing changed.
    Duplicate(TaskId),
}

type AllCompleteCallback = Arc<dyn Fn(usize) + Send + Sync>;

struct Entry {
    task: UploadTask,
    cancel: CancellationToken,
    /// Set by `pause`; the running transfer turns it into `Paused`.
    pausing: bool,
    /// Identifies the run currently allowed to mutate this entry.
    generation: u64,
    /// Fires once the run serving this entry has returned.
    run_exit: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<TaskId, Entry>,
    /// Runs of cancelled tasks that have not returned yet, by generation.
    /// A new task with the same identity waits for them.
    retiring: HashMap<TaskId, (u64, CancellationToken)>,
    /// Completions since the queue was last empty.
    batch_completed: usize,
    next_generation: u64,
}

impl QueueState {
    fn live(&mut self, id: &TaskId, generation: u64) -> Option<&mut Entry> {
        self.entries
            .get_mut(id)
            .filter(|e| e.generation == generation)
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Exit signal of a cancelled run of `id` that is still going.
    fn retiring_run(&mut self, id: &TaskId) -> Option<CancellationToken> {
        match self.retiring.get(id) {
            Some((_, exit)) if !exit.is_cancelled() => Some(exit.clone()),
            Some(_) => {
                self.retiring.remove(id);
                None
            }
            None => None,
        }
    }

    /// Returns the batch size once the queue drained after a completion.
    fn take_drained_batch(&mut self) -> Option<usize> {
        if self.entries.is_empty() && self.batch_completed > 0 {
            Some(std::mem::take(&mut self.batch_completed))
        } else {
            None
        }
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
struct Events(mpsc::Sender<UploadEvent>);

impl Events {
    /// Never blocks; a full channel drops the event.
    fn publish(&self, event: UploadEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.0.try_send(event) {
            warn!(?event, "event channel full, dropping event");
        }
    }
}

enum Interruption {
    Paused,
    Cancelled,
    Stale,
}

struct Inner {
    signer: Arc<dyn SignedRequestProvider>,
    engine: Arc<TransferEngine>,
    notifier: CompletionNotifier,
    settings: CoordinatorSettings,
    state: Arc<Mutex<QueueState>>,
    events: Events,
    permits: Arc<Semaphore>,
    all_complete: Mutex<Vec<AllCompleteCallback>>,
    progress_sub: SubscriptionId,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.engine.reporter().unsubscribe(self.progress_sub);
    }
}

/// Queue of concurrent uploads.
pub struct UploadCoordinator {
    inner: Arc<Inner>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
}

impl UploadCoordinator {
    pub fn new(
        signer: Arc<dyn SignedRequestProvider>,
        engine: Arc<TransferEngine>,
        updater: Arc<dyn RecordUpdater>,
        settings: CoordinatorSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        let events = Events(events_tx);
        let state = Arc::new(Mutex::new(QueueState::default()));

        let progress_sub = {
            let state = Arc::clone(&state);
            let events = events.clone();
            engine
                .reporter()
                .subscribe_all(move |e: &ProgressEvent| on_progress(&state, &events, e))
        };

        let notifier = CompletionNotifier::new(updater, Arc::clone(engine.store()));
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_transfers.max(1)));

        Self {
            inner: Arc::new(Inner {
                signer,
                engine,
                notifier,
                settings,
                state,
                events,
                permits,
                all_complete: Mutex::new(Vec::new()),
                progress_sub,
            }),
            events_rx: Some(events_rx),
        }
    }

    /// Builds the HTTP-backed stack described by `config`.
    pub fn from_config(config: &UploaderConfig) -> Result<Self, UploadError> {
        let signer = HttpSigner::new(
            &config.api_base_url,
            config.auth_token.as_deref(),
            config.request_timeout(),
        )?;
        let sink = HttpChunkSink::new(config.request_timeout())?;
        let store = FileResumeStore::new(config.resume_dir());
        let engine = TransferEngine::new(
            Arc::new(sink),
            Arc::new(store),
            Arc::new(ProgressReporter::new()),
            config.transfer_config(),
        );
        let updater: Arc<dyn RecordUpdater> = match &config.record_endpoint {
            Some(endpoint) => Arc::new(HttpRecordUpdater::new(
                endpoint,
                config.auth_token.as_deref(),
                config.request_timeout(),
            )?),
            None => Arc::new(LogRecordUpdater),
        };
        Ok(Self::new(
            Arc::new(signer),
            Arc::new(engine),
            updater,
            config.coordinator_settings(),
        ))
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Registers a callback fired each time the queue drains after at
    /// least one completion. It receives the number of completions in
    /// the batch.
    pub fn on_all_complete<F>(&self, callback: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.inner
            .all_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Adds a task and schedules its transfer.
    ///
    /// Submitting an identity that is already active is a no-op. If a
    /// cancelled task with the same identity is still stopping, this waits
    /// for it so the new task starts from a clean checkpoint.
    pub async fn enqueue(&self, request: UploadRequest) -> Result<Enqueued, UploadError> {
        if request.resource_name.trim().is_empty() {
            return Err(UploadError::InvalidRequest("resource name is empty".into()));
        }
        if request.folder.trim().is_empty() {
            return Err(UploadError::InvalidRequest("folder is empty".into()));
        }

        let id = request.task_id();
        if !self.settle(&id).await {
            debug!(task = %id, "already queued");
            return Ok(Enqueued::Duplicate(id));
        }

        let total_size = match request.total_size {
            Some(size) => size,
            None => tokio::fs::metadata(&request.source).await?.len(),
        };
        let task = UploadTask::from_request(request, total_size);
        self.inner.register(&task).await;

        let (generation, cancel, exit) = loop {
            {
                let mut st = lock(&self.inner.state);
                if st.entries.contains_key(&id) {
                    return Ok(Enqueued::Duplicate(id));
                }
                if st.retiring_run(&id).is_none() {
                    let generation = st.bump();
                    let cancel = CancellationToken::new();
                    let exit = CancellationToken::new();
                    st.entries.insert(
                        id.clone(),
                        Entry {
                            task,
                            cancel: cancel.clone(),
                            pausing: false,
                            generation,
                            run_exit: exit.clone(),
                        },
                    );
                    break (generation, cancel, exit);
                }
            }
            if !self.settle(&id).await {
                return Ok(Enqueued::Duplicate(id));
            }
            // The run that just stopped cleared the checkpoint.
            self.inner.register(&task).await;
        };

        info!(task = %id, bytes = total_size, "upload enqueued");
        self.inner.events.publish(UploadEvent::StatusChanged {
            task_id: id.clone(),
            status: UploadStatus::Queued,
        });
        self.inner.spawn_run(id.clone(), generation, cancel, exit);
        Ok(Enqueued::Added(id))
    }

    /// Waits until no cancelled run of `id` is still going. Returns `false`
    /// if the identity is active.
    async fn settle(&self, id: &TaskId) -> bool {
        loop {
            let exit = {
                let mut st = lock(&self.inner.state);
                if st.entries.contains_key(id) {
                    return false;
                }
                match st.retiring_run(id) {
                    Some(exit) => exit,
                    None => return true,
                }
            };
            debug!(task = %id, "waiting for cancelled run to stop");
            exit.cancelled().await;
        }
    }

    /// Re-enqueues uploads interrupted in an earlier process, resuming each
    /// from its checkpoint.
    ///
    /// Checkpoints without a readable request or whose source file is gone
    /// are discarded.
    pub async fn recover(&self) -> Result<Vec<Enqueued>, UploadError> {
        let store = self.inner.engine.store();
        let mut recovered = Vec::new();
        for checkpoint in store.list().await? {
            let task_id = checkpoint.task_id;
            let request = match checkpoint.manifest.map(serde_json::from_value::<UploadRequest>) {
                Some(Ok(request)) => request,
                Some(Err(e)) => {
                    warn!(task = %task_id, error = %e, "unreadable upload manifest, discarding checkpoint");
                    self.inner.discard_checkpoint(&task_id).await;
                    continue;
                }
                None => {
                    warn!(task = %task_id, "checkpoint has no upload manifest, discarding");
                    self.inner.discard_checkpoint(&task_id).await;
                    continue;
                }
            };
            if !tokio::fs::try_exists(&request.source).await.unwrap_or(false) {
                warn!(
                    task = %task_id,
                    path = %request.source.display(),
                    "source of interrupted upload is gone, discarding checkpoint"
                );
                self.inner.discard_checkpoint(&task_id).await;
                continue;
            }
            info!(task = %task_id, offset = checkpoint.offset, "recovering interrupted upload");
            recovered.push(self.enqueue(request).await?);
        }
        Ok(recovered)
    }

    /// Removes a task, stops its transfer and discards its checkpoint.
    ///
    /// No completion side effects run for a cancelled task.
    pub async fn cancel(&self, id: &TaskId) -> Result<(), UploadError> {
        let (entry, drained) = {
            let mut st = lock(&self.inner.state);
            let from = st
                .entries
                .get(id)
                .map(|e| e.task.status)
                .ok_or_else(|| UploadError::NotFound(id.clone()))?;
            if !from.can_transition_to(UploadStatus::Cancelled) {
                return Err(UploadError::InvalidTransition {
                    task_id: id.clone(),
                    from,
                    to: UploadStatus::Cancelled,
                });
            }
            let Some(entry) = st.entries.remove(id) else {
                return Err(UploadError::NotFound(id.clone()));
            };
            if !entry.run_exit.is_cancelled() {
                st.retiring
                    .insert(id.clone(), (entry.generation, entry.run_exit.clone()));
            }
            (entry, st.take_drained_batch())
        };

        entry.cancel.cancel();
        info!(task = %id, "upload cancelled");

        let inner = &self.inner;
        if let Err(e) = inner.engine.store().clear(id.as_str()).await {
            warn!(task = %id, error = %e, "failed to clear checkpoint");
        }
        inner.engine.reporter().reset(id.as_str());

        let task = &entry.task;
        if inner.settings.delete_remote_on_cancel && task.public_url.is_some() {
            if let Err(e) = inner
                .signer
                .delete(&task.folder, &task.resource_name, task.is_static)
                .await
            {
                warn!(task = %id, error = %e, "remote deletion failed");
            }
        }

        inner.events.publish(UploadEvent::StatusChanged {
            task_id: id.clone(),
            status: UploadStatus::Cancelled,
        });
        inner.events.publish(UploadEvent::Cancelled {
            task_id: id.clone(),
        });
        if let Some(completed) = drained {
            inner.fire_all_complete(completed);
        }
        Ok(())
    }

    /// Stops an uploading task after its in-flight chunk; it keeps its
    /// checkpoint and becomes `Paused`.
    pub fn pause(&self, id: &TaskId) -> Result<(), UploadError> {
        let mut st = lock(&self.inner.state);
        let entry = st
            .entries
            .get_mut(id)
            .ok_or_else(|| UploadError::NotFound(id.clone()))?;
        if entry.task.status != UploadStatus::Uploading {
            return Err(UploadError::InvalidTransition {
                task_id: id.clone(),
                from: entry.task.status,
                to: UploadStatus::Paused,
            });
        }
        if !entry.pausing {
            entry.pausing = true;
            entry.cancel.cancel();
            info!(task = %id, "pausing upload");
        }
        Ok(())
    }

    /// Restarts a paused task from its checkpoint.
    pub fn resume(&self, id: &TaskId) -> Result<(), UploadError> {
        self.reschedule(id, UploadStatus::Paused, |_| Ok(()))
    }

    /// Restarts a failed task, within the restart budget.
    pub fn retry(&self, id: &TaskId) -> Result<(), UploadError> {
        let max_restarts = self.inner.settings.max_restarts;
        self.reschedule(id, UploadStatus::Failed, |task| {
            if task.restart_count >= max_restarts {
                return Err(UploadError::RestartsExhausted {
                    task_id: task.id.clone(),
                    restarts: task.restart_count,
                });
            }
            task.restart_count += 1;
            task.last_error = None;
            // Signed URLs are short-lived; sign again.
            task.write_url = None;
            Ok(())
        })
    }

    fn reschedule<F>(&self, id: &TaskId, expected: UploadStatus, prepare: F) -> Result<(), UploadError>
    where
        F: FnOnce(&mut UploadTask) -> Result<(), UploadError>,
    {
        let (generation, cancel, exit) = {
            let mut st = lock(&self.inner.state);
            let generation = st.next_generation + 1;
            let entry = st
                .entries
                .get_mut(id)
                .ok_or_else(|| UploadError::NotFound(id.clone()))?;
            if entry.task.status != expected {
                return Err(UploadError::InvalidTransition {
                    task_id: id.clone(),
                    from: entry.task.status,
                    to: UploadStatus::Uploading,
                });
            }
            prepare(&mut entry.task)?;
            entry.task.set_status(UploadStatus::Uploading);
            entry.cancel = CancellationToken::new();
            entry.pausing = false;
            entry.generation = generation;
            entry.run_exit = CancellationToken::new();
            let cancel = entry.cancel.clone();
            let exit = entry.run_exit.clone();
            st.next_generation = generation;
            (generation, cancel, exit)
        };

        info!(task = %id, from = %expected, "upload rescheduled");
        self.inner.events.publish(UploadEvent::StatusChanged {
            task_id: id.clone(),
            status: UploadStatus::Uploading,
        });
        self.inner.spawn_run(id.clone(), generation, cancel, exit);
        Ok(())
    }

    /// Retries a record update reported by [`UploadEvent::NotifyFailed`].
    pub async fn renotify(&self, update: &RecordUpdate) -> Result<(), UploadError> {
        self.inner.notifier.renotify(update).await?;
        Ok(())
    }

    /// Snapshot of one active task.
    pub fn task(&self, id: &TaskId) -> Option<UploadTask> {
        lock(&self.inner.state)
            .entries
            .get(id)
            .map(|e| e.task.clone())
    }

    /// Snapshots of all active tasks, oldest first.
    pub fn tasks(&self) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = lock(&self.inner.state)
            .entries
            .values()
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Number of active tasks.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn on_progress(state: &Mutex<QueueState>, events: &Events, e: &ProgressEvent) {
    let task_id = {
        let mut st = lock(state);
        let Some(entry) = st.entries.get_mut(e.task_id.as_str()) else {
            return;
        };
        if entry.task.status != UploadStatus::Uploading {
            return;
        }
        entry.task.advance(e.uploaded_bytes);
        entry.task.id.clone()
    };
    events.publish(UploadEvent::Progress {
        task_id,
        uploaded_bytes: e.uploaded_bytes,
        total_bytes: e.total_bytes,
    });
}

impl Inner {
    fn spawn_run(
        self: &Arc<Self>,
        id: TaskId,
        generation: u64,
        cancel: CancellationToken,
        exit: CancellationToken,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let exited = exit.drop_guard();
            inner.run(id.clone(), generation, cancel).await;
            drop(exited);
            let mut st = lock(&inner.state);
            if st.retiring.get(&id).is_some_and(|(g, _)| *g == generation) {
                st.retiring.remove(&id);
            }
        });
    }

    /// Persists the request behind `task` next to its checkpoint.
    async fn register(&self, task: &UploadTask) {
        let manifest = match serde_json::to_value(task.request()) {
            Ok(m) => m,
            Err(e) => {
                warn!(task = %task.id, error = %e, "failed to encode upload manifest");
                return;
            }
        };
        if let Err(e) = self.engine.store().register(task.id.as_str(), &manifest).await {
            warn!(task = %task.id, error = %e, "failed to persist upload manifest");
        }
    }

    async fn discard_checkpoint(&self, task_id: &str) {
        if let Err(e) = self.engine.store().clear(task_id).await {
            warn!(task = %task_id, error = %e, "failed to clear checkpoint");
        }
    }

    /// Called when a run finds its entry gone. If the task was cancelled,
    /// anything the run persisted or reported after `cancel` cleaned up is
    /// dropped again.
    async fn forget_if_cancelled(&self, id: &TaskId) {
        if lock(&self.state).entries.contains_key(id) {
            return;
        }
        // A chunk acknowledged just before the token fired may have
        // re-created the checkpoint after `cancel` cleared it.
        self.discard_checkpoint(id.as_str()).await;
        self.engine.reporter().reset(id.as_str());
    }

    async fn run(&self, id: TaskId, generation: u64, cancel: CancellationToken) {
        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
            _ = cancel.cancelled() => {
                self.interrupted(&id, generation, 0).await;
                return;
            }
        };
        if cancel.is_cancelled() {
            self.interrupted(&id, generation, 0).await;
            return;
        }

        let Some(task) = self.begin(&id, generation) else {
            return;
        };

        let write_url = match task.write_url.clone() {
            Some(url) => url,
            None => match self.sign(&task).await {
                Ok(dest) => {
                    self.set_destination(&id, generation, &dest);
                    dest.write_url
                }
                Err(e) => {
                    self.fail(&id, generation, 0, e.into()).await;
                    return;
                }
            },
        };
        if cancel.is_cancelled() {
            self.interrupted(&id, generation, 0).await;
            return;
        }

        let job = TransferJob {
            task_id: id.to_string(),
            source: task.source.clone(),
            write_url,
            content_type: task.mime_type.clone(),
            total_size: task.total_size,
        };
        match self.engine.transfer(&job, &cancel).await {
            Ok(TransferOutcome::Completed { retries, .. }) => {
                self.complete(&id, generation, retries).await;
            }
            Ok(TransferOutcome::Cancelled { retries, .. }) => {
                self.interrupted(&id, generation, retries).await;
            }
            Err(e) => {
                let retries = e.retries();
                self.fail(&id, generation, retries, e.into()).await;
            }
        }
    }

    /// Moves a queued task to `Uploading` and returns its snapshot.
    fn begin(&self, id: &TaskId, generation: u64) -> Option<UploadTask> {
        let task = {
            let mut st = lock(&self.state);
            let entry = st.live(id, generation)?;
            if entry.task.status == UploadStatus::Queued {
                entry.task.set_status(UploadStatus::Uploading);
                self.events.publish(UploadEvent::StatusChanged {
                    task_id: id.clone(),
                    status: UploadStatus::Uploading,
                });
            }
            entry.task.clone()
        };
        debug!(task = %id, "transfer slot acquired");
        Some(task)
    }

    async fn sign(&self, task: &UploadTask) -> Result<SignedDestination, SignRequestError> {
        let request = SignRequest {
            resource_name: task.resource_name.clone(),
            mime_type: task.mime_type.clone(),
            folder: task.folder.clone(),
            is_static: task.is_static,
        };
        let timeout = self.settings.sign_timeout;
        match tokio::time::timeout(timeout, self.signer.sign(&request)).await {
            Ok(result) => result,
            Err(_) => Err(SignRequestError::Timeout(timeout)),
        }
    }

    fn set_destination(&self, id: &TaskId, generation: u64, dest: &SignedDestination) {
        if let Some(entry) = lock(&self.state).live(id, generation) {
            entry.task.write_url = Some(dest.write_url.clone());
            entry.task.public_url = Some(dest.public_url.clone());
        }
    }

    async fn complete(&self, id: &TaskId, generation: u64, retries: u32) {
        let task = {
            let mut st = lock(&self.state);
            match st.live(id, generation) {
                Some(entry) => {
                    entry.task.retry_count += retries;
                    entry.task.advance(entry.task.total_size);
                    if !entry.task.set_status(UploadStatus::Completed) {
                        return;
                    }
                    entry.pausing = false;
                    Some(entry.task.clone())
                }
                None => None,
            }
        };
        let Some(task) = task else {
            debug!(task = %id, "ignoring completion of a retired run");
            self.forget_if_cancelled(id).await;
            return;
        };
        self.events.publish(UploadEvent::StatusChanged {
            task_id: id.clone(),
            status: UploadStatus::Completed,
        });

        let update = self.notifier.record_update(&task);
        let notified = self.notifier.notify(&task, &update).await;

        let drained = {
            let mut st = lock(&self.state);
            if st.live(id, generation).is_some() {
                st.entries.remove(id);
            }
            st.batch_completed += 1;
            st.take_drained_batch()
        };
        self.engine.reporter().reset(id.as_str());

        info!(task = %id, retries = task.retry_count, "upload complete");
        self.events.publish(UploadEvent::Completed {
            task: Box::new(task),
            public_url: update.public_url.clone(),
        });
        if let Err(e) = notified {
            self.events.publish(UploadEvent::NotifyFailed {
                task_id: id.clone(),
                update,
                error: e.to_string(),
            });
        }
        if let Some(completed) = drained {
            self.fire_all_complete(completed);
        }
    }

    async fn fail(&self, id: &TaskId, generation: u64, retries: u32, err: UploadError) {
        let message = err.to_string();
        let retryable = {
            let mut st = lock(&self.state);
            match st.live(id, generation) {
                Some(entry) => {
                    entry.task.retry_count += retries;
                    if !entry.task.set_status(UploadStatus::Failed) {
                        return;
                    }
                    entry.pausing = false;
                    entry.task.last_error = Some(message.clone());
                    Some(entry.task.restart_count < self.settings.max_restarts)
                }
                None => None,
            }
        };
        let Some(retryable) = retryable else {
            debug!(task = %id, error = %message, "ignoring failure of a retired run");
            self.forget_if_cancelled(id).await;
            return;
        };

        error!(task = %id, error = %message, retryable, "upload failed");
        self.events.publish(UploadEvent::StatusChanged {
            task_id: id.clone(),
            status: UploadStatus::Failed,
        });
        self.events.publish(UploadEvent::Failed {
            task_id: id.clone(),
            error: message,
            retryable,
        });
    }

    /// Handles a run that stopped because its token fired.
    async fn interrupted(&self, id: &TaskId, generation: u64, retries: u32) {
        let outcome = {
            let mut st = lock(&self.state);
            let present = st.entries.contains_key(id);
            match st.live(id, generation) {
                Some(entry) if entry.pausing => {
                    entry.pausing = false;
                    entry.task.retry_count += retries;
                    if entry.task.set_status(UploadStatus::Paused) {
                        Interruption::Paused
                    } else {
                        Interruption::Stale
                    }
                }
                Some(_) => Interruption::Stale,
                None if !present => Interruption::Cancelled,
                None => Interruption::Stale,
            }
        };

        match outcome {
            Interruption::Paused => {
                info!(task = %id, "upload paused");
                self.events.publish(UploadEvent::StatusChanged {
                    task_id: id.clone(),
                    status: UploadStatus::Paused,
                });
            }
            Interruption::Cancelled => self.forget_if_cancelled(id).await,
            Interruption::Stale => {}
        }
    }

    fn fire_all_complete(&self, completed: usize) {
        let callbacks: Vec<AllCompleteCallback> = self
            .all_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        info!(completed, "all uploads complete");
        for cb in callbacks {
            cb(completed);
        }
        self.events.publish(UploadEvent::AllComplete { completed });
    }
}
