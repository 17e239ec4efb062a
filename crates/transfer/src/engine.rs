use std::sync::Arc;

use reelsync_protocol::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_SINGLE_SHOT_THRESHOLD};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::TransferError;
use crate::chunked::ChunkReader;
use crate::progress::ProgressReporter;
use crate::resume::ResumeStore;
use crate::retry::RetryPolicy;
use crate::sink::{ChunkSink, ChunkTransferError};
use crate::types::{EncodedChunk, TransferJob, TransferOutcome};

/// Tuning knobs for [`TransferEngine`].
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Raw bytes per chunk in sequential mode.
    pub chunk_size: usize,
    /// Assets at or below this size go out in one request.
    pub single_shot_threshold: u64,
    /// Retries allowed per chunk after its first attempt.
    pub max_chunk_retries: u32,
    pub retry: RetryPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            single_shot_threshold: DEFAULT_SINGLE_SHOT_THRESHOLD,
            max_chunk_retries: 3,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Copy)]
enum Payload<'a> {
    Whole { content_type: &'a str, body: &'a [u8] },
    Chunk(&'a EncodedChunk),
}

enum Delivery {
    Acked,
    Cancelled,
}

#[derive(Default)]
struct Counters {
    retries: u32,
    requests: u32,
}

/// Moves one asset from local disk to its signed destination.
///
/// Chunks of a transfer are strictly sequential: chunk *n* is read only
/// after chunk *n−1* was acknowledged, checkpointed and reported.
pub struct TransferEngine {
    sink: Arc<dyn ChunkSink>,
    store: Arc<dyn ResumeStore>,
    reporter: Arc<ProgressReporter>,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(
        sink: Arc<dyn ChunkSink>,
        store: Arc<dyn ResumeStore>,
        reporter: Arc<ProgressReporter>,
        config: TransferConfig,
    ) -> Self {
        Self {
            sink,
            store,
            reporter,
            config,
        }
    }

    pub fn reporter(&self) -> &Arc<ProgressReporter> {
        &self.reporter
    }

    pub fn store(&self) -> &Arc<dyn ResumeStore> {
        &self.store
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Runs a transfer to completion, cancellation or fatal failure.
    ///
    /// Transient chunk failures are retried in place and never surface
    /// unless the retry ceiling is exceeded. An empty asset always goes out
    /// as one request so the object exists remotely.
    pub async fn transfer(
        &self,
        job: &TransferJob,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        if job.total_size == 0 || job.total_size <= self.config.single_shot_threshold {
            self.single_shot(job, cancel).await
        } else {
            self.chunked(job, cancel).await
        }
    }

    async fn single_shot(
        &self,
        job: &TransferJob,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        if cancel.is_cancelled() {
            return Ok(TransferOutcome::Cancelled {
                uploaded_bytes: 0,
                retries: 0,
            });
        }

        let body = tokio::fs::read(&job.source).await?;
        if body.len() as u64 != job.total_size {
            return Err(size_mismatch(job, body.len() as u64));
        }

        debug!(task = %job.task_id, bytes = job.total_size, "single-shot transfer");
        let mut counters = Counters::default();
        let payload = Payload::Whole {
            content_type: &job.content_type,
            body: &body,
        };
        match self.deliver(job, payload, 0, cancel, &mut counters).await {
            Ok(Delivery::Acked) => {}
            Ok(Delivery::Cancelled) => {
                return Ok(TransferOutcome::Cancelled {
                    uploaded_bytes: 0,
                    retries: counters.retries,
                });
            }
            Err(source) => {
                return Err(TransferError::ChunkTransferFatal {
                    offset: 0,
                    retries: counters.retries,
                    source,
                });
            }
        }

        if cancel.is_cancelled() {
            debug!(task = %job.task_id, "discarding acknowledgement received after cancel");
            return Ok(TransferOutcome::Cancelled {
                uploaded_bytes: 0,
                retries: counters.retries,
            });
        }

        self.reporter
            .emit(&job.task_id, job.total_size, job.total_size);
        info!(task = %job.task_id, bytes = job.total_size, "transfer complete");
        Ok(TransferOutcome::Completed {
            uploaded_bytes: job.total_size,
            retries: counters.retries,
            requests_sent: counters.requests,
        })
    }

    async fn chunked(
        &self,
        job: &TransferJob,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let total = job.total_size;
        let start = self.resume_offset(job).await;

        let path = job.source.clone();
        let chunk_size = match self.config.chunk_size {
            0 => DEFAULT_CHUNK_SIZE,
            n => n,
        };
        let mut reader = tokio::task::spawn_blocking(move || {
            let mut reader = ChunkReader::new(&path, chunk_size)?;
            reader.seek_to(start)?;
            Ok::<_, TransferError>(reader)
        })
        .await
        .map_err(|e| TransferError::Join(e.to_string()))??;

        if reader.file_size() != total {
            return Err(size_mismatch(job, reader.file_size()));
        }

        if start > 0 {
            info!(task = %job.task_id, offset = start, total, "resuming transfer");
            self.reporter.emit(&job.task_id, start, total);
        }

        let mut uploaded = start;
        let mut counters = Counters::default();

        while uploaded < total {
            if cancel.is_cancelled() {
                info!(task = %job.task_id, offset = uploaded, "transfer cancelled");
                return Ok(TransferOutcome::Cancelled {
                    uploaded_bytes: uploaded,
                    retries: counters.retries,
                });
            }

            let (r, next) = tokio::task::spawn_blocking(move || {
                let next = reader.next_chunk();
                (reader, next)
            })
            .await
            .map_err(|e| TransferError::Join(e.to_string()))?;
            reader = r;

            let expected = (total - uploaded).min(chunk_size as u64);
            let chunk = match next? {
                Some(chunk) if chunk.len() == expected => chunk,
                _ => {
                    return Err(TransferError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("{} shrank during transfer", job.source.display()),
                    )));
                }
            };

            let encoded = chunk.encode();
            match self
                .deliver(job, Payload::Chunk(&encoded), uploaded, cancel, &mut counters)
                .await
            {
                Ok(Delivery::Acked) => {}
                Ok(Delivery::Cancelled) => {
                    info!(task = %job.task_id, offset = uploaded, "transfer cancelled during backoff");
                    return Ok(TransferOutcome::Cancelled {
                        uploaded_bytes: uploaded,
                        retries: counters.retries,
                    });
                }
                Err(source) => {
                    return Err(TransferError::ChunkTransferFatal {
                        offset: uploaded,
                        retries: counters.retries,
                        source,
                    });
                }
            }

            if cancel.is_cancelled() {
                debug!(
                    task = %job.task_id,
                    offset = uploaded,
                    "discarding chunk acknowledged after cancel"
                );
                return Ok(TransferOutcome::Cancelled {
                    uploaded_bytes: uploaded,
                    retries: counters.retries,
                });
            }

            uploaded += encoded.len;
            if let Err(e) = self.store.put(&job.task_id, uploaded).await {
                warn!(task = %job.task_id, offset = uploaded, error = %e, "failed to persist checkpoint");
            }
            self.reporter.emit(&job.task_id, uploaded, total);
        }

        info!(
            task = %job.task_id,
            bytes = total,
            retries = counters.retries,
            "transfer complete"
        );
        Ok(TransferOutcome::Completed {
            uploaded_bytes: uploaded,
            retries: counters.retries,
            requests_sent: counters.requests,
        })
    }

    /// Reads the checkpoint for `job`, discarding offsets past its end.
    async fn resume_offset(&self, job: &TransferJob) -> u64 {
        match self.store.get(&job.task_id).await {
            Ok(Some(offset)) if offset <= job.total_size => offset,
            Ok(Some(offset)) => {
                warn!(
                    task = %job.task_id,
                    offset,
                    total = job.total_size,
                    "checkpoint beyond end of source, restarting from zero"
                );
                if let Err(e) = self.store.clear(&job.task_id).await {
                    warn!(task = %job.task_id, error = %e, "failed to clear stale checkpoint");
                }
                0
            }
            Ok(None) => 0,
            Err(e) => {
                warn!(task = %job.task_id, error = %e, "failed to read checkpoint, starting from zero");
                0
            }
        }
    }

    /// Sends one payload, retrying in place up to the configured ceiling.
    async fn deliver(
        &self,
        job: &TransferJob,
        payload: Payload<'_>,
        offset: u64,
        cancel: &CancellationToken,
        counters: &mut Counters,
    ) -> Result<Delivery, ChunkTransferError> {
        let mut attempt_retries = 0u32;
        loop {
            counters.requests += 1;
            let result = match payload {
                Payload::Whole { content_type, body } => {
                    self.sink.put_object(&job.write_url, content_type, body).await
                }
                Payload::Chunk(chunk) => self.sink.put_chunk(&job.write_url, chunk, job.total_size).await,
            };

            let err = match result {
                Ok(()) => return Ok(Delivery::Acked),
                Err(e) => e,
            };

            if attempt_retries >= self.config.max_chunk_retries {
                error!(
                    task = %job.task_id,
                    offset,
                    retries = attempt_retries,
                    error = %err,
                    "retry ceiling exceeded"
                );
                return Err(err);
            }

            attempt_retries += 1;
            counters.retries += 1;
            let delay = self.config.retry.delay_for_retry(attempt_retries);
            warn!(
                task = %job.task_id,
                offset,
                attempt = attempt_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "chunk send failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Ok(Delivery::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn size_mismatch(job: &TransferJob, actual: u64) -> TransferError {
    TransferError::SizeMismatch {
        path: job.source.display().to_string(),
        declared: job.total_size,
        actual,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::progress::ProgressEvent;
    use crate::resume::{Checkpoint, MemoryResumeStore, ResumeError, ResumeFuture};
    use crate::sink::SinkFuture;

    const TOTAL: u64 = 1_000_000;
    const CHUNK: usize = 250_000;

    #[derive(Default)]
    struct MockSink {
        /// Every attempt as `(offset, len)`.
        attempts: Mutex<Vec<(u64, u64)>>,
        objects: Mutex<Vec<Vec<u8>>>,
        /// Remaining failures per offset.
        failures: Mutex<HashMap<u64, u32>>,
        /// Token cancelled while the chunk at the given offset is in flight.
        cancel_at: Mutex<Option<(u64, CancellationToken)>>,
    }

    impl MockSink {
        fn fail(&self, offset: u64, times: u32) {
            self.failures.lock().unwrap().insert(offset, times);
        }

        fn cancel_at(&self, offset: u64, token: CancellationToken) {
            *self.cancel_at.lock().unwrap() = Some((offset, token));
        }

        fn offsets(&self) -> Vec<u64> {
            self.attempts.lock().unwrap().iter().map(|(o, _)| *o).collect()
        }

        fn outcome(&self, offset: u64) -> Result<(), ChunkTransferError> {
            if let Some((at, token)) = self.cancel_at.lock().unwrap().as_ref()
                && *at == offset
            {
                token.cancel();
            }
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&offset) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(ChunkTransferError::Status {
                        status: 503,
                        body: "unavailable".into(),
                    })
                }
                _ => Ok(()),
            }
        }
    }

    impl ChunkSink for MockSink {
        fn put_object<'a>(&'a self, _url: &'a str, _ct: &'a str, body: &'a [u8]) -> SinkFuture<'a> {
            Box::pin(async move {
                self.attempts.lock().unwrap().push((0, body.len() as u64));
                self.outcome(0)?;
                self.objects.lock().unwrap().push(body.to_vec());
                Ok(())
            })
        }

        fn put_chunk<'a>(&'a self, _url: &'a str, chunk: &'a EncodedChunk, total: u64) -> SinkFuture<'a> {
            Box::pin(async move {
                assert_eq!(total, TOTAL);
                self.attempts.lock().unwrap().push((chunk.offset, chunk.len));
                self.outcome(chunk.offset)
            })
        }
    }

    struct FailingStore;

    impl ResumeStore for FailingStore {
        fn get<'a>(&'a self, _task_id: &'a str) -> ResumeFuture<'a, Option<u64>> {
            Box::pin(async { Ok(None) })
        }
        fn put<'a>(&'a self, _task_id: &'a str, _offset: u64) -> ResumeFuture<'a, ()> {
            Box::pin(async { Err(ResumeError::Io(std::io::Error::other("disk full"))) })
        }
        fn register<'a>(&'a self, _task_id: &'a str, _manifest: &'a serde_json::Value) -> ResumeFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn clear<'a>(&'a self, _task_id: &'a str) -> ResumeFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn list(&self) -> ResumeFuture<'_, Vec<Checkpoint>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: CHUNK,
            single_shot_threshold: 1024,
            max_chunk_retries: 3,
            retry: RetryPolicy::immediate(),
        }
    }

    fn write_source(dir: &Path, len: u64) -> std::path::PathBuf {
        let path = dir.join("clip.mp4");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    fn job(source: std::path::PathBuf, total: u64) -> TransferJob {
        TransferJob {
            task_id: "Videos/u1-match-1".into(),
            source,
            write_url: "https://store.example/put?sig=abc".into(),
            content_type: "video/mp4".into(),
            total_size: total,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        sink: Arc<MockSink>,
        store: Arc<MemoryResumeStore>,
        engine: TransferEngine,
        progress: Arc<Mutex<Vec<u64>>>,
        job: TransferJob,
    }

    fn fixture(total: u64, config: TransferConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path(), total);
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MemoryResumeStore::new());
        let reporter = Arc::new(ProgressReporter::new());
        let progress = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&progress);
        reporter.subscribe("Videos/u1-match-1", move |e: &ProgressEvent| {
            p.lock().unwrap().push(e.uploaded_bytes);
        });
        let engine = TransferEngine::new(sink.clone(), store.clone(), reporter, config);
        Fixture {
            _dir: dir,
            sink,
            store,
            engine,
            progress,
            job: job(source, total),
        }
    }

    #[tokio::test]
    async fn four_chunks_in_order() {
        let f = fixture(TOTAL, config());
        let outcome = f.engine.transfer(&f.job, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome,
            TransferOutcome::Completed {
                uploaded_bytes: TOTAL,
                retries: 0,
                requests_sent: 4,
            }
        );
        assert_eq!(f.sink.offsets(), vec![0, 250_000, 500_000, 750_000]);
        assert_eq!(
            *f.progress.lock().unwrap(),
            vec![250_000, 500_000, 750_000, 1_000_000]
        );
        assert_eq!(f.store.offset(&f.job.task_id), Some(TOTAL));
    }

    #[tokio::test]
    async fn progress_is_monotonic_across_retries() {
        let f = fixture(TOTAL, config());
        f.sink.fail(500_000, 2);
        f.engine.transfer(&f.job, &CancellationToken::new()).await.unwrap();

        let progress = f.progress.lock().unwrap();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&TOTAL));
    }

    #[tokio::test]
    async fn resumes_from_checkpoint() {
        let f = fixture(TOTAL, config());
        f.store.seed(&f.job.task_id, 500_000);

        let outcome = f.engine.transfer(&f.job, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.uploaded_bytes(), TOTAL);
        assert_eq!(f.sink.offsets(), vec![500_000, 750_000]);
        assert_eq!(*f.progress.lock().unwrap(), vec![500_000, 750_000, 1_000_000]);
    }

    #[tokio::test]
    async fn checkpoint_past_end_restarts_from_zero() {
        let f = fixture(TOTAL, config());
        f.store.seed(&f.job.task_id, TOTAL * 5);

        f.engine.transfer(&f.job, &CancellationToken::new()).await.unwrap();

        assert_eq!(f.sink.offsets(), vec![0, 250_000, 500_000, 750_000]);
        assert_eq!(f.store.offset(&f.job.task_id), Some(TOTAL));
    }

    #[tokio::test]
    async fn retries_failed_chunk_in_place() {
        let f = fixture(TOTAL, config());
        f.sink.fail(250_000, 1);

        let outcome = f.engine.transfer(&f.job, &CancellationToken::new()).await.unwrap();

        assert!(outcome.retries() >= 1);
        assert_eq!(outcome.uploaded_bytes(), TOTAL);
        assert_eq!(
            f.sink.offsets(),
            vec![0, 250_000, 250_000, 500_000, 750_000]
        );
    }

    #[tokio::test]
    async fn exceeding_retry_ceiling_freezes_offset() {
        let f = fixture(TOTAL, config());
        f.sink.fail(250_000, 5);

        let err = f
            .engine
            .transfer(&f.job, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            TransferError::ChunkTransferFatal { offset, retries, .. } => {
                assert_eq!(offset, 250_000);
                assert_eq!(retries, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        // First attempt plus three retries.
        assert_eq!(f.sink.offsets().iter().filter(|o| **o == 250_000).count(), 4);
        assert_eq!(f.store.offset(&f.job.task_id), Some(250_000));
        assert_eq!(*f.progress.lock().unwrap(), vec![250_000]);
    }

    #[tokio::test]
    async fn cancel_discards_in_flight_chunk() {
        let f = fixture(TOTAL, config());
        let token = CancellationToken::new();
        f.sink.cancel_at(250_000, token.clone());

        let outcome = f.engine.transfer(&f.job, &token).await.unwrap();

        assert_eq!(
            outcome,
            TransferOutcome::Cancelled {
                uploaded_bytes: 250_000,
                retries: 0,
            }
        );
        assert_eq!(f.sink.offsets(), vec![0, 250_000]);
        assert_eq!(f.store.offset(&f.job.task_id), Some(250_000));
        assert_eq!(*f.progress.lock().unwrap(), vec![250_000]);
    }

    #[tokio::test]
    async fn cancel_interrupts_backoff() {
        let mut cfg = config();
        cfg.retry = RetryPolicy {
            initial_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            backoff_factor: 1.0,
            jitter: false,
        };
        let f = fixture(TOTAL, cfg);
        let token = CancellationToken::new();
        f.sink.fail(0, 10);
        f.sink.cancel_at(0, token.clone());

        let outcome = f.engine.transfer(&f.job, &token).await.unwrap();

        assert_eq!(
            outcome,
            TransferOutcome::Cancelled {
                uploaded_bytes: 0,
                retries: 1,
            }
        );
        assert_eq!(f.sink.offsets(), vec![0]);
    }

    #[tokio::test]
    async fn cancelled_before_start_sends_nothing() {
        let f = fixture(TOTAL, config());
        let token = CancellationToken::new();
        token.cancel();

        let outcome = f.engine.transfer(&f.job, &token).await.unwrap();

        assert!(matches!(outcome, TransferOutcome::Cancelled { uploaded_bytes: 0, .. }));
        assert!(f.sink.offsets().is_empty());
    }

    #[tokio::test]
    async fn small_asset_goes_out_in_one_request() {
        let f = fixture(700, config());

        let outcome = f.engine.transfer(&f.job, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome,
            TransferOutcome::Completed {
                uploaded_bytes: 700,
                retries: 0,
                requests_sent: 1,
            }
        );
        let objects = f.sink.objects.lock().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].len(), 700);
        assert_eq!(*f.progress.lock().unwrap(), vec![700]);
    }

    #[tokio::test]
    async fn empty_asset_is_sent_even_without_single_shot() {
        let f = fixture(
            0,
            TransferConfig {
                single_shot_threshold: 0,
                ..config()
            },
        );

        let outcome = f.engine.transfer(&f.job, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome,
            TransferOutcome::Completed {
                uploaded_bytes: 0,
                retries: 0,
                requests_sent: 1,
            }
        );
        let objects = f.sink.objects.lock().unwrap();
        assert_eq!(objects.len(), 1);
        assert!(objects[0].is_empty());
    }

    #[tokio::test]
    async fn declared_size_must_match_source() {
        let f = fixture(TOTAL, config());
        let mut job = f.job.clone();
        job.total_size = TOTAL + 1;

        let err = f.engine.transfer(&job, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err,
            TransferError::SizeMismatch { declared, actual, .. } if declared == TOTAL + 1 && actual == TOTAL
        ));
        assert!(f.sink.offsets().is_empty());
    }

    #[tokio::test]
    async fn checkpoint_write_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path(), TOTAL);
        let sink = Arc::new(MockSink::default());
        let engine = TransferEngine::new(
            sink.clone(),
            Arc::new(FailingStore),
            Arc::new(ProgressReporter::new()),
            config(),
        );

        let outcome = engine
            .transfer(&job(source, TOTAL), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.uploaded_bytes(), TOTAL);
        assert_eq!(sink.offsets().len(), 4);
    }
}
