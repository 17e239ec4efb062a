//! Completion side effects.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reelsync_protocol::RecordUpdate;
use reelsync_protocol::constants::CACHE_BUST_PARAM;
use reelsync_transfer::ResumeStore;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tracing::{debug, info, warn};

use crate::error::NotifyError;
use crate::task::UploadTask;

/// Future returned by [`RecordUpdater::update`].
pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;

/// Remote system told about finished uploads (match record, profile
/// picture, ...). What gets updated is up to the caller's metadata.
pub trait RecordUpdater: Send + Sync {
    fn update<'a>(&'a self, update: &'a RecordUpdate) -> NotifyFuture<'a>;
}

/// Posts `{ publicUrl, metadata }` as JSON to a fixed endpoint.
pub struct HttpRecordUpdater {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpRecordUpdater {
    pub fn new(endpoint: &str, auth_token: Option<&str>, timeout: Duration) -> Result<Self, NotifyError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| NotifyError::InvalidToken)?,
            );
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }
}

impl RecordUpdater for HttpRecordUpdater {
    fn update<'a>(&'a self, update: &'a RecordUpdate) -> NotifyFuture<'a> {
        Box::pin(async move {
            let resp = self.http.post(&self.endpoint).json(update).send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(NotifyError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            debug!(task = %update.task_id, "record updated");
            Ok(())
        })
    }
}

/// Only logs; used when no record endpoint is configured.
pub struct LogRecordUpdater;

impl RecordUpdater for LogRecordUpdater {
    fn update<'a>(&'a self, update: &'a RecordUpdate) -> NotifyFuture<'a> {
        Box::pin(async move {
            info!(task = %update.task_id, url = %update.public_url, "upload recorded");
            Ok(())
        })
    }
}

/// Appends the cache-busting version parameter to `url`.
pub fn cache_busted_url(url: &str, version: impl Display) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{CACHE_BUST_PARAM}={version}")
}

/// Runs the side effects of a completed upload.
pub struct CompletionNotifier {
    updater: Arc<dyn RecordUpdater>,
    store: Arc<dyn ResumeStore>,
}

impl CompletionNotifier {
    pub fn new(updater: Arc<dyn RecordUpdater>, store: Arc<dyn ResumeStore>) -> Self {
        Self { updater, store }
    }

    /// Builds the record update for a completed task.
    ///
    /// Static assets are overwritten in place, so their URL carries the
    /// completion time as a version.
    pub fn record_update(&self, task: &UploadTask) -> RecordUpdate {
        let url = task.public_url.clone().unwrap_or_default();
        let public_url = if task.is_static {
            cache_busted_url(&url, task.updated_at.timestamp_millis())
        } else {
            url
        };
        RecordUpdate {
            task_id: task.id.to_string(),
            public_url,
            metadata: task.metadata.clone(),
        }
    }

    /// Updates the record, purges the checkpoint and removes an ephemeral
    /// source. Cleanup happens even when the record update fails.
    pub async fn notify(&self, task: &UploadTask, update: &RecordUpdate) -> Result<(), NotifyError> {
        let result = self.updater.update(update).await;
        if let Err(e) = &result {
            warn!(task = %task.id, error = %e, "record update failed");
        }

        if let Err(e) = self.store.clear(task.id.as_str()).await {
            warn!(task = %task.id, error = %e, "failed to purge checkpoint");
        }

        if task.ephemeral {
            match tokio::fs::remove_file(&task.source).await {
                Ok(()) => debug!(task = %task.id, path = %task.source.display(), "removed local source"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(task = %task.id, error = %e, "failed to remove local source"),
            }
        }

        result
    }

    /// Retries a record update on its own.
    pub async fn renotify(&self, update: &RecordUpdate) -> Result<(), NotifyError> {
        self.updater.update(update).await
    }
}
