//! reelsync command-line uploader.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use reelsync_transfer::{FileResumeStore, ResumeStore};
use reelsync_uploader::{
    Enqueued, ResourceNamer, TaskId, UploadCoordinator, UploadEvent, UploadRequest,
    UploaderConfig,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Upload media files with resumable chunked transfers")]
struct Cli {
    /// Destination folder in the bucket.
    #[arg(long, default_value = "Videos")]
    folder: String,

    /// Overwrite-friendly asset (profile pictures).
    #[arg(long = "static")]
    is_static: bool,

    /// Delete each local file after it is uploaded.
    #[arg(long)]
    ephemeral: bool,

    #[arg(long, default_value = "cli")]
    owner: String,

    #[arg(long, default_value = "upload")]
    purpose: String,

    /// Config file (defaults to $REELSYNC_CONFIG or the user config dir).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// List saved resume checkpoints and exit.
    #[arg(long)]
    checkpoints: bool,

    /// Resume uploads interrupted by an earlier run.
    #[arg(long)]
    resume: bool,

    #[arg(value_name = "FILE", required_unless_present_any = ["checkpoints", "resume"])]
    files: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());

    let rt = tokio::runtime::Runtime::new()?;
    if cli.checkpoints {
        return rt.block_on(list_checkpoints(&config));
    }

    let failed = rt.block_on(run(cli, config))?;
    if failed > 0 {
        anyhow::bail!("{failed} upload(s) failed");
    }
    Ok(())
}

/// Malformed config is logged and replaced by defaults.
fn load_config(path: Option<&Path>) -> UploaderConfig {
    let loaded = match path {
        Some(p) => UploaderConfig::load_from(p),
        None => UploaderConfig::load(),
    };
    loaded.unwrap_or_else(|e| {
        error!(error = %e, "invalid configuration, using defaults");
        UploaderConfig::default()
    })
}

async fn list_checkpoints(config: &UploaderConfig) -> anyhow::Result<()> {
    let store = FileResumeStore::new(config.resume_dir());
    let checkpoints = store
        .list()
        .await
        .with_context(|| format!("reading {}", store.dir().display()))?;
    if checkpoints.is_empty() {
        println!("no checkpoints");
    }
    for cp in checkpoints {
        let source = cp
            .manifest
            .as_ref()
            .and_then(|m| m.get("source"))
            .and_then(|s| s.as_str())
            .unwrap_or("-");
        println!("{}\t{}\t{source}", cp.task_id, cp.offset);
    }
    Ok(())
}

fn resource_name(namer: &ResourceNamer, cli: &Cli, file: &Path) -> String {
    let base = namer.next_name(&cli.owner, &cli.purpose);
    match file.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{base}.{}", ext.to_lowercase()),
        None => base,
    }
}

/// Uploads every file and returns how many failed for good.
async fn run(cli: Cli, config: UploaderConfig) -> anyhow::Result<usize> {
    let mut coord = UploadCoordinator::from_config(&config).context("building uploader")?;
    let mut events = coord.take_events().context("event stream already taken")?;
    let namer = ResourceNamer::new();

    let mut pending: HashSet<TaskId> = HashSet::new();
    if cli.resume {
        for enqueued in coord.recover().await.context("recovering interrupted uploads")? {
            match enqueued {
                Enqueued::Added(id) => {
                    info!(task = %id, "resuming interrupted upload");
                    pending.insert(id);
                }
                Enqueued::Duplicate(id) => warn!(task = %id, "skipping duplicate"),
            }
        }
    }
    for file in &cli.files {
        let request = UploadRequest::new(file, &cli.folder, &resource_name(&namer, &cli, file))
            .with_static(cli.is_static)
            .with_ephemeral(cli.ephemeral)
            .with_metadata(serde_json::json!({ "source": file.display().to_string() }));
        match coord
            .enqueue(request)
            .await
            .with_context(|| format!("enqueueing {}", file.display()))?
        {
            Enqueued::Added(id) => {
                pending.insert(id);
            }
            Enqueued::Duplicate(id) => warn!(task = %id, "skipping duplicate"),
        }
    }

    let mut completed = 0usize;
    let mut failed = 0usize;
    while !pending.is_empty() {
        let Some(event) = events.recv().await else {
            break;
        };
        match event {
            UploadEvent::StatusChanged { task_id, status } => println!("{task_id}: {status}"),
            UploadEvent::Progress {
                task_id,
                uploaded_bytes,
                total_bytes,
            } => debug!(task = %task_id, uploaded_bytes, total_bytes, "progress"),
            UploadEvent::Completed { task, public_url } => {
                println!("{}: {public_url}", task.id);
                if task.retry_count > 0 {
                    info!(task = %task.id, retries = task.retry_count, "completed after chunk retries");
                }
                pending.remove(&task.id);
                completed += 1;
            }
            UploadEvent::Failed {
                task_id,
                error,
                retryable,
            } => {
                if retryable && coord.retry(&task_id).is_ok() {
                    warn!(task = %task_id, error = %error, "retrying failed upload");
                    continue;
                }
                eprintln!("{task_id}: failed: {error}");
                pending.remove(&task_id);
                failed += 1;
            }
            UploadEvent::NotifyFailed {
                task_id, update, ..
            } => {
                if let Err(e) = coord.renotify(&update).await {
                    warn!(task = %task_id, error = %e, "record update failed twice");
                }
            }
            UploadEvent::Cancelled { task_id } => {
                pending.remove(&task_id);
            }
            UploadEvent::AllComplete { completed: batch } => info!(batch, "batch finished"),
        }
    }

    // Record updates reported right after the last completion.
    while let Ok(event) = events.try_recv() {
        if let UploadEvent::NotifyFailed { task_id, update, .. } = event
            && let Err(e) = coord.renotify(&update).await
        {
            warn!(task = %task_id, error = %e, "record update failed twice");
        }
    }

    println!("{completed} completed, {failed} failed");
    Ok(failed)
}
