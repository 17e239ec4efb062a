//! Uploader configuration.
//!
//! Stored as JSON; every field has a default so partial files work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reelsync_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SIGN_TIMEOUT,
    DEFAULT_SINGLE_SHOT_THRESHOLD,
};
use reelsync_transfer::{RetryPolicy, TransferConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordinator::CoordinatorSettings;
use crate::error::UploadError;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "REELSYNC_CONFIG";

/// Backoff between chunk retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 15_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Base URL of the signing and deletion endpoints.
    pub api_base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Where completed uploads are reported. Logged only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_endpoint: Option<String>,
    pub chunk_size: usize,
    pub single_shot_threshold: u64,
    pub max_chunk_retries: u32,
    pub retry: RetryConfig,
    pub max_restarts: u32,
    pub max_concurrent_transfers: usize,
    pub request_timeout_secs: u64,
    pub sign_timeout_secs: u64,
    /// Checkpoint directory; defaults to `<config dir>/reelsync/resume`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_dir: Option<PathBuf>,
    pub delete_remote_on_cancel: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api/s3".into(),
            auth_token: None,
            record_endpoint: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            single_shot_threshold: DEFAULT_SINGLE_SHOT_THRESHOLD,
            max_chunk_retries: 3,
            retry: RetryConfig::default(),
            max_restarts: 3,
            max_concurrent_transfers: 3,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            sign_timeout_secs: DEFAULT_SIGN_TIMEOUT.as_secs(),
            resume_dir: None,
            delete_remote_on_cancel: true,
        }
    }
}

impl UploaderConfig {
    /// Loads from `$REELSYNC_CONFIG`, else the default path.
    ///
    /// A missing file yields defaults.
    pub fn load() -> Result<Self, UploadError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(default_config_path);
        match path {
            Some(p) => Self::load_from(&p),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, UploadError> {
        if !path.exists() {
            debug!("no config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        debug!("loaded config from {:?}", path);
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), UploadError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sign_timeout(&self) -> Duration {
        Duration::from_secs(self.sign_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_factor: self.retry.backoff_factor,
            jitter: true,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.chunk_size,
            single_shot_threshold: self.single_shot_threshold,
            max_chunk_retries: self.max_chunk_retries,
            retry: self.retry_policy(),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            max_restarts: self.max_restarts,
            max_concurrent_transfers: self.max_concurrent_transfers,
            sign_timeout: self.sign_timeout(),
            delete_remote_on_cancel: self.delete_remote_on_cancel,
        }
    }

    /// Resolved checkpoint directory.
    pub fn resume_dir(&self) -> PathBuf {
        self.resume_dir.clone().unwrap_or_else(|| {
            config_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("reelsync")
                .join("resume")
        })
    }
}

/// Returns the default config file path.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("reelsync").join("config.json"))
}

/// Returns the platform-specific config directory.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
