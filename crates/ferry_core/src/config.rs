use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a loaded package releases its backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadPolicy {
    /// Release through the backend's asynchronous unload.
    #[default]
    Deferred,
    /// Release synchronously on the control context.
    Immediate,
}

/// Runtime configuration for a content system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Directory holding the cache index and backing files.
    ///
    /// Defaults to `./ferry_cache`.
    pub storage_root: PathBuf,
    /// Extension given to backing files. Defaults to `.pak`.
    pub cache_extension: String,
    /// Remote source, e.g. "http://localhost:3000/packages".
    pub base_url: String,
    pub user_agent: Option<String>,
    pub max_concurrent_downloads: usize,
    /// Size of the read buffer used while streaming a response body.
    pub chunk_size: usize,
    /// Bytes allowed per throttle window before the downloader naps.
    pub throttle_bytes: u64,
    pub throttle_window_ms: u64,
    pub request_timeout_ms: u64,
    /// Sleep between pumps while waiting synchronously.
    pub pump_interval_ms: u64,
    pub unload_policy: UnloadPolicy,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./ferry_cache"),
            cache_extension: ".pak".to_string(),
            base_url: "http://localhost:3000".to_string(),
            user_agent: None,
            max_concurrent_downloads: 3,
            chunk_size: 4096,
            throttle_bytes: 512 * 1024,
            throttle_window_ms: 250,
            request_timeout_ms: 3000,
            pump_interval_ms: 10,
            unload_policy: UnloadPolicy::default(),
        }
    }
}

impl ContentConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }
}
