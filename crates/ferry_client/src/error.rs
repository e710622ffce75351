use ferry_core::prelude::StorageError;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Server returned {0}")]
    Status(StatusCode),

    #[error("Content length mismatch: expected {expected} bytes, got {actual:?}")]
    LengthMismatch { expected: u64, actual: Option<u64> },

    #[error("Invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("Downloader must be driven from the control context")]
    NotControlContext,

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Downloader is shut down")]
    Shutdown,
}

impl DownloadError {
    /// HTTP status carried by the failure, if the server answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DownloadError::Status(status) => Some(*status),
            DownloadError::Network(e) => e.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
