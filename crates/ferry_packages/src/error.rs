use ferry_client::DownloadError;
use ferry_core::prelude::{LibraryError, StorageError};
use thiserror::Error;

/// Failure reported by a bundle or archive backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid package data: {0}")]
    Format(String),
}

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    #[error("Package {0} could not be loaded")]
    Invalid(String),

    #[error("Package {0} was unloaded before the request completed")]
    Unloaded(String),

    #[error("Package {0} is not an archive")]
    NotAnArchive(String),

    #[error("Package manager must be driven from the control context")]
    NotControlContext,

    #[error("Package manager is shut down")]
    Shutdown,

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),
}
