use crate::digest::ContentDigest;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Malformed manifest at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Unsupported manifest version: {0}")]
    UnsupportedVersion(String),

    #[error("Entry is not included in any package: {0}")]
    OrphanEntry(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache entry not found: {0}")]
    NotFound(String),

    #[error("Cache entry is busy: {0}")]
    Busy(String),

    #[error("Cache entry {alias} is corrupted: stored {stored}, expected {expected}")]
    Corrupted {
        alias: String,
        stored: ContentDigest,
        expected: ContentDigest,
    },

    #[error("Stream was closed by the storage")]
    Closed,

    #[error("Storage is shut down")]
    Shutdown,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
