//! # Ferry Client
//!
//! Fetches packages from a remote source into a [`LocalStorage`](ferry_storage::LocalStorage).
//!
//! The [`Downloader`] keeps a bounded set of active jobs and a waiting queue.
//! Network work runs on a tokio runtime; completions are posted back to the
//! control context and callbacks fire from [`Scheduler::pump`](ferry_core::scheduler::Scheduler::pump).

mod downloader;
mod error;
mod resolver;

pub use downloader::{CallbackId, DownloadResult, Downloader, JobHandle, JobInfo, JobStatus};
pub use error::{DownloadError, Result};
pub use resolver::BaseUrlResolver;
