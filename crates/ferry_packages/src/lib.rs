//! # Ferry Packages
//!
//! Sequences package loading on top of the cache and the downloader.
//!
//! - [`PackageManager`] keeps one slot per package and drives it through
//!   [`SlotState`], waiting for dependencies before a package reports loaded.
//! - [`ContentManager`] resolves logical paths to [`Asset`]s and caches
//!   [`Package`] wrappers weakly.
//! - [`ContentSystem`] wires the whole stack from a
//!   [`ContentConfig`](ferry_core::config::ContentConfig).
//!
//! Turning package bytes into objects is left to the [`BundleBackend`] and
//! [`ArchiveBackend`] implementations handed in by the host.

mod backend;
mod content;
mod error;
mod manager;
mod system;

pub use backend::{
    ArchiveBackend, AssetObject, BackendCallback, Backends, BundleBackend, LoadedArchive,
    LoadedBundle,
};
pub use content::{Asset, ContentManager, Package};
pub use error::{BackendError, PackageError, SystemError};
pub use manager::{
    AssetCallback, AssetResult, PackageHandle, PackageListener, PackageManager, RequestId,
    SlotState,
};
pub use system::ContentSystem;

pub mod prelude {
    pub use super::{
        ArchiveBackend, Asset, Backends, BundleBackend, ContentManager, ContentSystem,
        LoadedArchive, LoadedBundle, Package, PackageError, PackageHandle, SlotState,
    };
}
