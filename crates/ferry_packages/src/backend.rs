//! The seam to whatever turns package bytes into usable objects.

use crate::error::BackendError;
use ferry_storage::ReadStream;
use std::any::Any;
use std::io::Read;
use std::sync::Arc;

/// An object produced by a backend. Archive entries come back as
/// [`bytes::Bytes`].
pub type AssetObject = Arc<dyn Any + Send + Sync>;

pub type BackendCallback = Box<dyn FnOnce(Result<Option<AssetObject>, BackendError>) + Send + 'static>;

/// Turns a verified bundle into a [`LoadedBundle`].
pub trait BundleBackend: Send + Sync + 'static {
    fn open(&self, package: &str, stream: ReadStream) -> Result<Box<dyn LoadedBundle>, BackendError>;
}

pub trait LoadedBundle: Send + 'static {
    /// `Ok(None)` when the bundle holds no asset called `name`.
    fn load_asset(&mut self, name: &str) -> Result<Option<AssetObject>, BackendError>;

    /// `done` may run on any thread.
    fn load_asset_async(&mut self, name: &str, done: BackendCallback) {
        done(self.load_asset(name));
    }

    fn unload(&mut self);

    fn unload_async(&mut self, done: Box<dyn FnOnce() + Send + 'static>) {
        self.unload();
        done();
    }
}

/// Turns a verified archive into a [`LoadedArchive`].
pub trait ArchiveBackend: Send + Sync + 'static {
    fn open(&self, package: &str, stream: ReadStream) -> Result<Box<dyn LoadedArchive>, BackendError>;
}

pub trait LoadedArchive: Send + 'static {
    fn open_entry(&mut self, name: &str) -> Option<Box<dyn Read + Send>>;

    fn unload(&mut self) {}
}

/// The pair of backends a package manager dispatches to by package kind.
#[derive(Clone)]
pub struct Backends {
    pub bundle: Arc<dyn BundleBackend>,
    pub archive: Arc<dyn ArchiveBackend>,
}
