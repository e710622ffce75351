//! Path based access on top of the package manager.
//!
//! Package and asset wrappers are cached weakly: a wrapper nobody holds is
//! dropped (releasing its package) and rebuilt on the next lookup.

use crate::error::PackageError;
use crate::manager::{
    AssetResult, PackageHandle, PackageListener, PackageManager, RequestId, SlotState,
};
use ferry_core::prelude::ContentLibrary;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::warn;

type Waiter = Box<dyn FnOnce(bool) + Send + 'static>;

/// A loaded-on-demand package plus the wrappers of its dependencies.
pub struct Package {
    handle: PackageHandle,
    dependencies: Vec<Arc<Package>>,
    waiters: Mutex<Vec<Waiter>>,
}

impl PackageListener for Package {
    fn on_package_completed(&self, _name: &str, state: SlotState) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            waiter(state == SlotState::Loaded);
        }
    }
}

impl Package {
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> &PackageHandle {
        &self.handle
    }

    pub fn dependencies(&self) -> &[Arc<Package>] {
        &self.dependencies
    }

    pub fn state(&self) -> Option<SlotState> {
        self.handle.state()
    }

    pub fn is_completed(&self) -> bool {
        self.handle.is_completed()
    }

    /// Loads the package; `callback` receives whether it ended up loaded.
    /// Refused off the control context, in which case `callback` is dropped.
    pub fn load_async(
        &self,
        callback: impl FnOnce(bool) + Send + 'static,
    ) -> Result<(), PackageError> {
        self.handle.load()?;
        match self.state() {
            Some(state) if !state.is_completed() => self.waiters.lock().push(Box::new(callback)),
            state => callback(state == Some(SlotState::Loaded)),
        }
        Ok(())
    }

    /// Loads the package and its dependencies, pumping until done. Returns
    /// whether it ended up loaded.
    pub fn load_sync(&self) -> bool {
        match self.handle.load_sync() {
            Ok(()) => true,
            Err(e) => {
                warn!("Loading {} failed: {e}", self.name());
                false
            }
        }
    }
}

/// An entry path bound to the package that owns it. Paths the library does
/// not know produce an asset that completes immediately with nothing.
pub struct Asset {
    path: String,
    package: Option<Arc<Package>>,
    request: Mutex<Option<RequestId>>,
}

impl Asset {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn package(&self) -> Option<&Arc<Package>> {
        self.package.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.package.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.package.as_ref().is_none_or(|package| package.is_completed())
    }

    pub fn load(&self) -> AssetResult {
        match &self.package {
            Some(package) => package.handle.load_asset_sync(&self.path),
            None => Ok(None),
        }
    }

    /// Repeated calls before completion replace the pending request.
    pub fn load_async(&self, callback: impl FnOnce(AssetResult) + Send + 'static) {
        let Some(package) = &self.package else {
            callback(Ok(None));
            return;
        };
        let pending = *self.request.lock();
        let id = package.handle.request_asset(&self.path, pending, callback);
        *self.request.lock() = (id != RequestId::NONE).then_some(id);
    }
}

#[derive(Default)]
struct Caches {
    packages: HashMap<String, Weak<Package>>,
    assets: HashMap<String, Weak<Asset>>,
}

pub struct ContentManager {
    library: Arc<ContentLibrary>,
    packages: PackageManager,
    caches: Mutex<Caches>,
}

impl ContentManager {
    pub fn new(packages: PackageManager) -> Self {
        Self {
            library: packages.library().clone(),
            packages,
            caches: Mutex::new(Caches::default()),
        }
    }

    pub fn library(&self) -> &Arc<ContentLibrary> {
        &self.library
    }

    pub fn packages(&self) -> &PackageManager {
        &self.packages
    }

    pub fn get_package(&self, name: &str) -> Result<Arc<Package>, PackageError> {
        let mut caches = self.caches.lock();
        self.package(&mut caches, name, &mut Vec::new())
    }

    /// Resolves `path` through the library. Unknown paths yield an empty
    /// asset rather than an error.
    pub fn get_asset(&self, path: &str) -> Arc<Asset> {
        let mut caches = self.caches.lock();
        if let Some(asset) = caches.assets.get(path).and_then(Weak::upgrade) {
            return asset;
        }

        let package = match self.library.get_entry_package(path) {
            Some(package) => match self.package(&mut caches, package.name(), &mut Vec::new()) {
                Ok(package) => Some(package),
                Err(e) => {
                    warn!("Cannot resolve package of {path}: {e}");
                    None
                }
            },
            None => None,
        };

        let asset = Arc::new(Asset {
            path: path.to_string(),
            package,
            request: Mutex::new(None),
        });
        caches.assets.retain(|_, asset| asset.strong_count() > 0);
        caches
            .assets
            .insert(path.to_string(), Arc::downgrade(&asset));
        asset
    }

    /// Like [`ContentManager::get_asset`], looking the entry up by basename.
    pub fn find_asset(&self, name: &str) -> Arc<Asset> {
        let path = self
            .library
            .find_entry(name)
            .map(|entry| entry.path().to_string())
            .unwrap_or_else(|| name.to_string());
        self.get_asset(&path)
    }

    /// Live package wrappers.
    pub fn cached_packages(&self) -> usize {
        let caches = self.caches.lock();
        caches
            .packages
            .values()
            .filter(|package| package.strong_count() > 0)
            .count()
    }

    pub fn cached_assets(&self) -> usize {
        let caches = self.caches.lock();
        caches
            .assets
            .values()
            .filter(|asset| asset.strong_count() > 0)
            .count()
    }

    fn package(
        &self,
        caches: &mut Caches,
        name: &str,
        visiting: &mut Vec<String>,
    ) -> Result<Arc<Package>, PackageError> {
        if let Some(package) = caches.packages.get(name).and_then(Weak::upgrade) {
            return Ok(package);
        }
        let info = self
            .library
            .get_package(name)
            .ok_or_else(|| PackageError::UnknownPackage(name.to_string()))?
            .info();

        visiting.push(name.to_string());
        let mut dependencies = Vec::new();
        for dependency in &info.dependencies {
            if visiting.contains(dependency) {
                continue;
            }
            match self.package(caches, dependency, visiting) {
                Ok(package) => dependencies.push(package),
                Err(e) => warn!("Skipping dependency {dependency} of {name}: {e}"),
            }
        }
        visiting.pop();

        let handle = self.packages.get(name)?;
        let package = Arc::new_cyclic(|weak: &Weak<Package>| {
            let listener: Weak<dyn PackageListener> = weak.clone();
            handle.set_listener(listener);
            Package {
                handle,
                dependencies,
                waiters: Mutex::new(Vec::new()),
            }
        });

        caches.packages.retain(|_, package| package.strong_count() > 0);
        caches
            .packages
            .insert(name.to_string(), Arc::downgrade(&package));
        Ok(package)
    }
}
