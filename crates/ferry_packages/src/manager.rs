//! Per-package load state machines.
//!
//! Every package name known to the library gets at most one slot. A slot
//! moves through [`SlotState`] under `load` and under the release of its last
//! [`PackageHandle`]. All transitions run on the control context; work that
//! finishes elsewhere (downloads, async backend calls) is posted back through
//! the [`Scheduler`].
//!
//! Transitions are computed under the slot lock and produce a list of
//! effects. Effects (callbacks, backend calls, new downloads) run after the
//! lock is released so callers may re-enter the manager from any callback.

use crate::backend::{AssetObject, Backends, LoadedArchive, LoadedBundle};
use crate::error::{BackendError, PackageError};
use bytes::Bytes;
use ferry_client::{DownloadResult, Downloader, JobHandle};
use ferry_core::prelude::*;
use ferry_storage::{LocalStorage, ReadStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

pub type AssetResult = Result<Option<AssetObject>, PackageError>;
pub type AssetCallback = Box<dyn FnOnce(AssetResult) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Created,
    Loading,
    Loaded,
    /// The package is known but its backend could not be produced.
    Invalid,
    UnloadAfterLoading,
    WaitForUnload,
    Unloading,
    WaitForLoad,
}

impl SlotState {
    /// Loaded or invalid: nothing left to wait for.
    pub fn is_completed(self) -> bool {
        matches!(self, SlotState::Loaded | SlotState::Invalid)
    }
}

/// Told when a package finishes loading, successfully or not.
pub trait PackageListener: Send + Sync + 'static {
    fn on_package_completed(&self, name: &str, state: SlotState);
}

/// Identifies a pending asset request. Passing it back to
/// [`PackageHandle::request_asset`] replaces the pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(SlotHandle);

impl RequestId {
    pub const NONE: RequestId = RequestId(SlotHandle::NONE);
}

struct AssetRequest {
    name: String,
    callback: AssetCallback,
}

#[derive(Clone)]
enum Backend {
    Bundle(Arc<Mutex<Box<dyn LoadedBundle>>>),
    Archive(Arc<Mutex<Box<dyn LoadedArchive>>>),
}

struct Slot {
    name: String,
    kind: PackageKind,
    digest: ContentDigest,
    state: SlotState,
    // live handles plus dependent slots
    refs: usize,
    dependencies: Vec<SlotHandle>,
    dependents: Vec<SlotHandle>,
    // set once the backend is ready, cleared on unload
    backend: Option<Backend>,
    requests: SlotTable<AssetRequest>,
    listener: Option<Weak<dyn PackageListener>>,
    job: Option<JobHandle>,
}

impl Slot {
    fn set_state(&mut self, state: SlotState) {
        debug!("{} {:?} => {:?}", self.name, self.state, state);
        self.state = state;
    }
}

#[derive(Default)]
struct Slots {
    table: SlotTable<Slot>,
    by_name: HashMap<String, SlotHandle>,
    shutdown: bool,
}

enum Effect {
    Notify(Weak<dyn PackageListener>, String, SlotState),
    Deliver(AssetCallback, AssetResult),
    Discard(AssetCallback),
    Fetch(SlotHandle, String, u32),
    Flush(Backend, Vec<AssetRequest>),
    /// Release a backend, reporting back to the slot when one is given.
    Release(Backend, Option<SlotHandle>),
}

struct ManagerInner {
    scheduler: Scheduler,
    storage: LocalStorage,
    downloader: Downloader,
    library: Arc<ContentLibrary>,
    backends: Backends,
    policy: UnloadPolicy,
    slots: Mutex<Slots>,
}

/// Owns the package slots. Cloning shares the same manager.
#[derive(Clone)]
pub struct PackageManager {
    inner: Arc<ManagerInner>,
}

impl PackageManager {
    pub fn new(
        scheduler: Scheduler,
        storage: LocalStorage,
        downloader: Downloader,
        library: Arc<ContentLibrary>,
        backends: Backends,
        policy: UnloadPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                scheduler,
                storage,
                downloader,
                library,
                backends,
                policy,
                slots: Mutex::new(Slots::default()),
            }),
        }
    }

    /// Returns a handle to the slot for `name`, creating it (and the slots
    /// of its dependencies) on first use.
    pub fn get(&self, name: &str) -> Result<PackageHandle, PackageError> {
        self.inner.ensure_control()?;
        let slot = self.inner.apply(|slots, _| {
            if slots.shutdown {
                return Err(PackageError::Shutdown);
            }
            let handle = self
                .inner
                .get_or_create(slots, name, &mut Vec::new())
                .ok_or_else(|| PackageError::UnknownPackage(name.to_string()))?;
            if let Some(slot) = slots.table.try_get_mut(handle) {
                slot.refs += 1;
            }
            Ok(handle)
        })?;

        Ok(PackageHandle {
            inner: self.inner.clone(),
            slot,
            name: name.to_string(),
        })
    }

    pub fn state(&self, name: &str) -> Option<SlotState> {
        let slots = self.inner.slots.lock();
        let handle = slots.by_name.get(name)?;
        slots.table.try_get(*handle).map(|slot| slot.state)
    }

    pub fn slot_count(&self) -> usize {
        self.inner.slots.lock().table.len()
    }

    pub fn library(&self) -> &Arc<ContentLibrary> {
        &self.inner.library
    }

    /// Releases every backend synchronously and drops all slots. Pending
    /// asset requests fail with [`PackageError::Shutdown`].
    pub fn shutdown(&self) {
        let released: Vec<Slot> = {
            let mut slots = self.inner.slots.lock();
            slots.shutdown = true;
            slots.by_name.clear();
            let mut released = Vec::new();
            while let Some((_, slot)) = slots.table.take_first() {
                released.push(slot);
            }
            released
        };

        let count = released.len();
        for mut slot in released {
            while let Some((_, request)) = slot.requests.take_first() {
                deliver(request.callback, Err(PackageError::Shutdown));
            }
            if let Some(backend) = slot.backend.take() {
                release_now(&backend);
            }
        }
        info!("Package manager shut down ({count} slots released)");
    }
}

impl ManagerInner {
    fn apply<R>(self: &Arc<Self>, f: impl FnOnce(&mut Slots, &mut Vec<Effect>) -> R) -> R {
        let mut effects = Vec::new();
        let result = {
            let mut slots = self.slots.lock();
            f(&mut slots, &mut effects)
        };
        self.run(effects);
        result
    }

    fn run(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify(listener, name, state) => {
                    if let Some(listener) = listener.upgrade()
                        && catch_unwind(AssertUnwindSafe(|| {
                            listener.on_package_completed(&name, state)
                        }))
                        .is_err()
                    {
                        error!("Listener of {name} panicked");
                    }
                }
                Effect::Deliver(callback, result) => deliver(callback, result),
                Effect::Discard(callback) => drop(callback),
                Effect::Fetch(handle, name, size) => self.fetch(handle, &name, size),
                Effect::Flush(backend, requests) => {
                    for request in requests {
                        self.dispatch_request(&backend, request);
                    }
                }
                Effect::Release(backend, report) => self.release_backend(backend, report),
            }
        }
    }

    fn get_or_create(
        self: &Arc<Self>,
        slots: &mut Slots,
        name: &str,
        creating: &mut Vec<String>,
    ) -> Option<SlotHandle> {
        if let Some(handle) = slots.by_name.get(name) {
            return Some(*handle);
        }
        let info = self.library.get_package(name)?.info().clone();

        let handle = slots.table.add(Slot {
            name: info.name.clone(),
            kind: info.kind,
            digest: info.digest,
            state: SlotState::Created,
            refs: 0,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            backend: None,
            requests: SlotTable::new(),
            listener: None,
            job: None,
        });
        slots.by_name.insert(info.name.clone(), handle);

        creating.push(info.name.clone());
        for dependency in &info.dependencies {
            if creating.contains(dependency) {
                warn!("Dependency cycle {name} => {dependency}, edge ignored");
                continue;
            }
            let Some(dep) = self.get_or_create(slots, dependency, creating) else {
                warn!("{name} depends on unknown package {dependency}");
                continue;
            };
            if let Some(slot) = slots.table.try_get_mut(dep) {
                slot.refs += 1;
                slot.dependents.push(handle);
            }
            if let Some(slot) = slots.table.try_get_mut(handle) {
                slot.dependencies.push(dep);
            }
        }
        creating.pop();
        Some(handle)
    }

    fn load(self: &Arc<Self>, slots: &mut Slots, handle: SlotHandle, fx: &mut Vec<Effect>) {
        let Some(slot) = slots.table.try_get_mut(handle) else {
            return;
        };
        match slot.state {
            SlotState::Created => {
                slot.set_state(SlotState::Loading);
                for dep in slot.dependencies.clone() {
                    self.load(slots, dep, fx);
                }
                self.load_package_file(slots, handle, true, fx);
            }
            SlotState::Loading | SlotState::WaitForLoad => {}
            SlotState::Loaded | SlotState::Invalid => notify(slot, fx),
            SlotState::WaitForUnload => {
                slot.set_state(SlotState::Loaded);
                self.on_completed(slots, handle, fx);
            }
            SlotState::Unloading => slot.set_state(SlotState::WaitForLoad),
            SlotState::UnloadAfterLoading => slot.set_state(SlotState::Loading),
        }
    }

    /// Opens the cached copy, or fetches it when `allow_download` is set.
    fn load_package_file(
        self: &Arc<Self>,
        slots: &mut Slots,
        handle: SlotHandle,
        allow_download: bool,
        fx: &mut Vec<Effect>,
    ) {
        let Some(slot) = slots.table.try_get(handle) else {
            return;
        };
        let name = slot.name.clone();
        let digest = slot.digest;

        match self.storage.open_read(&name, Some(&digest)) {
            Ok(stream) => {
                let inner = Arc::downgrade(self);
                self.scheduler.post(move || {
                    if let Some(inner) = inner.upgrade() {
                        inner.open_backend(handle, stream);
                    }
                });
            }
            Err(e) => {
                // a short copy may be a partial download worth resuming
                if let StorageError::Corrupted { stored, .. } = &e
                    && (stored.size >= digest.size || !allow_download)
                {
                    self.storage.delete(&name);
                }
                if allow_download {
                    debug!("{name} not cached ({e}), downloading");
                    fx.push(Effect::Fetch(handle, name, digest.size));
                } else {
                    warn!("{name} is unavailable: {e}");
                    self.finish_load(slots, handle, None, fx);
                }
            }
        }
    }

    fn fetch(self: &Arc<Self>, handle: SlotHandle, name: &str, size: u32) {
        match self.downloader.enqueue(&self.storage, name, Some(size)) {
            Ok(job) => {
                if let Some(slot) = self.slots.lock().table.try_get_mut(handle) {
                    slot.job = Some(job.clone());
                }
                let inner = Arc::downgrade(self);
                job.bind(move |result: &DownloadResult| {
                    if let Some(inner) = inner.upgrade() {
                        inner.download_finished(handle, result.success);
                    }
                });
            }
            Err(e) => {
                warn!("Cannot download {name}: {e}");
                self.download_finished(handle, false);
            }
        }
    }

    fn download_finished(self: &Arc<Self>, handle: SlotHandle, success: bool) {
        self.apply(|slots, fx| {
            let Some(slot) = slots.table.try_get_mut(handle) else {
                return;
            };
            if !matches!(
                slot.state,
                SlotState::Loading | SlotState::UnloadAfterLoading
            ) {
                return;
            }
            slot.job = None;
            debug!("Download of {} finished (success: {success})", slot.name);
            self.load_package_file(slots, handle, false, fx);
        });
    }

    fn open_backend(self: &Arc<Self>, handle: SlotHandle, stream: ReadStream) {
        let (name, kind) = {
            let slots = self.slots.lock();
            match slots.table.try_get(handle) {
                Some(slot)
                    if matches!(
                        slot.state,
                        SlotState::Loading | SlotState::UnloadAfterLoading
                    ) =>
                {
                    (slot.name.clone(), slot.kind)
                }
                _ => return,
            }
        };

        let opened = match kind {
            PackageKind::Bundle => self
                .backends
                .bundle
                .open(&name, stream)
                .map(|bundle| Backend::Bundle(Arc::new(Mutex::new(bundle)))),
            PackageKind::Archive => self
                .backends
                .archive
                .open(&name, stream)
                .map(|archive| Backend::Archive(Arc::new(Mutex::new(archive)))),
        };
        let backend = match opened {
            Ok(backend) => Some(backend),
            Err(e) => {
                warn!("Failed to open {name}: {e}");
                None
            }
        };

        self.apply(|slots, fx| self.finish_load(slots, handle, backend, fx));
    }

    fn finish_load(
        self: &Arc<Self>,
        slots: &mut Slots,
        handle: SlotHandle,
        backend: Option<Backend>,
        fx: &mut Vec<Effect>,
    ) {
        let Some(slot) = slots.table.try_get_mut(handle) else {
            if let Some(backend) = backend {
                fx.push(Effect::Release(backend, None));
            }
            return;
        };
        if !matches!(
            slot.state,
            SlotState::Loading | SlotState::UnloadAfterLoading
        ) {
            if let Some(backend) = backend {
                fx.push(Effect::Release(backend, None));
            }
            return;
        }

        match backend {
            Some(backend) => {
                slot.backend = Some(backend);
                self.check_completed(slots, handle, fx);
            }
            None => {
                let unload_after = slot.state == SlotState::UnloadAfterLoading;
                slot.set_state(SlotState::Invalid);
                self.on_completed(slots, handle, fx);
                if unload_after {
                    self.unload(slots, handle, fx);
                }
            }
        }
    }

    /// Promotes a loading slot once its backend and dependencies are done.
    fn check_completed(self: &Arc<Self>, slots: &mut Slots, handle: SlotHandle, fx: &mut Vec<Effect>) {
        let Some(slot) = slots.table.try_get(handle) else {
            return;
        };
        if !matches!(
            slot.state,
            SlotState::Loading | SlotState::UnloadAfterLoading
        ) || slot.backend.is_none()
        {
            return;
        }
        // a dependency that no longer exists counts as completed
        let ready = slot.dependencies.iter().all(|dep| {
            slots
                .table
                .try_get(*dep)
                .is_none_or(|dep| dep.state.is_completed())
        });
        if !ready {
            return;
        }

        let Some(slot) = slots.table.try_get_mut(handle) else {
            return;
        };
        let unload_after = slot.state == SlotState::UnloadAfterLoading;
        slot.set_state(SlotState::Loaded);
        self.on_completed(slots, handle, fx);
        if unload_after {
            self.unload(slots, handle, fx);
        }
    }

    /// Runs once a slot reaches Loaded or Invalid.
    fn on_completed(self: &Arc<Self>, slots: &mut Slots, handle: SlotHandle, fx: &mut Vec<Effect>) {
        let Some(slot) = slots.table.try_get_mut(handle) else {
            return;
        };
        notify(slot, fx);

        let mut requests = Vec::new();
        while let Some((_, request)) = slot.requests.take_first() {
            requests.push(request);
        }
        match (&slot.backend, slot.state) {
            (Some(backend), SlotState::Loaded) => {
                if !requests.is_empty() {
                    fx.push(Effect::Flush(backend.clone(), requests));
                }
            }
            _ => {
                for request in requests {
                    fx.push(Effect::Deliver(
                        request.callback,
                        Err(PackageError::Invalid(slot.name.clone())),
                    ));
                }
            }
        }

        for dependent in slot.dependents.clone() {
            self.check_completed(slots, dependent, fx);
        }
    }

    fn unload(self: &Arc<Self>, slots: &mut Slots, handle: SlotHandle, fx: &mut Vec<Effect>) {
        let Some(slot) = slots.table.try_get_mut(handle) else {
            return;
        };
        match slot.state {
            SlotState::Created => self.try_free(slots, handle, fx),
            SlotState::Loading => slot.set_state(SlotState::UnloadAfterLoading),
            SlotState::WaitForLoad => slot.set_state(SlotState::Unloading),
            SlotState::Loaded => {
                slot.set_state(SlotState::WaitForUnload);
                let inner = Arc::downgrade(self);
                self.scheduler.post(move || {
                    if let Some(inner) = inner.upgrade() {
                        inner.execute_unload(handle);
                    }
                });
            }
            SlotState::Invalid => {
                slot.set_state(SlotState::Created);
                slot.backend = None;
                self.try_free(slots, handle, fx);
            }
            SlotState::UnloadAfterLoading | SlotState::WaitForUnload | SlotState::Unloading => {}
        }
    }

    fn execute_unload(self: &Arc<Self>, handle: SlotHandle) {
        self.apply(|slots, fx| {
            let Some(slot) = slots.table.try_get_mut(handle) else {
                return;
            };
            // a load in the meantime resurrected the slot
            if slot.state != SlotState::WaitForUnload {
                return;
            }
            slot.set_state(SlotState::Unloading);
            match slot.backend.take() {
                Some(backend) => fx.push(Effect::Release(backend, Some(handle))),
                None => self.on_unloaded(slots, handle, fx),
            }
        });
    }

    fn release_backend(self: &Arc<Self>, backend: Backend, report: Option<SlotHandle>) {
        match (&backend, self.policy, report) {
            (Backend::Bundle(bundle), UnloadPolicy::Deferred, Some(handle)) => {
                let inner = Arc::downgrade(self);
                let scheduler = self.scheduler.clone();
                bundle.lock().unload_async(Box::new(move || {
                    scheduler.post(move || {
                        if let Some(inner) = inner.upgrade() {
                            inner.apply(|slots, fx| inner.on_unloaded(slots, handle, fx));
                        }
                    });
                }));
            }
            _ => {
                release_now(&backend);
                if let Some(handle) = report {
                    self.apply(|slots, fx| self.on_unloaded(slots, handle, fx));
                }
            }
        }
    }

    fn on_unloaded(self: &Arc<Self>, slots: &mut Slots, handle: SlotHandle, fx: &mut Vec<Effect>) {
        let Some(slot) = slots.table.try_get_mut(handle) else {
            return;
        };
        match slot.state {
            SlotState::Unloading => {
                slot.set_state(SlotState::Created);
                self.try_free(slots, handle, fx);
            }
            SlotState::WaitForLoad => {
                slot.set_state(SlotState::Created);
                self.load(slots, handle, fx);
            }
            _ => {}
        }
    }

    /// Removes an unreferenced slot that is back at Created.
    fn try_free(self: &Arc<Self>, slots: &mut Slots, handle: SlotHandle, fx: &mut Vec<Effect>) {
        let free = slots
            .table
            .try_get(handle)
            .is_some_and(|slot| slot.state == SlotState::Created && slot.refs == 0);
        if !free {
            return;
        }
        let Some(mut slot) = slots.table.take(handle) else {
            return;
        };
        slots.by_name.remove(&slot.name);
        debug!("Released slot {}", slot.name);

        while let Some((_, request)) = slot.requests.take_first() {
            fx.push(Effect::Deliver(
                request.callback,
                Err(PackageError::Unloaded(slot.name.clone())),
            ));
        }
        for dep in slot.dependencies {
            if let Some(dependency) = slots.table.try_get_mut(dep) {
                dependency.dependents.retain(|d| *d != handle);
            }
            self.release(slots, dep, fx);
        }
    }

    fn release(self: &Arc<Self>, slots: &mut Slots, handle: SlotHandle, fx: &mut Vec<Effect>) {
        let Some(slot) = slots.table.try_get_mut(handle) else {
            return;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            self.unload(slots, handle, fx);
        }
    }

    fn dispatch_request(self: &Arc<Self>, backend: &Backend, request: AssetRequest) {
        match backend {
            Backend::Bundle(bundle) => {
                let scheduler = self.scheduler.clone();
                let callback = request.callback;
                bundle.lock().load_asset_async(
                    &request.name,
                    Box::new(move |result| {
                        scheduler.post(move || deliver(callback, result.map_err(PackageError::from)));
                    }),
                );
            }
            Backend::Archive(archive) => {
                deliver(request.callback, read_entry(archive, &request.name));
            }
        }
    }

    fn ensure_control(&self) -> Result<(), PackageError> {
        if self.scheduler.is_control_thread() {
            Ok(())
        } else {
            Err(PackageError::NotControlContext)
        }
    }

    /// Loads synchronously, pumping the control context until the slot
    /// settles.
    fn wait_loaded(self: &Arc<Self>, handle: SlotHandle, name: &str) -> Result<Backend, PackageError> {
        self.ensure_control()?;
        self.apply(|slots, fx| self.load(slots, handle, fx));

        self.scheduler.wait_until(|| {
            let slots = self.slots.lock();
            slots
                .table
                .try_get(handle)
                .is_none_or(|slot| slot.state.is_completed())
        });

        let slots = self.slots.lock();
        match slots.table.try_get(handle) {
            Some(slot) if slot.state == SlotState::Loaded => slot
                .backend
                .clone()
                .ok_or_else(|| PackageError::Invalid(name.to_string())),
            Some(_) => Err(PackageError::Invalid(name.to_string())),
            None if slots.shutdown => Err(PackageError::Shutdown),
            None => Err(PackageError::Unloaded(name.to_string())),
        }
    }
}

fn notify(slot: &Slot, fx: &mut Vec<Effect>) {
    if let Some(listener) = &slot.listener {
        fx.push(Effect::Notify(listener.clone(), slot.name.clone(), slot.state));
    }
}

fn deliver(callback: AssetCallback, result: AssetResult) {
    if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
        error!("Asset callback panicked");
    }
}

fn release_now(backend: &Backend) {
    match backend {
        Backend::Bundle(bundle) => bundle.lock().unload(),
        Backend::Archive(archive) => archive.lock().unload(),
    }
}

fn read_entry(archive: &Mutex<Box<dyn LoadedArchive>>, name: &str) -> AssetResult {
    let Some(mut reader) = archive.lock().open_entry(name) else {
        return Ok(None);
    };
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(BackendError::from)?;
    let object: AssetObject = Arc::new(Bytes::from(data));
    Ok(Some(object))
}

/// A counted reference to a package slot. The slot unloads once the last
/// handle (and every dependent slot) lets go.
pub struct PackageHandle {
    inner: Arc<ManagerInner>,
    slot: SlotHandle,
    name: String,
}

impl PackageHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Option<PackageKind> {
        self.inner.slots.lock().table.try_get(self.slot).map(|slot| slot.kind)
    }

    /// `None` once the manager has shut down.
    pub fn state(&self) -> Option<SlotState> {
        self.inner
            .slots
            .lock()
            .table
            .try_get(self.slot)
            .map(|slot| slot.state)
    }

    pub fn is_completed(&self) -> bool {
        self.state().is_none_or(SlotState::is_completed)
    }

    /// Bytes received so far while the package is being downloaded.
    pub fn download_progress(&self) -> Option<u64> {
        let slots = self.inner.slots.lock();
        let job = slots.table.try_get(self.slot)?.job.as_ref()?;
        Some(job.info().received_bytes)
    }

    pub fn set_listener(&self, listener: Weak<dyn PackageListener>) {
        if let Some(slot) = self.inner.slots.lock().table.try_get_mut(self.slot) {
            slot.listener = Some(listener);
        }
    }

    /// Starts loading the package and its dependencies. The listener hears
    /// about completion.
    pub fn load(&self) -> Result<(), PackageError> {
        self.inner.ensure_control()?;
        let slot = self.slot;
        self.inner.apply(|slots, fx| self.inner.load(slots, slot, fx));
        Ok(())
    }

    /// Loads the package and its dependencies, pumping the control context
    /// until the slot settles.
    pub fn load_sync(&self) -> Result<(), PackageError> {
        self.inner.wait_loaded(self.slot, &self.name).map(|_| ())
    }

    /// Loads the package synchronously, then asks the backend for `name`.
    pub fn load_asset_sync(&self, name: &str) -> AssetResult {
        match self.inner.wait_loaded(self.slot, &self.name)? {
            Backend::Bundle(bundle) => Ok(bundle.lock().load_asset(name)?),
            Backend::Archive(archive) => read_entry(&archive, name),
        }
    }

    /// Queues a request for `name`, answered once the package is loaded.
    /// Passing a still pending `reuse` id replaces that request. Off the
    /// control context the callback fails at once with
    /// [`PackageError::NotControlContext`].
    pub fn request_asset(
        &self,
        name: &str,
        reuse: Option<RequestId>,
        callback: impl FnOnce(AssetResult) + Send + 'static,
    ) -> RequestId {
        let handle = self.slot;
        let callback: AssetCallback = Box::new(callback);
        if let Err(e) = self.inner.ensure_control() {
            deliver(callback, Err(e));
            return RequestId::NONE;
        }
        self.inner.apply(|slots, fx| {
            let Some(slot) = slots.table.try_get_mut(handle) else {
                let error = if slots.shutdown {
                    PackageError::Shutdown
                } else {
                    PackageError::Unloaded(self.name.clone())
                };
                fx.push(Effect::Deliver(callback, Err(error)));
                return RequestId::NONE;
            };

            let request = AssetRequest {
                name: name.to_string(),
                callback,
            };
            match (slot.state, &slot.backend) {
                (SlotState::Loaded, Some(backend)) => {
                    fx.push(Effect::Flush(backend.clone(), vec![request]));
                    return RequestId::NONE;
                }
                (SlotState::Invalid, _) => {
                    fx.push(Effect::Deliver(
                        request.callback,
                        Err(PackageError::Invalid(slot.name.clone())),
                    ));
                    return RequestId::NONE;
                }
                _ => {}
            }

            let id = match reuse {
                Some(id) if slot.requests.contains(id.0) => {
                    if let Some(old) = slot.requests.replace(id.0, request) {
                        fx.push(Effect::Discard(old.callback));
                    }
                    id
                }
                _ => RequestId(slot.requests.add(request)),
            };
            self.inner.load(slots, handle, fx);
            id
        })
    }

    /// Drops a pending request without calling it.
    pub fn cancel_asset_request(&self, id: RequestId) -> Result<bool, PackageError> {
        self.inner.ensure_control()?;
        let handle = self.slot;
        Ok(self.inner.apply(|slots, fx| {
            let Some(slot) = slots.table.try_get_mut(handle) else {
                return false;
            };
            match slot.requests.take(id.0) {
                Some(request) => {
                    fx.push(Effect::Discard(request.callback));
                    true
                }
                None => false,
            }
        }))
    }

    /// Loads an archive package synchronously and opens one of its entries.
    pub fn open_stream(&self, entry: &str) -> Result<Option<Box<dyn Read + Send>>, PackageError> {
        match self.inner.wait_loaded(self.slot, &self.name)? {
            Backend::Archive(archive) => Ok(archive.lock().open_entry(entry)),
            Backend::Bundle(_) => Err(PackageError::NotAnArchive(self.name.clone())),
        }
    }
}

impl Clone for PackageHandle {
    fn clone(&self) -> Self {
        if let Some(slot) = self.inner.slots.lock().table.try_get_mut(self.slot) {
            slot.refs += 1;
        }
        Self {
            inner: self.inner.clone(),
            slot: self.slot,
            name: self.name.clone(),
        }
    }
}

impl Drop for PackageHandle {
    fn drop(&mut self) {
        let handle = self.slot;
        if self.inner.scheduler.is_control_thread() {
            self.inner.apply(|slots, fx| self.inner.release(slots, handle, fx));
        } else {
            let inner = self.inner.clone();
            self.inner.scheduler.post(move || {
                inner.apply(|slots, fx| inner.release(slots, handle, fx));
            });
        }
    }
}

impl std::fmt::Debug for PackageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
