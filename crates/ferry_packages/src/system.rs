use crate::backend::Backends;
use crate::content::ContentManager;
use crate::error::SystemError;
use crate::manager::PackageManager;
use ferry_client::{BaseUrlResolver, Downloader};
use ferry_core::prelude::*;
use ferry_fs::OsFileSystem;
use ferry_storage::LocalStorage;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::info;

/// Everything needed to serve content, wired from one [`ContentConfig`].
///
/// Must be created on the thread that will drive it: that thread becomes
/// the control context and has to call [`ContentSystem::pump`] regularly.
pub struct ContentSystem {
    config: ContentConfig,
    scheduler: Scheduler,
    storage: LocalStorage,
    downloader: Downloader,
    content: ContentManager,
    runtime: Option<Runtime>,
    shut_down: bool,
}

impl ContentSystem {
    /// Builds a system with its own I/O runtime.
    pub fn new(
        config: ContentConfig,
        library: ContentLibrary,
        backends: Backends,
    ) -> Result<Self, SystemError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.max_concurrent_downloads.clamp(1, 4))
            .thread_name("ferry-io")
            .enable_all()
            .build()?;
        let mut system = Self::with_runtime(config, library, backends, runtime.handle().clone())?;
        system.runtime = Some(runtime);
        Ok(system)
    }

    /// Builds a system whose transfers run on an existing runtime.
    pub fn with_runtime(
        config: ContentConfig,
        library: ContentLibrary,
        backends: Backends,
        runtime: Handle,
    ) -> Result<Self, SystemError> {
        let scheduler = Scheduler::new(config.pump_interval());

        std::fs::create_dir_all(&config.storage_root)?;
        let fs = Arc::new(OsFileSystem::new(config.storage_root.clone()));
        let storage = LocalStorage::new(fs, config.cache_extension.clone())?;

        let resolver = BaseUrlResolver::new(&config.base_url, config.user_agent.clone())?;
        let downloader = Downloader::new(scheduler.clone(), runtime, Arc::new(resolver), &config)?;

        let packages = PackageManager::new(
            scheduler.clone(),
            storage.clone(),
            downloader.clone(),
            Arc::new(library),
            backends,
            config.unload_policy,
        );

        info!(
            "Content system ready ({} packages, {} cached, source {})",
            packages.library().package_count(),
            storage.len(),
            config.base_url
        );

        Ok(Self {
            config,
            scheduler,
            storage,
            downloader,
            content: ContentManager::new(packages),
            runtime: None,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &ContentConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn packages(&self) -> &PackageManager {
        self.content.packages()
    }

    pub fn content(&self) -> &ContentManager {
        &self.content
    }

    pub fn library(&self) -> &Arc<ContentLibrary> {
        self.content.library()
    }

    /// Runs the work queued for the control context.
    pub fn pump(&self) -> usize {
        self.scheduler.pump()
    }

    /// Stops downloads, releases every package, saves the cache index and
    /// stops the owned runtime. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        self.downloader.shutdown();
        self.content.packages().shutdown();
        self.storage.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        info!("Content system shut down");
    }
}

impl Drop for ContentSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
