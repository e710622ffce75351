//! # Ferry Local Storage
//!
//! A content-addressed cache on top of a [`FileSystem`].
//!
//! Callers address blobs by alias. Each alias maps to a randomly named
//! backing file plus the [`ContentDigest`] of its bytes. The mapping is kept
//! in an index file (`cache.index`) with one `alias,backing_file,size,checksum`
//! line per entry, rewritten only when something changed.
//!
//! ## Usage
//!
//! ```no_run
//! use ferry_fs::OsFileSystem;
//! use ferry_storage::LocalStorage;
//! use std::io::Write;
//! use std::sync::Arc;
//!
//! let storage = LocalStorage::new(Arc::new(OsFileSystem::new("./ferry_cache")), ".pak")?;
//! let mut stream = storage.open_write("Characters")?;
//! stream.write_all(b"...")?;
//! let digest = stream.close()?;
//! assert!(storage.verify("Characters", &digest));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod stream;

pub use stream::{ReadStream, WriteStream};

use ferry_core::prelude::*;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const INDEX_FILE: &str = "cache.index";

pub(crate) type SharedFile = Arc<Mutex<Option<Box<dyn FileHandle>>>>;

struct CacheEntry {
    alias: String,
    backing_file: String,
    digest: ContentDigest,
    writing: bool,
    streams: Vec<(u64, SharedFile)>,
}

impl CacheEntry {
    fn is_busy(&self) -> bool {
        self.writing || !self.streams.is_empty()
    }
}

struct State {
    dirty: bool,
    shutdown: bool,
    next_stream: u64,
    files: SlotTable<CacheEntry>,
    aliases: HashMap<String, SlotHandle>,
}

impl State {
    fn entry(&self, alias: &str) -> Option<&CacheEntry> {
        self.aliases.get(alias).and_then(|h| self.files.try_get(*h))
    }

    fn attach(&mut self, handle: SlotHandle, file: Box<dyn FileHandle>) -> Option<(u64, SharedFile)> {
        let id = self.next_stream;
        let entry = self.files.try_get_mut(handle)?;
        self.next_stream += 1;
        let shared: SharedFile = Arc::new(Mutex::new(Some(file)));
        entry.streams.push((id, shared.clone()));
        Some((id, shared))
    }
}

pub(crate) struct StorageInner {
    fs: Arc<dyn FileSystem>,
    extension: String,
    state: RwLock<State>,
}

impl StorageInner {
    /// Drops the bookkeeping for a stream. The stream itself already released
    /// its file.
    pub(crate) fn release_read(&self, handle: SlotHandle, id: u64) {
        let mut state = self.state.write();
        if let Some(entry) = state.files.try_get_mut(handle) {
            entry.streams.retain(|(stream, _)| *stream != id);
        }
    }

    pub(crate) fn release_write(&self, handle: SlotHandle, id: u64, digest: Option<ContentDigest>) {
        let mut state = self.state.write();
        let Some(entry) = state.files.try_get_mut(handle) else {
            return;
        };
        entry.streams.retain(|(stream, _)| *stream != id);
        entry.writing = false;

        if let Some(digest) = digest
            && entry.digest != digest
        {
            debug!("{} digest updated {} => {}", entry.alias, entry.digest, digest);
            entry.digest = digest;
            state.dirty = true;
        }
    }
}

/// Content-addressed cache. Cloning shares the same cache.
#[derive(Clone)]
pub struct LocalStorage {
    inner: Arc<StorageInner>,
}

impl LocalStorage {
    /// Opens the cache, loading `cache.index` when present.
    pub fn new(fs: Arc<dyn FileSystem>, extension: impl Into<String>) -> Result<Self, StorageError> {
        let mut state = State {
            dirty: false,
            shutdown: false,
            next_stream: 0,
            files: SlotTable::new(),
            aliases: HashMap::new(),
        };

        if fs.exists(INDEX_FILE) {
            let mut text = String::new();
            fs.open_read(INDEX_FILE)?.read_to_string(&mut text)?;
            load_index(fs.as_ref(), &text, &mut state);
        }

        Ok(Self {
            inner: Arc::new(StorageInner {
                fs,
                extension: extension.into(),
                state: RwLock::new(state),
            }),
        })
    }

    /// Opens the single writer for `alias`, creating the entry if needed.
    /// Existing bytes are kept and the stream starts at offset zero.
    pub fn open_write(&self, alias: &str) -> Result<WriteStream, StorageError> {
        let mut state = self.inner.state.write();
        if state.shutdown {
            return Err(StorageError::Shutdown);
        }

        let handle = match state.aliases.get(alias).copied() {
            Some(handle) => {
                if state.files.try_get(handle).is_some_and(CacheEntry::is_busy) {
                    return Err(StorageError::Busy(alias.to_string()));
                }
                handle
            }
            None => {
                let backing_file = format!(
                    "{}{}",
                    hex::encode(rand::random::<[u8; 16]>()),
                    self.inner.extension
                );
                let handle = state.files.add(CacheEntry {
                    alias: alias.to_string(),
                    backing_file,
                    digest: ContentDigest::default(),
                    writing: false,
                    streams: Vec::new(),
                });
                state.aliases.insert(alias.to_string(), handle);
                state.dirty = true;
                handle
            }
        };

        let backing_file = state.files[handle].backing_file.clone();
        let file = self.inner.fs.open_write(&backing_file)?;
        let len = file.len()?;
        let (id, file) = state.attach(handle, file).ok_or(StorageError::Closed)?;
        state.files[handle].writing = true;

        Ok(WriteStream::new(self.inner.clone(), handle, id, alias, file, len))
    }

    /// Opens a reader. With `expected` set, a stored digest that differs is
    /// refused without opening anything.
    pub fn open_read(
        &self,
        alias: &str,
        expected: Option<&ContentDigest>,
    ) -> Result<ReadStream, StorageError> {
        let mut state = self.inner.state.write();
        if state.shutdown {
            return Err(StorageError::Shutdown);
        }

        let handle = *state
            .aliases
            .get(alias)
            .ok_or_else(|| StorageError::NotFound(alias.to_string()))?;
        let entry = state
            .files
            .try_get(handle)
            .ok_or_else(|| StorageError::NotFound(alias.to_string()))?;

        if entry.writing {
            return Err(StorageError::Busy(alias.to_string()));
        }
        if let Some(expected) = expected
            && entry.digest != *expected
        {
            warn!(
                "Refusing corrupted read of {alias}: stored {}, expected {expected}",
                entry.digest
            );
            return Err(StorageError::Corrupted {
                alias: alias.to_string(),
                stored: entry.digest,
                expected: *expected,
            });
        }
        if !self.inner.fs.exists(&entry.backing_file) {
            return Err(StorageError::NotFound(alias.to_string()));
        }

        let file = self.inner.fs.open_read(&entry.backing_file)?;
        let len = file.len()?;
        let (id, file) = state.attach(handle, file).ok_or(StorageError::Closed)?;
        Ok(ReadStream::new(self.inner.clone(), handle, id, file, len))
    }

    /// True when the entry is idle, its backing file exists and its digest
    /// equals `digest`. A mismatching idle entry is evicted.
    pub fn verify(&self, alias: &str, digest: &ContentDigest) -> bool {
        let mut state = self.inner.state.write();
        let Some(handle) = state.aliases.get(alias).copied() else {
            return false;
        };
        let Some(entry) = state.files.try_get(handle) else {
            return false;
        };
        if entry.writing {
            return false;
        }
        if entry.digest == *digest && self.inner.fs.exists(&entry.backing_file) {
            return true;
        }
        if !entry.streams.is_empty() {
            warn!("{alias} is invalid but still has open readers");
            return false;
        }

        debug!("Evicting {alias}: stored {}, expected {digest}", entry.digest);
        self.inner.fs.delete(&entry.backing_file);
        state.files.remove(handle);
        state.aliases.remove(alias);
        state.dirty = true;
        false
    }

    /// Like [`LocalStorage::verify`] but never evicts.
    pub fn is_valid(&self, alias: &str, digest: &ContentDigest) -> bool {
        let state = self.inner.state.read();
        state
            .entry(alias)
            .is_some_and(|entry| !entry.writing && entry.digest == *digest)
    }

    pub fn exists(&self, alias: &str, digest: Option<&ContentDigest>) -> bool {
        let state = self.inner.state.read();
        state.entry(alias).is_some_and(|entry| {
            digest.is_none_or(|d| entry.digest == *d) && self.inner.fs.exists(&entry.backing_file)
        })
    }

    pub fn is_writing(&self, alias: &str) -> bool {
        let state = self.inner.state.read();
        state.entry(alias).is_some_and(|entry| entry.writing)
    }

    pub fn digest(&self, alias: &str) -> Option<ContentDigest> {
        let state = self.inner.state.read();
        state.entry(alias).map(|entry| entry.digest)
    }

    /// Removes an idle entry and its backing file. Entries with open streams
    /// are left alone.
    pub fn delete(&self, alias: &str) -> bool {
        let mut state = self.inner.state.write();
        let Some(handle) = state.aliases.get(alias).copied() else {
            return false;
        };
        let Some(entry) = state.files.try_get(handle) else {
            return false;
        };
        if entry.is_busy() {
            warn!("Cannot delete {alias} while it is open");
            return false;
        }
        if !self.inner.fs.delete(&entry.backing_file) {
            return false;
        }

        state.files.remove(handle);
        state.aliases.remove(alias);
        state.dirty = true;
        true
    }

    pub fn total_size(&self) -> u64 {
        let state = self.inner.state.read();
        state
            .files
            .iter()
            .map(|(_, entry)| entry.digest.size as u64)
            .sum()
    }

    /// Every cached alias with its digest, sorted by alias.
    pub fn entries(&self) -> Vec<(String, ContentDigest)> {
        let state = self.inner.state.read();
        let mut entries: Vec<_> = state
            .files
            .iter()
            .map(|(_, entry)| (entry.alias.clone(), entry.digest))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.state.read().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the index if anything changed since the last save.
    pub fn save_state(&self) -> Result<(), StorageError> {
        let mut state = self.inner.state.write();
        if !state.dirty {
            return Ok(());
        }

        let mut text = String::new();
        for (_, entry) in state.files.iter() {
            text.push_str(&format!(
                "{},{},{},{}\n",
                entry.alias, entry.backing_file, entry.digest.size, entry.digest.checksum
            ));
        }

        let mut file = self.inner.fs.open_write(INDEX_FILE)?;
        file.set_len(0)?;
        file.write_all(text.as_bytes())?;
        file.flush()?;
        state.dirty = false;
        debug!("Saved cache index ({} entries)", state.files.len());
        Ok(())
    }

    /// Closes every stream callers left open, then saves the index. Entries
    /// whose writer was cut off are rescanned so the index matches their
    /// backing files.
    pub fn shutdown(&self) {
        {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            state.shutdown = true;

            let mut stale = Vec::new();
            for (handle, entry) in state.files.iter_mut() {
                for (_, stream) in entry.streams.drain(..) {
                    if stream.lock().take().is_some() {
                        warn!("Force closed a stream of {}", entry.alias);
                    }
                }
                if !entry.writing {
                    continue;
                }
                entry.writing = false;
                state.dirty = true;
                match rescan(self.inner.fs.as_ref(), &entry.backing_file) {
                    Ok(digest) => entry.digest = digest,
                    Err(e) => {
                        warn!("Dropping {}: cannot rescan after forced close: {e}", entry.alias);
                        stale.push(handle);
                    }
                }
            }
            for handle in stale {
                if let Some(entry) = state.files.take(handle) {
                    self.inner.fs.delete(&entry.backing_file);
                    state.aliases.remove(&entry.alias);
                }
            }
        }

        if let Err(e) = self.save_state() {
            warn!("Failed to save cache index: {e}");
        }
    }
}

fn rescan(fs: &dyn FileSystem, backing_file: &str) -> Result<ContentDigest, StorageError> {
    let mut file = fs.open_read(backing_file)?;
    let (checksum, len) = Checksum::from_reader(&mut *file)?;
    let size = u32::try_from(len).map_err(std::io::Error::other)?;
    Ok(ContentDigest::new(size, checksum))
}

fn load_index(fs: &dyn FileSystem, text: &str, state: &mut State) {
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // alias may contain commas, the other fields never do
        let mut fields = line.rsplitn(4, ',');
        let parsed = (|| {
            let checksum = fields.next()?.parse::<Checksum>().ok()?;
            let size = fields.next()?.parse::<u32>().ok()?;
            let backing_file = fields.next()?;
            let alias = fields.next()?;
            Some((alias, backing_file, ContentDigest::new(size, checksum)))
        })();

        let Some((alias, backing_file, digest)) = parsed else {
            warn!("Skipping malformed cache index line {}: {line}", number + 1);
            state.dirty = true;
            continue;
        };
        if state.aliases.contains_key(alias) {
            warn!("Skipping duplicate cache entry {alias}");
            state.dirty = true;
            continue;
        }
        if !fs.exists(backing_file) {
            warn!("Dropping {alias}: backing file {backing_file} is missing");
            state.dirty = true;
            continue;
        }

        let handle = state.files.add(CacheEntry {
            alias: alias.to_string(),
            backing_file: backing_file.to_string(),
            digest,
            writing: false,
            streams: Vec::new(),
        });
        state.aliases.insert(alias.to_string(), handle);
    }
    info!("Loaded cache index ({} entries)", state.files.len());
}
