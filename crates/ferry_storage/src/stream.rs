use crate::{SharedFile, StorageInner};
use ferry_core::prelude::*;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::warn;

fn closed() -> io::Error {
    io::Error::other(StorageError::Closed)
}

/// Exclusive writer for one cache entry.
///
/// The checksum follows appends as they land. Any other write invalidates
/// it and the next [`WriteStream::digest`] rescans the file.
pub struct WriteStream {
    storage: Arc<StorageInner>,
    handle: SlotHandle,
    id: u64,
    alias: String,
    file: SharedFile,
    pos: u64,
    len: u64,
    checksum: Checksum,
    synced: bool,
    closed: bool,
}

impl WriteStream {
    pub(crate) fn new(
        storage: Arc<StorageInner>,
        handle: SlotHandle,
        id: u64,
        alias: &str,
        file: SharedFile,
        len: u64,
    ) -> Self {
        Self {
            storage,
            handle,
            id,
            alias: alias.to_string(),
            file,
            pos: 0,
            len,
            checksum: Checksum::default(),
            synced: len == 0,
            closed: false,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Whether the rolling checksum currently covers the whole file.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn set_len(&mut self, len: u64) -> Result<(), StorageError> {
        if len == self.len {
            return Ok(());
        }
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StorageError::Closed)?;
        file.set_len(len)?;
        self.len = len;
        if len == 0 {
            self.checksum = Checksum::default();
            self.synced = true;
        } else {
            self.synced = false;
        }
        Ok(())
    }

    /// Digest of everything written so far.
    pub fn digest(&mut self) -> Result<ContentDigest, StorageError> {
        if !self.synced {
            let mut guard = self.file.lock();
            let file = guard.as_mut().ok_or(StorageError::Closed)?;
            file.seek(SeekFrom::Start(0))?;
            let (checksum, _) = Checksum::from_reader(&mut *file)?;
            file.seek(SeekFrom::Start(self.pos))?;
            self.checksum = checksum;
            self.synced = true;
        }
        Ok(ContentDigest::new(
            u32::try_from(self.len).unwrap_or(u32::MAX),
            self.checksum,
        ))
    }

    /// Flushes, records the final digest on the entry and releases the
    /// writer slot.
    pub fn close(mut self) -> Result<ContentDigest, StorageError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<ContentDigest, StorageError> {
        self.closed = true;
        let result = self.flush_and_digest();
        self.file.lock().take();
        self.storage
            .release_write(self.handle, self.id, result.as_ref().ok().copied());
        result
    }

    fn flush_and_digest(&mut self) -> Result<ContentDigest, StorageError> {
        {
            let mut guard = self.file.lock();
            let file = guard.as_mut().ok_or(StorageError::Closed)?;
            file.flush()?;
        }
        self.digest()
    }
}

impl Write for WriteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(closed)?;
        let written = file.write(buf)?;

        if self.synced && self.pos == self.len {
            self.checksum = self.checksum.update(&buf[..written]);
        } else {
            self.synced = false;
        }
        self.pos += written as u64;
        self.len = self.len.max(self.pos);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.file.lock();
        guard.as_mut().ok_or_else(closed)?.flush()
    }
}

impl Seek for WriteStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(closed)?;
        self.pos = file.seek(pos)?;
        Ok(self.pos)
    }
}

impl Drop for WriteStream {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.finish()
        {
            warn!("Failed to close write stream of {}: {e}", self.alias);
        }
    }
}

/// Shared reader for one cache entry.
pub struct ReadStream {
    storage: Arc<StorageInner>,
    handle: SlotHandle,
    id: u64,
    file: SharedFile,
    len: u64,
    closed: bool,
}

impl ReadStream {
    pub(crate) fn new(
        storage: Arc<StorageInner>,
        handle: SlotHandle,
        id: u64,
        file: SharedFile,
        len: u64,
    ) -> Self {
        Self {
            storage,
            handle,
            id,
            file,
            len,
            closed: false,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.file.lock().take();
        self.storage.release_read(self.handle, self.id);
    }
}

impl Read for ReadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.file.lock();
        guard.as_mut().ok_or_else(closed)?.read(buf)
    }
}

impl Seek for ReadStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut guard = self.file.lock();
        guard.as_mut().ok_or_else(closed)?.seek(pos)
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("len", &self.len)
            .field("closed", &self.closed)
            .finish()
    }
}
