//! # Ferry FileSystem
//!
//! The operating system backed [`FileSystem`] used by the local cache.
//! Every path handed to it is relative to a root directory.
//!
//! ## Usage
//!
//! ```no_run
//! use ferry_fs::OsFileSystem;
//!
//! let fs = OsFileSystem::new("./ferry_cache");
//! ```

use ferry_core::prelude::*;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct OsFileSystem {
    root: PathBuf,
}

impl OsFileSystem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { root: path.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn get_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl FileSystem for OsFileSystem {
    fn exists(&self, path: &str) -> bool {
        self.get_path(path).is_file()
    }

    fn delete(&self, path: &str) -> bool {
        let path = self.get_path(path);
        match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!("Failed to delete {}: {e}", path.display());
                false
            }
        }
    }

    fn open_read(&self, path: &str) -> io::Result<Box<dyn FileHandle>> {
        let file = File::open(self.get_path(path))?;
        Ok(Box::new(OsFile { file }))
    }

    fn open_write(&self, path: &str) -> io::Result<Box<dyn FileHandle>> {
        let path = self.get_path(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Box::new(OsFile { file }))
    }
}

/// A [`File`] exposed as a [`FileHandle`].
#[derive(Debug)]
pub struct OsFile {
    file: File,
}

impl Read for OsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for OsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for OsFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl FileHandle for OsFile {
    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFileSystem::new(dir.path());

        {
            let mut file = fs.open_write("nested/a.pak").unwrap();
            file.write_all(b"hello world").unwrap();
        }
        assert!(fs.exists("nested/a.pak"));

        let mut file = fs.open_write("nested/a.pak").unwrap();
        assert_eq!(file.len().unwrap(), 11);
        assert_eq!(file.stream_position().unwrap(), 0);
        file.write_all(b"HELLO").unwrap();
        drop(file);

        let mut text = String::new();
        fs.open_read("nested/a.pak")
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "HELLO world");
    }

    #[test]
    fn set_len_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFileSystem::new(dir.path());

        let mut file = fs.open_write("b.pak").unwrap();
        file.write_all(&[7; 64]).unwrap();
        file.set_len(10).unwrap();
        assert_eq!(file.len().unwrap(), 10);
        assert!(!file.is_empty().unwrap());
    }

    #[test]
    fn delete_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFileSystem::new(dir.path());

        assert!(!fs.exists("c.pak"));
        assert!(fs.open_read("c.pak").is_err());
        fs.open_write("c.pak").unwrap();
        assert!(fs.delete("c.pak"));
        assert!(!fs.exists("c.pak"));
        assert!(fs.delete("c.pak"));
    }
}
