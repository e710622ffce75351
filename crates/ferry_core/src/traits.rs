use std::io::{self, Read, Seek, Write};

/// An open file handed out by a [`FileSystem`].
pub trait FileHandle: Read + Write + Seek + Send {
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    fn set_len(&mut self, size: u64) -> io::Result<()>;
}

/// The file system a cache lives on. Paths are relative to its root.
pub trait FileSystem: Send + Sync + 'static {
    fn exists(&self, path: &str) -> bool;

    /// Returns `false` if the file could not be removed.
    fn delete(&self, path: &str) -> bool;

    fn open_read(&self, path: &str) -> io::Result<Box<dyn FileHandle>>;

    /// Opens for read/write, creating the file if needed. Existing content
    /// is kept and the position starts at zero.
    fn open_write(&self, path: &str) -> io::Result<Box<dyn FileHandle>>;
}

/// Maps a logical package name to where it can be fetched from.
pub trait UriResolver: Send + Sync + 'static {
    fn uri(&self, name: &str) -> String;

    /// Optional: `User-Agent` header sent with each request.
    fn user_agent(&self) -> Option<String> {
        None
    }
}
