//! The content library: which package owns which logical path.
//!
//! Packages, directories and entries live in slot tables and reference one
//! another by id. The library is built once (by import or by build tooling)
//! and read for the rest of the process.

mod export;
mod info;

pub use export::MANIFEST_VERSION;
pub use info::*;

use crate::digest::ContentDigest;
use crate::error::LibraryError;
use crate::slot::{SlotHandle, SlotTable};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

pub const PATH_SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageKind {
    Bundle,
    Archive,
}

impl PackageKind {
    pub fn tag(&self) -> &'static str {
        match self {
            PackageKind::Bundle => "@bundle",
            PackageKind::Archive => "@archive",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "@bundle" => Some(PackageKind::Bundle),
            "@archive" => Some(PackageKind::Archive),
            _ => None,
        }
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageKind::Bundle => f.write_str("bundle"),
            PackageKind::Archive => f.write_str("archive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageId(SlotHandle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(SlotHandle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectoryId(SlotHandle);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub kind: PackageKind,
    pub digest: ContentDigest,
    /// Direct dependencies, by package name.
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
struct EntryState {
    path: String,
    name: String,
    directory: DirectoryId,
    package: Option<PackageId>,
}

#[derive(Debug, Clone)]
struct DirectoryState {
    name: String,
    parent: Option<DirectoryId>,
}

pub struct ContentLibrary {
    root: DirectoryId,
    directories: SlotTable<DirectoryState>,
    entries: SlotTable<EntryState>,
    packages: SlotTable<PackageInfo>,

    // full path => entry
    entry_map: HashMap<String, EntryId>,
    // package name => package
    package_map: HashMap<String, PackageId>,
    // full directory path => directory, root is ""
    directory_map: HashMap<String, DirectoryId>,
}

impl Default for ContentLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentLibrary {
    pub fn new() -> Self {
        let mut directories = SlotTable::new();
        let root = DirectoryId(directories.add(DirectoryState {
            name: String::new(),
            parent: None,
        }));
        let mut directory_map = HashMap::new();
        directory_map.insert(String::new(), root);

        Self {
            root,
            directories,
            entries: SlotTable::new(),
            packages: SlotTable::new(),
            entry_map: HashMap::new(),
            package_map: HashMap::new(),
            directory_map,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    /// Registers a package. Re-adding a known name keeps the existing one.
    pub fn add_package<I, S>(
        &mut self,
        name: &str,
        kind: PackageKind,
        digest: ContentDigest,
        dependencies: I,
    ) -> PackageId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(id) = self.package_map.get(name) {
            warn!("package already exists {name}");
            return *id;
        }

        let id = PackageId(self.packages.add(PackageInfo {
            name: name.to_string(),
            kind,
            digest,
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }));
        self.package_map.insert(name.to_string(), id);
        id
    }

    /// Registers an entry, creating its directories. Known paths return the
    /// existing entry.
    pub fn add_entry(&mut self, path: &str) -> Result<EntryId, LibraryError> {
        if let Some(id) = self.entry_map.get(path) {
            return Ok(*id);
        }

        let (directory, name) = split_entry_path(path)?;
        let directory = self.ensure_directory(directory)?;
        let id = EntryId(self.entries.add(EntryState {
            path: path.to_string(),
            name: name.to_string(),
            directory,
            package: None,
        }));
        self.entry_map.insert(path.to_string(), id);
        Ok(id)
    }

    pub fn add_package_entry(
        &mut self,
        package: PackageId,
        path: &str,
    ) -> Result<EntryId, LibraryError> {
        let entry = self.add_entry(path)?;
        self.set_entry_package(entry, package);
        Ok(entry)
    }

    /// Moves an entry into `package`. Returns `false` for unknown ids.
    pub fn set_entry_package(&mut self, entry: EntryId, package: PackageId) -> bool {
        if !self.packages.contains(package.0) {
            return false;
        }
        let Some(state) = self.entries.try_get_mut(entry.0) else {
            return false;
        };
        if state.package != Some(package) {
            let from = state
                .package
                .and_then(|p| self.packages.try_get(p.0))
                .map(|p| p.name.as_str())
                .unwrap_or("<none>");
            let to = self
                .packages
                .try_get(package.0)
                .map(|p| p.name.as_str())
                .unwrap_or("<none>");
            debug!("{} changed package {from} => {to}", state.path);
            state.package = Some(package);
        }
        true
    }

    pub fn set_package_digest(&mut self, package: PackageId, digest: ContentDigest) -> bool {
        match self.packages.try_get_mut(package.0) {
            Some(info) => {
                info.digest = digest;
                true
            }
            None => false,
        }
    }

    pub fn package(&self, id: PackageId) -> Option<PackageView<'_>> {
        self.packages
            .contains(id.0)
            .then_some(PackageView { library: self, id })
    }

    pub fn entry(&self, id: EntryId) -> Option<EntryView<'_>> {
        self.entries
            .contains(id.0)
            .then_some(EntryView { library: self, id })
    }

    pub fn directory(&self, id: DirectoryId) -> Option<DirectoryView<'_>> {
        self.directories
            .contains(id.0)
            .then_some(DirectoryView { library: self, id })
    }

    pub fn get_package(&self, name: &str) -> Option<PackageView<'_>> {
        self.package_map.get(name).and_then(|id| self.package(*id))
    }

    pub fn get_entry(&self, path: &str) -> Option<EntryView<'_>> {
        self.entry_map.get(path).and_then(|id| self.entry(*id))
    }

    pub fn get_entry_package(&self, path: &str) -> Option<PackageView<'_>> {
        self.get_entry(path).and_then(|entry| entry.package())
    }

    /// First entry whose basename is `name`.
    pub fn find_entry(&self, name: &str) -> Option<EntryView<'_>> {
        self.entries
            .iter()
            .find(|(_, state)| state.name == name)
            .map(|(handle, _)| EntryView {
                library: self,
                id: EntryId(handle),
            })
    }

    /// Looks up a directory without creating it. Malformed paths miss.
    pub fn get_directory(&self, path: &str) -> Option<DirectoryView<'_>> {
        if let Err(e) = validate_directory_path(path) {
            debug!("{e}");
            return None;
        }
        self.directory_map.get(path).and_then(|id| self.directory(*id))
    }

    pub fn root(&self) -> DirectoryView<'_> {
        DirectoryView {
            library: self,
            id: self.root,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = EntryView<'_>> {
        self.entries.iter().map(move |(handle, _)| EntryView {
            library: self,
            id: EntryId(handle),
        })
    }

    pub fn packages(&self) -> impl Iterator<Item = PackageView<'_>> {
        self.packages.iter().map(move |(handle, _)| PackageView {
            library: self,
            id: PackageId(handle),
        })
    }

    /// Dependencies of `package`, direct or transitive. Unknown dependency
    /// names are skipped.
    pub fn dependencies<const TRANSITIVE: bool>(&self, package: PackageId) -> Vec<PackageId> {
        let mut result = Vec::new();
        let mut seen = HashSet::from([package]);
        let mut pending = vec![package];

        while let Some(current) = pending.pop() {
            let Some(info) = self.packages.try_get(current.0) else {
                continue;
            };
            for name in &info.dependencies {
                let Some(dependency) = self.package_map.get(name).copied() else {
                    warn!("{} depends on unknown package {name}", info.name);
                    continue;
                };
                if seen.insert(dependency) {
                    result.push(dependency);
                    if TRANSITIVE {
                        pending.push(dependency);
                    }
                }
            }
        }
        result
    }

    fn ensure_directory(&mut self, path: &str) -> Result<DirectoryId, LibraryError> {
        if let Some(id) = self.directory_map.get(path) {
            return Ok(*id);
        }
        validate_directory_path(path)?;

        let mut parent = self.root;
        let mut end = 0;
        for segment in path.split(PATH_SEPARATOR) {
            end += segment.len();
            let prefix = &path[..end];
            parent = match self.directory_map.get(prefix) {
                Some(id) => *id,
                None => {
                    let id = DirectoryId(self.directories.add(DirectoryState {
                        name: segment.to_string(),
                        parent: Some(parent),
                    }));
                    self.directory_map.insert(prefix.to_string(), id);
                    id
                }
            };
            end += PATH_SEPARATOR.len_utf8();
        }
        Ok(parent)
    }

    fn directory_path(&self, id: DirectoryId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(directory) = current.and_then(|d| self.directories.try_get(d.0)) {
            if directory.parent.is_some() {
                segments.push(directory.name.as_str());
            }
            current = directory.parent;
        }
        segments.reverse();
        segments.join("/")
    }
}

fn validate_directory_path(path: &str) -> Result<(), LibraryError> {
    if path.is_empty() {
        return Ok(());
    }
    if path.starts_with(PATH_SEPARATOR) {
        return Err(LibraryError::InvalidPath {
            path: path.to_string(),
            reason: "starting with a separator is not allowed",
        });
    }
    if path.split(PATH_SEPARATOR).any(str::is_empty) {
        return Err(LibraryError::InvalidPath {
            path: path.to_string(),
            reason: "empty path segments are not allowed",
        });
    }
    Ok(())
}

/// Splits `a/b/c.txt` into (`a/b`, `c.txt`).
fn split_entry_path(path: &str) -> Result<(&str, &str), LibraryError> {
    if path.is_empty() {
        return Err(LibraryError::InvalidPath {
            path: String::new(),
            reason: "empty path",
        });
    }
    let (directory, name) = match path.rfind(PATH_SEPARATOR) {
        Some(index) => (&path[..index], &path[index + 1..]),
        None => ("", path),
    };
    if name.is_empty() {
        return Err(LibraryError::InvalidPath {
            path: path.to_string(),
            reason: "entry name is empty",
        });
    }
    if path.starts_with(PATH_SEPARATOR) {
        return Err(LibraryError::InvalidPath {
            path: path.to_string(),
            reason: "starting with a separator is not allowed",
        });
    }
    validate_directory_path(directory)?;
    Ok((directory, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Checksum;

    fn sample() -> ContentLibrary {
        let mut library = ContentLibrary::new();
        let base = library.add_package(
            "DefaultPackage",
            PackageKind::Bundle,
            ContentDigest::new(100, Checksum::new(0x1234)),
            Vec::<String>::new(),
        );
        let extra = library.add_package(
            "ExtraPackage",
            PackageKind::Bundle,
            ContentDigest::new(200, Checksum::new(0xBEEF)),
            ["DefaultPackage"],
        );
        for path in [
            "Assets/Config/a.txt",
            "Assets/Config/b.txt",
            "Assets/Config/c.txt",
            "Assets/asset1.txt",
            "Assets/Artworks/b.txt",
            "Assets/Artworks/c.txt",
            "rootfile1.txt",
            "rootfile2.txt",
            "rootfile3.txt",
        ] {
            library.add_package_entry(base, path).unwrap();
        }
        library.add_package_entry(extra, "Assets/asset2.txt").unwrap();
        library.add_package_entry(extra, "Assets/Artworks/a.txt").unwrap();
        library
    }

    #[test]
    fn directories_are_created_on_demand() {
        let library = sample();

        assert_eq!(library.entry_count(), 11);
        assert_eq!(library.root().entries().len(), 3);
        assert_eq!(library.get_directory("Assets").unwrap().entries().len(), 2);
        assert_eq!(library.get_directory("Assets/Config").unwrap().entries().len(), 3);
        assert_eq!(library.get_directory("Assets").unwrap().directories().len(), 2);
        assert!(library.get_directory("Missing").is_none());
        assert_eq!(
            library.get_directory("Assets/Artworks").unwrap().path(),
            "Assets/Artworks"
        );

        let assets = library.root().find_directory("Assets").unwrap();
        let config = assets.find_directory("Config").unwrap();
        assert_eq!(config.parent().unwrap().id(), assets.id());
        assert_eq!(config.find_entry("b.txt").unwrap().path(), "Assets/Config/b.txt");
        assert!(assets.find_entry("b.txt").is_none());
        assert_eq!(library.root().path(), "");
    }

    #[test]
    fn root_directory_of_single_package() {
        let mut library = ContentLibrary::new();
        let p = library.add_package("P", PackageKind::Bundle, ContentDigest::default(), Vec::<String>::new());
        library.add_package_entry(p, "a.txt").unwrap();
        library.add_package_entry(p, "b.txt").unwrap();

        assert_eq!(library.get_directory("").unwrap().entries().len(), 2);
        assert_eq!(library.get_package("P").unwrap().entry_count(), 2);
    }

    #[test]
    fn add_package_is_idempotent() {
        let mut library = ContentLibrary::new();
        let first = library.add_package("P", PackageKind::Bundle, ContentDigest::default(), ["Q"]);
        let second = library.add_package(
            "P",
            PackageKind::Archive,
            ContentDigest::new(1, Checksum::new(1)),
            Vec::<String>::new(),
        );

        assert_eq!(first, second);
        assert_eq!(library.package_count(), 1);
        let package = library.package(first).unwrap();
        assert_eq!(package.kind(), PackageKind::Bundle);
        assert_eq!(package.info().dependencies, vec!["Q".to_string()]);
    }

    #[test]
    fn duplicate_entry_returns_existing() {
        let mut library = ContentLibrary::new();
        let a = library.add_entry("x/y.txt").unwrap();
        let b = library.add_entry("x/y.txt").unwrap();
        assert_eq!(a, b);
        assert_eq!(library.entry_count(), 1);
    }

    #[test]
    fn malformed_paths_are_rejected() {
        let mut library = ContentLibrary::new();
        for path in ["", "/a.txt", "a//b.txt", "a/", "/"] {
            assert!(
                matches!(library.add_entry(path), Err(LibraryError::InvalidPath { .. })),
                "{path} should be rejected"
            );
        }
        assert_eq!(library.entry_count(), 0);
        assert!(library.get_directory("/Assets").is_none());
        assert!(library.get_directory("a//b").is_none());
    }

    #[test]
    fn lookups_by_name_and_path() {
        let library = sample();

        let asset1 = library.find_entry("asset1.txt").unwrap();
        assert_eq!(asset1.path(), "Assets/asset1.txt");
        assert_eq!(asset1.directory().unwrap().name(), "Assets");
        assert_eq!(
            library.find_entry("asset1.txt").unwrap().id(),
            library.get_entry("Assets/asset1.txt").unwrap().id()
        );
        assert_ne!(
            library.find_entry("asset1.txt").unwrap().id(),
            library.find_entry("asset2.txt").unwrap().id()
        );
        assert_eq!(
            library.get_entry_package("Assets/Artworks/a.txt").unwrap().name(),
            "ExtraPackage"
        );
        assert_eq!(library.get_package("ExtraPackage").unwrap().entries().len(), 2);
        assert!(library.get_entry("Assets/none.txt").is_none());
    }

    #[test]
    fn reassigning_entry_package() {
        let mut library = sample();
        let base = library.get_package("DefaultPackage").unwrap().id();
        let entry = library.get_entry("Assets/asset2.txt").unwrap().id();

        assert!(library.set_entry_package(entry, base));
        assert_eq!(library.get_package("ExtraPackage").unwrap().entry_count(), 1);
        assert_eq!(library.get_package("DefaultPackage").unwrap().entry_count(), 10);
    }

    #[test]
    fn direct_and_transitive_dependencies() {
        let mut library = ContentLibrary::new();
        let d = ContentDigest::default();
        let a = library.add_package("A", PackageKind::Bundle, d, ["B"]);
        let b = library.add_package("B", PackageKind::Bundle, d, ["C", "missing"]);
        let c = library.add_package("C", PackageKind::Archive, d, ["A"]);

        assert_eq!(library.dependencies::<false>(a), vec![b]);
        assert_eq!(library.dependencies::<true>(a), vec![b, c]);
        assert_eq!(library.dependencies::<true>(c), vec![a, b]);
    }
}
