use super::{ContentLibrary, DirectoryId, EntryId, PackageId, PackageInfo, PackageKind};
use crate::digest::ContentDigest;

/// Borrowed view of a registered package.
#[derive(Clone, Copy)]
pub struct PackageView<'a> {
    pub(super) library: &'a ContentLibrary,
    pub(super) id: PackageId,
}

impl<'a> PackageView<'a> {
    pub fn id(&self) -> PackageId {
        self.id
    }

    pub fn info(&self) -> &'a PackageInfo {
        // Views are only built for live ids and the library is borrowed.
        &self.library.packages[self.id.0]
    }

    pub fn name(&self) -> &'a str {
        &self.info().name
    }

    pub fn kind(&self) -> PackageKind {
        self.info().kind
    }

    pub fn digest(&self) -> ContentDigest {
        self.info().digest
    }

    pub fn entries(&self) -> Vec<EntryView<'a>> {
        let library = self.library;
        let id = self.id;
        library
            .entries
            .iter()
            .filter(|(_, state)| state.package == Some(id))
            .map(|(handle, _)| EntryView {
                library,
                id: EntryId(handle),
            })
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.library
            .entries
            .iter()
            .filter(|(_, state)| state.package == Some(self.id))
            .count()
    }
}

impl std::fmt::Debug for PackageView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageView")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("digest", &self.digest())
            .finish()
    }
}

#[derive(Clone, Copy)]
pub struct EntryView<'a> {
    pub(super) library: &'a ContentLibrary,
    pub(super) id: EntryId,
}

impl<'a> EntryView<'a> {
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Full path, e.g. `Assets/Config/a.txt`.
    pub fn path(&self) -> &'a str {
        &self.library.entries[self.id.0].path
    }

    /// Basename, e.g. `a.txt`.
    pub fn name(&self) -> &'a str {
        &self.library.entries[self.id.0].name
    }

    pub fn package(&self) -> Option<PackageView<'a>> {
        self.library.entries[self.id.0]
            .package
            .and_then(|id| self.library.package(id))
    }

    pub fn directory(&self) -> Option<DirectoryView<'a>> {
        self.library
            .directory(self.library.entries[self.id.0].directory)
    }
}

impl std::fmt::Debug for EntryView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryView").field("path", &self.path()).finish()
    }
}

#[derive(Clone, Copy)]
pub struct DirectoryView<'a> {
    pub(super) library: &'a ContentLibrary,
    pub(super) id: DirectoryId,
}

impl<'a> DirectoryView<'a> {
    pub fn id(&self) -> DirectoryId {
        self.id
    }

    /// Last path segment. Empty for the root.
    pub fn name(&self) -> &'a str {
        &self.library.directories[self.id.0].name
    }

    pub fn path(&self) -> String {
        self.library.directory_path(self.id)
    }

    pub fn parent(&self) -> Option<DirectoryView<'a>> {
        self.library.directories[self.id.0]
            .parent
            .and_then(|id| self.library.directory(id))
    }

    /// Entries placed directly in this directory.
    pub fn entries(&self) -> Vec<EntryView<'a>> {
        let library = self.library;
        let id = self.id;
        library
            .entries
            .iter()
            .filter(|(_, state)| state.directory == id)
            .map(|(handle, _)| EntryView {
                library,
                id: EntryId(handle),
            })
            .collect()
    }

    /// Immediate subdirectories.
    pub fn directories(&self) -> Vec<DirectoryView<'a>> {
        let library = self.library;
        let id = self.id;
        library
            .directories
            .iter()
            .filter(|(_, state)| state.parent == Some(id))
            .map(|(handle, _)| DirectoryView {
                library,
                id: DirectoryId(handle),
            })
            .collect()
    }

    pub fn find_entry(&self, name: &str) -> Option<EntryView<'a>> {
        self.entries().into_iter().find(|entry| entry.name() == name)
    }

    pub fn find_directory(&self, name: &str) -> Option<DirectoryView<'a>> {
        self.directories()
            .into_iter()
            .find(|directory| directory.name() == name)
    }
}

impl std::fmt::Debug for DirectoryView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryView")
            .field("path", &self.path())
            .finish()
    }
}
