//! Line-oriented manifest format.
//!
//! ```text
//! @meta
//! 1
//!
//! @bundle
//! 1024,1A2B,Characters
//! Shared
//! @entries
//! Assets/hero.png
//! @end
//!
//! ```

use super::{ContentLibrary, PackageKind};
use crate::digest::{Checksum, ContentDigest};
use crate::error::LibraryError;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

pub const MANIFEST_VERSION: &str = "1";

const META_TAG: &str = "@meta";
const ENTRIES_TAG: &str = "@entries";
const END_TAG: &str = "@end";

impl ContentLibrary {
    /// Writes every package with its dependencies and entries. Fails if an
    /// entry belongs to no package.
    pub fn export(&self, mut writer: impl Write) -> Result<(), LibraryError> {
        if let Some(orphan) = self.entries().find(|entry| entry.package().is_none()) {
            return Err(LibraryError::OrphanEntry(orphan.path().to_string()));
        }

        writeln!(writer, "{META_TAG}")?;
        writeln!(writer, "{MANIFEST_VERSION}")?;
        writeln!(writer)?;

        for package in self.packages() {
            let info = package.info();
            writeln!(writer, "{}", info.kind.tag())?;
            writeln!(
                writer,
                "{},{},{}",
                info.digest.size, info.digest.checksum, info.name
            )?;
            for dependency in &info.dependencies {
                writeln!(writer, "{dependency}")?;
            }
            writeln!(writer, "{ENTRIES_TAG}")?;
            for entry in package.entries() {
                writeln!(writer, "{}", entry.path())?;
            }
            writeln!(writer, "{END_TAG}")?;
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a manifest into this library. Packages already present are
    /// kept as they are.
    pub fn import(&mut self, reader: impl BufRead) -> Result<(), LibraryError> {
        let mut lines = Lines::new(reader);

        loop {
            match lines.next()? {
                Some(line) if line.trim() == META_TAG => break,
                Some(_) => continue,
                None => {
                    return Err(LibraryError::Malformed {
                        line: lines.number,
                        reason: format!("missing {META_TAG} header"),
                    });
                }
            }
        }

        let version = lines.expect("manifest version")?;
        if version.trim() != MANIFEST_VERSION {
            return Err(LibraryError::UnsupportedVersion(version.trim().to_string()));
        }

        while let Some(line) = lines.next()? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(kind) = PackageKind::from_tag(line) else {
                return Err(LibraryError::Malformed {
                    line: lines.number,
                    reason: format!("unexpected line '{line}'"),
                });
            };
            self.import_package(kind, &mut lines)?;
        }
        Ok(())
    }

    fn import_package<R: BufRead>(
        &mut self,
        kind: PackageKind,
        lines: &mut Lines<R>,
    ) -> Result<(), LibraryError> {
        let header = lines.expect("package header")?;
        let (name, digest) = parse_header(&header).ok_or_else(|| LibraryError::Malformed {
            line: lines.number,
            reason: format!("bad package header '{header}'"),
        })?;

        let mut dependencies = Vec::new();
        loop {
            let line = lines.expect(ENTRIES_TAG)?;
            let line = line.trim();
            if line == ENTRIES_TAG {
                break;
            }
            if !line.is_empty() {
                dependencies.push(line.to_string());
            }
        }

        let package = self.add_package(&name, kind, digest, dependencies);
        loop {
            let line = lines.expect(END_TAG)?;
            let line = line.trim();
            if line == END_TAG {
                break;
            }
            if !line.is_empty() {
                self.add_package_entry(package, line)?;
            }
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LibraryError> {
        let path = path.as_ref();
        let mut library = Self::new();
        library.import(BufReader::new(File::open(path)?))?;
        info!(
            "Loaded manifest {} ({} packages, {} entries)",
            path.display(),
            library.package_count(),
            library.entry_count()
        );
        Ok(library)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LibraryError> {
        self.export(BufWriter::new(File::create(path)?))
    }
}

/// `size,CHECKSUM,name`. The name may itself contain commas.
fn parse_header(line: &str) -> Option<(String, ContentDigest)> {
    let mut parts = line.trim().splitn(3, ',');
    let size = parts.next()?.trim().parse::<u32>().ok()?;
    let checksum = parts.next()?.trim().parse::<Checksum>().ok()?;
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), ContentDigest::new(size, checksum)))
}

struct Lines<R> {
    reader: R,
    number: usize,
}

impl<R: BufRead> Lines<R> {
    fn new(reader: R) -> Self {
        Self { reader, number: 0 }
    }

    fn next(&mut self) -> Result<Option<String>, LibraryError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        self.number += 1;
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    fn expect(&mut self, what: &str) -> Result<String, LibraryError> {
        self.next()?.ok_or_else(|| LibraryError::Malformed {
            line: self.number,
            reason: format!("unexpected end of input, expected {what}"),
        })
    }
}
