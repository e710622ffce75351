use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

const POLYNOMIAL: u16 = 0xA001;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut value = 0u16;
        let mut temp = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if (value ^ temp) & 0x0001 != 0 {
                value = (value >> 1) ^ POLYNOMIAL;
            } else {
                value >>= 1;
            }
            temp >>= 1;
            bit += 1;
        }
        table[i] = value;
        i += 1;
    }
    table
}

/// Reflected CRC-16 (polynomial `0xA001`, zero seed) over raw bytes.
///
/// Rendered as four uppercase hex digits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(u16);

impl Checksum {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u16 {
        self.0
    }

    pub fn of(bytes: &[u8]) -> Self {
        Self::default().update(bytes)
    }

    /// Folds `bytes` into the running checksum.
    #[must_use]
    pub fn update(self, bytes: &[u8]) -> Self {
        let mut crc = self.0;
        for &byte in bytes {
            let index = (crc ^ byte as u16) as u8;
            crc = (crc >> 8) ^ TABLE[index as usize];
        }
        Self(crc)
    }

    /// Checksums everything `reader` yields, returning the byte count too.
    pub fn from_reader(mut reader: impl Read) -> std::io::Result<(Self, u64)> {
        let mut buffer = [0u8; 4096];
        let mut checksum = Self::default();
        let mut total = 0u64;
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            checksum = checksum.update(&buffer[..read]);
            total += read as u64;
        }
        Ok((checksum, total))
    }
}

impl From<u16> for Checksum {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid checksum: {0}")]
pub struct ParseChecksumError(String);

impl FromStr for Checksum {
    type Err = ParseChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u16::from_str_radix(s.trim(), 16)
            .map(Self)
            .map_err(|_| ParseChecksumError(s.to_string()))
    }
}

/// Byte-exact identity of a stored blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest {
    pub size: u32,
    pub checksum: Checksum,
}

impl ContentDigest {
    pub const fn new(size: u32, checksum: Checksum) -> Self {
        Self { size, checksum }
    }

    pub fn of(bytes: &[u8]) -> Self {
        Self::new(bytes.len() as u32, Checksum::of(bytes))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.size, self.checksum)
    }
}
