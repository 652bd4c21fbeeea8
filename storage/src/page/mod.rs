//! On-disk page header
//!
//! Every page written by the cache starts with a 20 byte header:
//!
//! ```text
//! [0..8)   magic number (u64, little endian)
//! [8..12)  CRC32 of bytes [12..page_size)
//! [12..16) WAL segment of the last change
//! [16..20) WAL position of the last change
//! ```
//!
//! Everything after the header belongs to the collaborator that owns the page.

use std::fmt;

/// Magic number stamped at the start of every flushed page.
pub const MAGIC_NUMBER: u64 = 0xFACB_03FE;

pub const MAGIC_OFFSET: usize = 0;
pub const CRC_OFFSET: usize = 8;
pub const LSN_OFFSET: usize = 12;
pub const PAGE_HEADER_SIZE: usize = 20;

/// Position of a record in the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Lsn {
    pub segment: u32,
    pub position: u32,
}

impl Lsn {
    pub const fn new(segment: u32, position: u32) -> Self {
        Self { segment, position }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.position)
    }
}

fn read_u32(page: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&page[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(page: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&page[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Reads the LSN of the last change recorded in the page header.
pub fn read_lsn(page: &[u8]) -> Lsn {
    Lsn {
        segment: read_u32(page, LSN_OFFSET),
        position: read_u32(page, LSN_OFFSET + 4),
    }
}

/// Records the LSN of a change in the page header.
///
/// Collaborators call this after logging a change to the page so the
/// flusher knows how far the WAL must be durable before the page may hit disk.
pub fn write_lsn(page: &mut [u8], lsn: Lsn) {
    page[LSN_OFFSET..LSN_OFFSET + 4].copy_from_slice(&lsn.segment.to_le_bytes());
    page[LSN_OFFSET + 4..PAGE_HEADER_SIZE].copy_from_slice(&lsn.position.to_le_bytes());
}

pub fn read_magic(page: &[u8]) -> u64 {
    read_u64(page, MAGIC_OFFSET)
}

pub fn read_crc(page: &[u8]) -> u32 {
    read_u32(page, CRC_OFFSET)
}

/// CRC32 over everything after the checksum field, LSN included.
pub fn compute_crc(page: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[LSN_OFFSET..]);
    hasher.finalize()
}

/// Writes the magic number and the payload checksum into the page header.
pub fn stamp(page: &mut [u8]) {
    page[MAGIC_OFFSET..CRC_OFFSET].copy_from_slice(&MAGIC_NUMBER.to_le_bytes());
    let crc = compute_crc(page);
    page[CRC_OFFSET..LSN_OFFSET].copy_from_slice(&crc.to_le_bytes());
}

/// Result of checking a stored page against its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCheck {
    pub magic_ok: bool,
    pub checksum_ok: bool,
}

impl PageCheck {
    pub fn is_valid(&self) -> bool {
        self.magic_ok && self.checksum_ok
    }
}

pub fn verify(page: &[u8]) -> PageCheck {
    PageCheck {
        magic_ok: read_magic(page) == MAGIC_NUMBER,
        checksum_ok: read_crc(page) == compute_crc(page),
    }
}

/// A page that was never flushed by the cache is all zeroes.
pub fn is_blank(page: &[u8]) -> bool {
    page.iter().all(|b| *b == 0)
}
