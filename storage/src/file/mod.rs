// storage/src/file/mod.rs

mod registry;

pub use registry::{FileId, FileRegistry, NAME_ID_MAP};

use crate::{Result, StorageError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic number to identify page files
const FILE_MAGIC: [u8; 4] = *b"PGC1";

const FILE_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct FileHeader {
    // Core identification (16 bytes)
    magic: [u8; 4],   // "PGC1"
    version: u32,     // File format version
    header_size: u32, // Size of this header (512)
    page_size: u32,   // Page size this file was created with

    // State (8 bytes)
    softly_closed: u32, // 1 when the last close flushed everything
    _flags: u32,

    // Timestamps (16 bytes)
    created_at: u64,
    last_modified: u64,

    // Integrity (4 bytes)
    header_checksum: u32, // CRC32 of header
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

impl FileHeader {
    fn new(page_size: usize) -> Self {
        let now = now_secs();

        Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            header_size: HEADER_SIZE as u32,
            page_size: page_size as u32,

            softly_closed: 0,
            _flags: 0,

            created_at: now,
            last_modified: now,

            header_checksum: 0,
        }
    }

    fn validate(&self, page_size: usize) -> Result<()> {
        if self.magic != FILE_MAGIC {
            return Err(StorageError::Corrupted(
                "invalid page file: wrong magic number".to_string(),
            ));
        }

        if self.version > FILE_VERSION {
            return Err(StorageError::Corrupted(format!(
                "unsupported file version: {}",
                self.version
            )));
        }

        if self.page_size as usize != page_size {
            return Err(StorageError::Corrupted(format!(
                "invalid page size: expected {}, got {}",
                page_size, self.page_size
            )));
        }

        Ok(())
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.header_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.page_size.to_le_bytes());

        bytes[16..20].copy_from_slice(&self.softly_closed.to_le_bytes());
        bytes[20..24].copy_from_slice(&self._flags.to_le_bytes());

        bytes[24..32].copy_from_slice(&self.created_at.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.last_modified.to_le_bytes());

        bytes[40..44].copy_from_slice(&self.header_checksum.to_le_bytes());

        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StorageError::Corrupted(
                "invalid file header size".to_string(),
            ));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);

        Ok(Self {
            magic,
            version: le_u32(bytes, 4),
            header_size: le_u32(bytes, 8),
            page_size: le_u32(bytes, 12),

            softly_closed: le_u32(bytes, 16),
            _flags: le_u32(bytes, 20),

            created_at: le_u64(bytes, 24),
            last_modified: le_u64(bytes, 32),

            header_checksum: le_u32(bytes, 40),
        })
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[0..40]); // Hash everything before checksum field
        hasher.update(&bytes[44..]); // Hash everything after checksum field
        hasher.finalize()
    }

    fn update_checksum(&mut self) {
        self.header_checksum = self.compute_checksum();
    }

    fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.header_checksum
    }
}

/// A single backing file holding fixed-size pages after a 512 byte header.
///
/// Page `i` lives at `HEADER_SIZE + i * page_size`. The number of pages is
/// derived from the file length, so a page exists once the file has been
/// extended past it.
pub struct PageFile {
    file: File,
    path: PathBuf,
    header: FileHeader,
    page_size: usize,
    page_count: u64,
}

impl PageFile {
    pub fn create_new(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(StorageError::Io)?;

        let mut page_file = Self {
            file,
            path: path.to_path_buf(),
            header: FileHeader::new(page_size),
            page_size,
            page_count: 0,
        };

        page_file.write_header()?;

        Ok(page_file)
    }

    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(StorageError::Io)?;

        let header = Self::read_header(&mut file, page_size)?;
        let len = file.metadata().map_err(StorageError::Io)?.len();
        let page_count = len.saturating_sub(HEADER_SIZE as u64) / page_size as u64;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
            page_size,
            page_count,
        })
    }

    pub fn open_or_create(path: &Path, page_size: usize) -> Result<Self> {
        if path.exists() {
            Self::open(path, page_size)
        } else {
            Self::create_new(path, page_size)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of a page, an error when it does not fit a `u64`.
    fn offset(&self, page_index: u64) -> Result<u64> {
        page_index
            .checked_mul(self.page_size as u64)
            .and_then(|bytes| bytes.checked_add(HEADER_SIZE as u64))
            .ok_or_else(|| {
                StorageError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "page {} of {} is out of addressable range",
                        page_index,
                        self.path.display()
                    ),
                ))
            })
    }

    /// Reads page `page_index` into `buffer`, which must be one page long.
    pub fn read_page(&mut self, page_index: u64, buffer: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buffer.len(), self.page_size);

        if page_index >= self.page_count {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "page {} is past the end of {} ({} pages)",
                    page_index,
                    self.path.display(),
                    self.page_count
                ),
            )));
        }

        let offset = self.offset(page_index)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(StorageError::Io)?;
        self.file.read_exact(buffer).map_err(StorageError::Io)?;

        Ok(())
    }

    /// Writes one page, growing the file when the page lies past its end.
    pub fn write_page(&mut self, page_index: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.page_size);

        let offset = self.offset(page_index)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(StorageError::Io)?;
        self.file.write_all(data).map_err(StorageError::Io)?;

        if page_index >= self.page_count {
            self.page_count = page_index + 1;
        }

        Ok(())
    }

    /// Makes sure the file is at least `page_count` pages long.
    ///
    /// New pages read back as zeroes.
    pub fn allocate(&mut self, page_count: u64) -> Result<()> {
        if page_count <= self.page_count {
            return Ok(());
        }

        self.file
            .set_len(self.offset(page_count)?)
            .map_err(StorageError::Io)?;
        self.page_count = page_count;

        Ok(())
    }

    /// Number of pages the file holds.
    pub fn filled_up_to(&self) -> u64 {
        self.page_count
    }

    /// Cuts the file down to `page_count` pages.
    pub fn shrink(&mut self, page_count: u64) -> Result<()> {
        if page_count >= self.page_count {
            return Ok(());
        }

        self.file
            .set_len(self.offset(page_count)?)
            .map_err(StorageError::Io)?;
        self.page_count = page_count;

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(StorageError::Io)
    }

    pub fn was_softly_closed(&self) -> bool {
        self.header.softly_closed != 0
    }

    pub fn set_softly_closed(&mut self, softly_closed: bool) -> Result<()> {
        self.header.softly_closed = u32::from(softly_closed);
        self.header.last_modified = now_secs();
        self.write_header()?;
        self.sync()
    }

    pub fn rename(&mut self, new_path: &Path) -> Result<()> {
        fs::rename(&self.path, new_path).map_err(StorageError::Io)?;
        self.path = new_path.to_path_buf();
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        self.header.update_checksum();

        let header_bytes = self.header.to_bytes();

        self.file
            .seek(SeekFrom::Start(0))
            .map_err(StorageError::Io)?;
        self.file
            .write_all(&header_bytes)
            .map_err(StorageError::Io)?;

        Ok(())
    }

    fn read_header(file: &mut File, page_size: usize) -> Result<FileHeader> {
        file.seek(SeekFrom::Start(0)).map_err(StorageError::Io)?;

        let mut buffer = [0u8; HEADER_SIZE];
        file.read_exact(&mut buffer).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                StorageError::Corrupted("file is shorter than its header".to_string())
            }
            _ => StorageError::Io(e),
        })?;

        let header = FileHeader::from_bytes(&buffer)?;

        if !header.verify_checksum() {
            return Err(StorageError::Corrupted(
                "file header checksum mismatch".to_string(),
            ));
        }

        header.validate(page_size)?;

        Ok(header)
    }
}
