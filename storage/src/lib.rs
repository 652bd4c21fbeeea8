//! Page cache for paginated storage files
//!
//! This crate sits between index/record engines and the files that hold
//! their pages. Reads go through a 2Q read cache, dirty pages are batched
//! into 16-page write groups and written back by a background flusher
//! that stamps checksums and honors write-ahead-log ordering.

pub mod cache;
pub mod config;
pub mod file;
pub mod page;
pub mod wal;

pub use cache::{
    FileId, PageHandle, PageKey, PageVerificationError, ReadWriteDiskCache, Residency,
};
pub use config::CacheConfig;
pub use page::Lsn;
pub use wal::WriteAheadLog;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page {page_index} of file {file_id} not found")]
    PageNotFound { file_id: u64, page_index: u64 },

    #[error("File {0} is not registered")]
    FileNotFound(String),

    #[error("File {0} is already registered")]
    FileExists(String),

    #[error("Invalid file name {0:?}")]
    InvalidFileName(String),

    #[error("File id {0} is not open")]
    FileNotOpen(u64),

    #[error("Page {page_index} of file {file_id} is used by {usages} holders")]
    PageInUse {
        file_id: u64,
        page_index: u64,
        usages: usize,
    },

    #[error("Page {page_index} of file {file_id} was released without being loaded")]
    PageNotPinned { file_id: u64, page_index: u64 },

    #[error("All {cache} cache entries are used, max size {max_size} pages")]
    AllCacheEntriesAreUsed { cache: &'static str, max_size: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write-ahead log error: {0}")]
    Wal(String),

    #[error("Corrupted file: {0}")]
    Corrupted(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StorageError>;
