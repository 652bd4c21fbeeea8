//! Read and write caches
//!
//! [`ReadWriteDiskCache`] is the entry point. It owns the 2Q read cache
//! state, the write-back cache with its flush worker, and the file registry.

mod disk_cache;
mod entry;
mod flush;
mod guard;
pub mod lru;
mod pointer;
mod read_cache;
pub mod sizing;
mod write_cache;

pub use crate::file::FileId;
pub use disk_cache::{PageVerificationError, ReadWriteDiskCache};
pub use entry::CacheEntry;
pub use guard::PageHandle;
pub use pointer::CachePointer;
pub use read_cache::{Residency, TwoQueue};

use std::fmt;

/// Number of pages in one write group.
pub const WRITE_GROUP_SIZE: usize = 16;

const GROUP_SHIFT: u32 = 4;

/// Identity of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub file_id: FileId,
    pub page_index: u64,
}

impl PageKey {
    pub const fn new(file_id: FileId, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }

    pub(crate) fn group_key(&self) -> GroupKey {
        GroupKey {
            file_id: self.file_id,
            group_index: self.page_index >> GROUP_SHIFT,
        }
    }

    /// Slot of the page inside its write group.
    pub(crate) fn group_slot(&self) -> usize {
        (self.page_index & (WRITE_GROUP_SIZE as u64 - 1)) as usize
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_index)
    }
}

/// Identity of a write group: the file and `page_index / 16`.
///
/// Ordered by file first, so the groups of one file form a contiguous range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct GroupKey {
    pub file_id: FileId,
    pub group_index: u64,
}

impl GroupKey {
    pub fn first_of(file_id: FileId) -> Self {
        Self {
            file_id,
            group_index: 0,
        }
    }

    pub fn last_of(file_id: FileId) -> Self {
        Self {
            file_id,
            group_index: u64::MAX,
        }
    }

    pub fn page_key(&self, slot: usize) -> PageKey {
        PageKey::new(self.file_id, (self.group_index << GROUP_SHIFT) + slot as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_mapping() {
        let key = PageKey::new(FileId(3), 37);
        let group = key.group_key();
        assert_eq!(group.group_index, 2);
        assert_eq!(key.group_slot(), 5);
        assert_eq!(group.page_key(key.group_slot()), key);
    }

    #[test]
    fn test_group_order_is_by_file() {
        let a = PageKey::new(FileId(1), 1_000_000).group_key();
        let b = PageKey::new(FileId(2), 0).group_key();
        assert!(a < b);
        assert!(GroupKey::first_of(FileId(2)) <= b && b <= GroupKey::last_of(FileId(2)));
    }
}
