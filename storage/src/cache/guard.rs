//! Handles to loaded pages.
//!
//! A handle keeps one usage of its page, so the page is neither evicted
//! nor written back by the periodic pass while the handle lives. Dropping
//! the handle releases it; [`PageHandle::release`] does the same and
//! reports errors.

use super::disk_cache::ReadWriteDiskCache;
use super::pointer::CachePointer;
use super::{FileId, PageKey};
use crate::page::{self, Lsn};
use crate::Result;
use log::error;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLockReadGuard, RwLockWriteGuard,
};
use std::fmt;
use std::sync::Arc;

pub struct PageHandle<'a> {
    cache: &'a ReadWriteDiskCache,
    pointer: Arc<CachePointer>,
    dirty: bool,
    released: bool,
}

impl<'a> PageHandle<'a> {
    pub(super) fn new(cache: &'a ReadWriteDiskCache, pointer: Arc<CachePointer>, dirty: bool) -> Self {
        Self {
            cache,
            pointer,
            dirty,
            released: false,
        }
    }

    pub fn key(&self) -> PageKey {
        self.pointer.key()
    }

    pub fn file_id(&self) -> FileId {
        self.pointer.key().file_id
    }

    pub fn page_index(&self) -> u64 {
        self.pointer.key().page_index
    }

    /// Shared access to the page bytes, header included.
    pub fn read(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.pointer.read(), |buffer| &**buffer)
    }

    /// Exclusive access to the page bytes. Marks the page as changed.
    pub fn write(&mut self) -> MappedRwLockWriteGuard<'_, [u8]> {
        self.dirty = true;
        RwLockWriteGuard::map(self.pointer.write(), |buffer| &mut **buffer)
    }

    /// Queues the page for write on release without touching its bytes.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// LSN of the last log record describing a change of this page.
    pub fn lsn(&self) -> Lsn {
        page::read_lsn(&self.pointer.read())
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        page::write_lsn(&mut self.write(), lsn);
    }

    /// Whether the bytes still belong to the caller that put the page.
    pub fn is_externally_managed(&self) -> bool {
        self.pointer.is_externally_managed()
    }

    pub fn usages(&self) -> usize {
        self.pointer.usages()
    }

    pub(super) fn pointer(&self) -> &Arc<CachePointer> {
        &self.pointer
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.cache.release_pointer(&self.pointer, self.dirty)
    }
}

impl fmt::Debug for PageHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("key", &self.pointer.key())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.cache.release_pointer(&self.pointer, self.dirty) {
            error!("Failed to release page {}: {}", self.pointer.key(), e);
        }
    }
}
