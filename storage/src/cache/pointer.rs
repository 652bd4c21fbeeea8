use super::PageKey;
use crate::page::Lsn;
use crate::{Result, StorageError};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Shared in-memory copy of one page.
///
/// The read cache and the write cache hold it through `Arc`, so the buffer
/// is freed once it has left every list and every handle is gone. `usages`
/// counts callers that loaded the page and have not released it yet; a
/// page with usages is never evicted or flushed by the periodic pass.
#[derive(Debug)]
pub struct CachePointer {
    key: PageKey,
    buffer: RwLock<Box<[u8]>>,
    usages: AtomicUsize,
    // Bumped each time the page is queued for write, lets the flusher tell
    // whether a slot was refilled while it was writing the old bytes.
    version: AtomicU64,
    last_flushed_lsn: Mutex<Option<Lsn>>,
    externally_managed: AtomicBool,
}

impl CachePointer {
    pub fn new(key: PageKey, buffer: Box<[u8]>) -> Self {
        Self {
            key,
            buffer: RwLock::new(buffer),
            usages: AtomicUsize::new(0),
            version: AtomicU64::new(0),
            last_flushed_lsn: Mutex::new(None),
            externally_managed: AtomicBool::new(false),
        }
    }

    /// Wraps a buffer whose contents came from the caller instead of disk.
    pub fn external(key: PageKey, buffer: Box<[u8]>) -> Self {
        let pointer = Self::new(key, buffer);
        pointer.externally_managed.store(true, Ordering::Release);
        pointer
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buffer.read()
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, Box<[u8]>>> {
        self.buffer.try_read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.buffer.write()
    }

    pub fn usages(&self) -> usize {
        self.usages.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) -> usize {
        self.usages.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one usage and returns how many are left.
    pub(crate) fn release(&self) -> Result<usize> {
        self.usages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| StorageError::PageNotPinned {
                file_id: self.key.file_id.0,
                page_index: self.key.page_index,
            })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn last_flushed_lsn(&self) -> Option<Lsn> {
        *self.last_flushed_lsn.lock()
    }

    pub(crate) fn set_last_flushed_lsn(&self, lsn: Lsn) {
        *self.last_flushed_lsn.lock() = Some(lsn);
    }

    pub fn is_externally_managed(&self) -> bool {
        self.externally_managed.load(Ordering::Acquire)
    }

    /// Hands ownership of the contents over to the cache.
    pub fn clear_external_management_flag(&self) {
        self.externally_managed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileId;
    use std::sync::Arc;
    use std::thread;

    fn pointer() -> CachePointer {
        CachePointer::new(PageKey::new(FileId(1), 3), vec![0u8; 64].into_boxed_slice())
    }

    #[test]
    fn test_acquire_release() {
        let p = pointer();
        assert_eq!(p.acquire(), 1);
        assert_eq!(p.acquire(), 2);
        assert_eq!(p.release().unwrap(), 1);
        assert_eq!(p.release().unwrap(), 0);
        assert_eq!(p.usages(), 0);
    }

    #[test]
    fn test_release_without_acquire() {
        let p = pointer();
        assert!(matches!(
            p.release(),
            Err(StorageError::PageNotPinned {
                file_id: 1,
                page_index: 3
            })
        ));
        // The counter must not wrap around
        assert_eq!(p.usages(), 0);
    }

    #[test]
    fn test_concurrent_usages_balance() {
        let p = Arc::new(pointer());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&p);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        p.acquire();
                        p.release().unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(p.usages(), 0);
    }

    #[test]
    fn test_external_flag() {
        let p = CachePointer::external(
            PageKey::new(FileId(1), 0),
            vec![1u8; 16].into_boxed_slice(),
        );
        assert!(p.is_externally_managed());
        p.clear_external_management_flag();
        assert!(!p.is_externally_managed());
    }

    #[test]
    fn test_write_then_read() {
        let p = pointer();
        p.write()[10] = 5;
        assert_eq!(p.read()[10], 5);
        assert!(p.try_read().is_some());

        let _writer = p.write();
        assert!(p.try_read().is_none());
    }
}
