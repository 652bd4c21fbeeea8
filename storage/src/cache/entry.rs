use super::lru::ListEntry;
use super::pointer::CachePointer;
use super::PageKey;
use std::sync::Arc;

/// Read cache bookkeeping for one page.
///
/// Entries in `A1out` are ghosts: the key is kept, the data is not.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: PageKey,
    pointer: Option<Arc<CachePointer>>,
    pub(crate) dirty: bool,
}

impl CacheEntry {
    pub fn new(key: PageKey, pointer: Arc<CachePointer>, dirty: bool) -> Self {
        Self {
            key,
            pointer: Some(pointer),
            dirty,
        }
    }

    pub fn pointer(&self) -> Option<&Arc<CachePointer>> {
        self.pointer.as_ref()
    }

    /// Drops the data, keeping only the key.
    pub fn into_ghost(self) -> Self {
        debug_assert!(!self.dirty, "dirty page {:?} turned into a ghost", self.key);
        Self {
            key: self.key,
            pointer: None,
            dirty: false,
        }
    }
}

impl ListEntry for CacheEntry {
    fn key(&self) -> PageKey {
        self.key
    }

    fn usages(&self) -> usize {
        self.pointer.as_ref().map_or(0, |p| p.usages())
    }
}
