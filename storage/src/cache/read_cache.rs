//! 2Q admission and eviction.
//!
//! A first access lands in `A1in`. When `A1in` is over its quota its LRU
//! page is evicted into `A1out`, which only remembers the key. A page that
//! comes back while its key is still in `A1out` has proven reuse and goes
//! straight into `Am`. Repeated hits inside `A1in` do not promote, so one
//! long scan cannot flush out the hot set.
//!
//! This type only keeps the bookkeeping. Reading pages and locking is done
//! by [`ReadWriteDiskCache`](super::ReadWriteDiskCache).

use super::entry::CacheEntry;
use super::lru::{EvictionList, ListEntry, LruList};
use super::pointer::CachePointer;
use super::sizing::{Backpressure, QueueSizing};
use super::{FileId, PageKey};
use crate::{Result, StorageError};
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Where a page currently sits in the read cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Pinned pages are never evicted.
    Pinned,
    Am,
    A1In,
    /// Evicted, only the key is remembered.
    A1Out,
}

pub struct TwoQueue<L = LruList<CacheEntry>> {
    am: L,
    a1in: L,
    a1out: L,
    pinned: HashMap<PageKey, CacheEntry>,
    // Every key held by any of the lists above, ghosts included.
    file_pages: HashMap<FileId, HashSet<u64>>,
    sizing: QueueSizing,
    backpressure: Backpressure,
    percent_of_pinned_pages: usize,
}

impl<L: EvictionList<CacheEntry> + Default> TwoQueue<L> {
    pub fn new(max_size: usize, backpressure: Backpressure, percent_of_pinned_pages: usize) -> Self {
        Self {
            am: L::default(),
            a1in: L::default(),
            a1out: L::default(),
            pinned: HashMap::new(),
            file_pages: HashMap::new(),
            sizing: QueueSizing::new(max_size),
            backpressure,
            percent_of_pinned_pages,
        }
    }

    pub fn max_size(&self) -> usize {
        self.sizing.max_size()
    }

    /// Pages holding data, ghosts excluded.
    pub fn resident_len(&self) -> usize {
        self.am.len() + self.a1in.len() + self.pinned.len()
    }

    pub fn residency(&self, key: &PageKey) -> Option<Residency> {
        if self.pinned.contains_key(key) {
            Some(Residency::Pinned)
        } else if self.am.contains(key) {
            Some(Residency::Am)
        } else if self.a1in.contains(key) {
            Some(Residency::A1In)
        } else if self.a1out.contains(key) {
            Some(Residency::A1Out)
        } else {
            None
        }
    }

    fn entry(&self, key: &PageKey) -> Option<&CacheEntry> {
        self.pinned
            .get(key)
            .or_else(|| self.am.get(key))
            .or_else(|| self.a1in.get(key))
    }

    /// Cached page without touching list order.
    pub fn peek(&self, key: &PageKey) -> Option<&Arc<CachePointer>> {
        self.entry(key).and_then(|e| e.pointer())
    }

    fn entry_mut(&mut self, key: &PageKey) -> Option<&mut CacheEntry> {
        if self.pinned.contains_key(key) {
            return self.pinned.get_mut(key);
        }
        if self.am.contains(key) {
            return self.am.get_mut(key);
        }
        self.a1in.get_mut(key)
    }

    /// Serves a hit on a page that holds data.
    ///
    /// A hit in `Am` moves the page to the MRU end, a hit in `A1in` leaves
    /// it where it is.
    pub fn touch(&mut self, key: &PageKey) -> Option<Arc<CachePointer>> {
        if let Some(entry) = self.pinned.get(key) {
            return entry.pointer().cloned();
        }

        if let Some(entry) = self.am.get(key).cloned() {
            let pointer = entry.pointer().cloned();
            self.am.put_to_mru(entry);
            return pointer;
        }

        self.a1in.get(key).and_then(|e| e.pointer().cloned())
    }

    /// Makes room for the missing page `key`, returns whether it comes back
    /// from `A1out` and so belongs in `Am`.
    ///
    /// The ghost is only dropped once there is room, a failed call leaves
    /// the next access still counting as a second one.
    pub fn make_room_for(&mut self, key: &PageKey) -> Result<bool> {
        let promoted = self.a1out.contains(key);
        self.make_room()?;
        if promoted {
            self.a1out.remove(key)?;
        }
        Ok(promoted)
    }

    /// Evicts until there is room for one more page.
    ///
    /// When nothing can be evicted the budget grows or the call fails,
    /// depending on the backpressure policy.
    pub fn make_room(&mut self) -> Result<()> {
        while self.resident_len() >= self.sizing.max_size() {
            if !self.evict_one() {
                let grown = self.backpressure.relieve("read", self.sizing.max_size())?;
                self.sizing.set_max_size(grown);
            }
        }
        Ok(())
    }

    /// Adds a freshly loaded page, into `Am` when it came back from `A1out`.
    pub fn admit(&mut self, key: PageKey, pointer: Arc<CachePointer>, promoted: bool) {
        self.file_pages
            .entry(key.file_id)
            .or_default()
            .insert(key.page_index);

        let entry = CacheEntry::new(key, pointer, false);
        if promoted {
            self.am.put_to_mru(entry);
        } else {
            self.a1in.put_to_mru(entry);
        }
    }

    fn evict_one(&mut self) -> bool {
        if self.a1in.len() > self.sizing.k_in() {
            self.evict_from_a1in() || self.evict_from_am()
        } else {
            self.evict_from_am() || self.evict_from_a1in()
        }
    }

    fn evict_from_a1in(&mut self) -> bool {
        let entry = match self.a1in.remove_lru() {
            Some(entry) => entry,
            None => return false,
        };

        self.a1out.put_to_mru(entry.into_ghost());
        self.trim_ghosts();
        true
    }

    fn trim_ghosts(&mut self) {
        while self.a1out.len() > self.sizing.k_out() {
            match self.a1out.remove_lru() {
                Some(ghost) => self.forget_key(&ghost.key()),
                None => break,
            }
        }
    }

    fn evict_from_am(&mut self) -> bool {
        match self.am.remove_lru() {
            Some(entry) => {
                self.forget_key(&entry.key());
                true
            }
            None => false,
        }
    }

    fn forget_key(&mut self, key: &PageKey) {
        if let Some(pages) = self.file_pages.get_mut(&key.file_id) {
            pages.remove(&key.page_index);
            if pages.is_empty() {
                self.file_pages.remove(&key.file_id);
            }
        }
    }

    /// Drops one usage of `pointer`.
    ///
    /// Returns the page when it has to go to the write cache: it was
    /// changed by one of its holders and this was the last usage.
    pub fn release(
        &mut self,
        pointer: &Arc<CachePointer>,
        dirty: bool,
    ) -> Result<Option<Arc<CachePointer>>> {
        let key = pointer.key();
        let usages = pointer.release()?;

        match self.entry_mut(&key) {
            Some(entry) => {
                entry.dirty |= dirty;
                if usages == 0 && entry.dirty {
                    entry.dirty = false;
                    return Ok(Some(Arc::clone(pointer)));
                }
                Ok(None)
            }
            None if usages == 0 && dirty => Ok(Some(Arc::clone(pointer))),
            None => Ok(None),
        }
    }

    /// Moves a resident page out of the eviction lists for good.
    ///
    /// Returns `false` without pinning when the pinned share of the cache
    /// is used up or the page is not resident.
    pub fn pin(&mut self, key: &PageKey) -> Result<bool> {
        if self.pinned.contains_key(key) {
            return Ok(true);
        }

        let limit = self.sizing.max_size() * self.percent_of_pinned_pages / 100;
        if self.pinned.len() >= limit {
            warn!(
                "Maximum amount of pinned pages ({}) is reached, page {} stays evictable",
                limit, key
            );
            return Ok(false);
        }

        let entry = if self.am.contains(key) {
            self.am.remove(key)?
        } else {
            self.a1in.remove(key)?
        };

        match entry {
            Some(entry) => {
                self.pinned.insert(*key, entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Forgets every page of `file_id`, ghosts included.
    ///
    /// Fails without touching anything if one of them is in use.
    pub fn remove_file_pages(&mut self, file_id: FileId) -> Result<()> {
        let pages: Vec<u64> = match self.file_pages.get(&file_id) {
            Some(pages) => pages.iter().copied().collect(),
            None => return Ok(()),
        };

        for page_index in &pages {
            let key = PageKey::new(file_id, *page_index);
            if let Some(entry) = self.entry(&key) {
                let usages = entry.usages();
                if usages > 0 {
                    return Err(StorageError::PageInUse {
                        file_id: file_id.0,
                        page_index: *page_index,
                        usages,
                    });
                }
            }
        }

        for page_index in pages {
            let key = PageKey::new(file_id, page_index);
            self.pinned.remove(&key);
            self.am.remove(&key)?;
            self.a1in.remove(&key)?;
            self.a1out.remove(&key)?;
        }
        self.file_pages.remove(&file_id);

        Ok(())
    }

    pub fn has_file_pages(&self, file_id: FileId) -> bool {
        self.file_pages.contains_key(&file_id)
    }

    /// Changes the budget, evicting what no longer fits.
    pub fn set_max_size(&mut self, max_size: usize) -> Result<()> {
        if !self.pinned.is_empty() {
            let required = if self.percent_of_pinned_pages == 0 {
                usize::MAX
            } else {
                self.pinned.len() * 100 / self.percent_of_pinned_pages
            };
            if max_size < required {
                return Err(StorageError::InvalidConfig(format!(
                    "cannot shrink read cache to {} pages, {} pinned pages need at least {}",
                    max_size,
                    self.pinned.len(),
                    required
                )));
            }
        }

        let old = self.sizing.max_size();
        self.sizing.set_max_size(max_size);

        while self.resident_len() > max_size {
            if !self.evict_one() {
                warn!(
                    "Read cache holds {} used pages, above the new max size of {}",
                    self.resident_len(),
                    max_size
                );
                break;
            }
        }
        self.trim_ghosts();

        info!("Read cache max size changed from {} to {} pages", old, max_size);
        Ok(())
    }

    /// Empties every list. Fails if a page is still in use.
    pub fn clear(&mut self) -> Result<()> {
        let used = self
            .pinned
            .values()
            .chain(self.am.iter())
            .chain(self.a1in.iter())
            .find(|e| e.usages() > 0);
        if let Some(entry) = used {
            let key = entry.key();
            return Err(StorageError::PageInUse {
                file_id: key.file_id.0,
                page_index: key.page_index,
                usages: entry.usages(),
            });
        }

        self.am = L::default();
        self.a1in = L::default();
        self.a1out = L::default();
        self.pinned.clear();
        self.file_pages.clear();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pages_in(&self, residency: Residency) -> Vec<u64> {
        let list = match residency {
            Residency::Am => &self.am,
            Residency::A1In => &self.a1in,
            Residency::A1Out => &self.a1out,
            Residency::Pinned => {
                let mut pages: Vec<u64> = self.pinned.keys().map(|k| k.page_index).collect();
                pages.sort_unstable();
                return pages;
            }
        };
        list.iter().map(|e| e.key().page_index).collect()
    }
}
