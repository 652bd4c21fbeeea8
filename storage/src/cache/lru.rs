//! Eviction lists used by the 2Q read cache.
//!
//! Nodes live in an arena and link to each other by index. A handle also
//! carries the generation of its slot, so a handle that outlived its node
//! is detected instead of pointing at whatever reused the slot.

use super::PageKey;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::collections::HashMap;

/// What an eviction list needs to know about the values it stores.
pub trait ListEntry {
    fn key(&self) -> PageKey;

    /// Holders currently using the page, non-zero pins the entry.
    fn usages(&self) -> usize;
}

/// Ordered set of entries with the LRU at the head and the MRU at the tail.
pub trait EvictionList<T: ListEntry> {
    /// Looks an entry up without touching the order.
    fn get(&self, key: &PageKey) -> Option<&T>;

    fn get_mut(&mut self, key: &PageKey) -> Option<&mut T>;

    /// Inserts the entry at the MRU end, replacing and moving an entry
    /// with the same key.
    fn put_to_mru(&mut self, entry: T);

    /// Removes the least recently used entry that is not in use.
    fn remove_lru(&mut self) -> Option<T>;

    /// Removes an entry by key.
    ///
    /// Fails with [`StorageError::PageInUse`] when more than one holder
    /// still uses the entry.
    fn remove(&mut self, key: &PageKey) -> Result<Option<T>>;

    fn contains(&self, key: &PageKey) -> bool {
        self.get(key).is_some()
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates from the LRU to the MRU end.
    fn iter(&self) -> Box<dyn Iterator<Item = &T> + '_>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Handle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<Handle>,
    next: Option<Handle>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// Arena-backed doubly linked list with a key index.
#[derive(Debug)]
pub struct LruList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    index: HashMap<PageKey, Handle>,
    head: Option<Handle>,
    tail: Option<Handle>,
}

impl<T: ListEntry> Default for LruList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ListEntry> LruList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    fn node(&self, handle: Handle) -> Option<&Node<T>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, handle: Handle) -> Option<&mut Node<T>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_mut()
    }

    fn alloc(&mut self, value: T) -> Handle {
        let node = Node {
            value,
            prev: None,
            next: None,
        };

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            Handle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            Handle {
                index,
                generation: 0,
            }
        }
    }

    fn link_tail(&mut self, handle: Handle) {
        let old_tail = self.tail;
        if let Some(node) = self.node_mut(handle) {
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(tail) = self.node_mut(t) {
                    tail.next = Some(handle);
                }
            }
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
    }

    fn unlink(&mut self, handle: Handle) {
        let (prev, next) = match self.node(handle) {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    /// Unlinks a node that is already gone from the index and frees its slot.
    fn release(&mut self, handle: Handle) -> Option<T> {
        self.unlink(handle);

        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(node.value)
    }

    #[cfg(test)]
    pub(crate) fn check_consistency(&self) -> bool {
        let mut seen = 0;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let node = match self.node(handle) {
                Some(node) => node,
                None => return false,
            };
            if node.prev != prev || self.index.get(&node.value.key()) != Some(&handle) {
                return false;
            }
            seen += 1;
            prev = Some(handle);
            cursor = node.next;
        }
        prev == self.tail && seen == self.index.len()
    }
}

impl<T: ListEntry> EvictionList<T> for LruList<T> {
    fn get(&self, key: &PageKey) -> Option<&T> {
        let handle = *self.index.get(key)?;
        self.node(handle).map(|n| &n.value)
    }

    fn get_mut(&mut self, key: &PageKey) -> Option<&mut T> {
        let handle = *self.index.get(key)?;
        self.node_mut(handle).map(|n| &mut n.value)
    }

    fn put_to_mru(&mut self, entry: T) {
        let key = entry.key();

        if let Some(handle) = self.index.get(&key).copied() {
            if let Some(node) = self.node_mut(handle) {
                node.value = entry;
            }
            if self.tail != Some(handle) {
                self.unlink(handle);
                self.link_tail(handle);
            }
            return;
        }

        let handle = self.alloc(entry);
        self.link_tail(handle);
        self.index.insert(key, handle);
    }

    fn remove_lru(&mut self) -> Option<T> {
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let node = self.node(handle)?;
            if node.value.usages() == 0 {
                let key = node.value.key();
                // Drop from the index before touching the links.
                self.index.remove(&key);
                return self.release(handle);
            }
            cursor = node.next;
        }
        None
    }

    fn remove(&mut self, key: &PageKey) -> Result<Option<T>> {
        let handle = match self.index.get(key) {
            Some(handle) => *handle,
            None => return Ok(None),
        };

        if let Some(node) = self.node(handle) {
            let usages = node.value.usages();
            if usages > 1 {
                return Err(StorageError::PageInUse {
                    file_id: key.file_id.0,
                    page_index: key.page_index,
                    usages,
                });
            }
        }

        self.index.remove(key);
        Ok(self.release(handle))
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        let mut cursor = self.head;
        Box::new(std::iter::from_fn(move || {
            let node = self.node(cursor?)?;
            cursor = node.next;
            Some(&node.value)
        }))
    }
}

/// Eviction list shared between threads.
///
/// Every call takes the lock once, so lookups hand out clones rather than
/// references into the list. For that reason it does not implement
/// [`EvictionList`]: [`TwoQueue`](super::TwoQueue) keeps plain lists and
/// is locked as a whole by the disk cache. This flavor is for callers
/// outside the read cache that share a single list between threads.
#[derive(Debug)]
pub struct ConcurrentLruList<T> {
    inner: Mutex<LruList<T>>,
}

impl<T: ListEntry + Clone> Default for ConcurrentLruList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ListEntry + Clone> ConcurrentLruList<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruList::new()),
        }
    }

    pub fn get(&self, key: &PageKey) -> Option<T> {
        self.inner.lock().get(key).cloned()
    }

    pub fn put_to_mru(&self, entry: T) {
        self.inner.lock().put_to_mru(entry);
    }

    pub fn remove_lru(&self) -> Option<T> {
        self.inner.lock().remove_lru()
    }

    pub fn remove(&self, key: &PageKey) -> Result<Option<T>> {
        self.inner.lock().remove(key)
    }

    pub fn contains(&self, key: &PageKey) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Entries from the LRU to the MRU end at the time of the call.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().iter().cloned().collect()
    }
}
