//! Write-back cache
//!
//! Dirty pages are queued in write groups of 16 neighbouring pages. The
//! flush worker writes groups back in key order, going round the ring from
//! where the previous pass stopped. A group that was touched recently and
//! is younger than the group TTL gets a second chance: its recency bit is
//! cleared and the pass moves on.
//!
//! Locks are always taken in this order: the flush lock of a group, the
//! group map, one group, then a page buffer or a file. Only forced flushes
//! wait for a flush lock or a page buffer; background passes skip the group. Page bytes are copied out before any file lock is
//! taken, and a group is never locked while its pages are being written.

use super::flush::{FileAction, FlushTask};
use super::pointer::CachePointer;
use super::sizing::Backpressure;
use super::{FileId, GroupKey, PageKey, WRITE_GROUP_SIZE};
use crate::file::FileRegistry;
use crate::page::{self, Lsn};
use crate::wal::WriteAheadLog;
use crate::{Result, StorageError};
use bytes::BytesMut;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct WriteGroup {
    pages: [Option<Arc<CachePointer>>; WRITE_GROUP_SIZE],
    recency_bit: bool,
    created: Instant,
    /// Held for the whole flush of the group, so its writes never interleave.
    flushing: Arc<Mutex<()>>,
}

impl WriteGroup {
    fn new() -> Self {
        Self {
            pages: std::array::from_fn(|_| None),
            recency_bit: true,
            created: Instant::now(),
            flushing: Arc::new(Mutex::new(())),
        }
    }

    fn is_empty(&self) -> bool {
        self.pages.iter().all(Option::is_none)
    }

    fn len(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushMode {
    /// Background pass. Skips groups with used pages and, unless forced,
    /// young groups with their recency bit set.
    Periodic { force: bool },
    /// Explicit flush, waits for page writers instead of skipping.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushOutcome {
    Flushed,
    Skipped,
}

struct PageCopy {
    slot: usize,
    pointer: Arc<CachePointer>,
    version: u64,
    data: BytesMut,
}

pub(crate) struct WriteCacheOptions {
    pub page_size: usize,
    pub max_size: usize,
    pub group_ttl: Duration,
    pub sync_on_page_flush: bool,
    pub backpressure: Backpressure,
}

pub(crate) struct WriteCache {
    registry: Arc<RwLock<FileRegistry>>,
    wal: Option<Arc<dyn WriteAheadLog>>,
    page_size: usize,
    groups: RwLock<BTreeMap<GroupKey, Arc<Mutex<WriteGroup>>>>,
    cache_size: AtomicUsize,
    max_size: AtomicUsize,
    last_group_key: Mutex<Option<GroupKey>>,
    group_ttl: Duration,
    sync_on_page_flush: bool,
    backpressure: Backpressure,
}

impl WriteCache {
    pub fn new(
        registry: Arc<RwLock<FileRegistry>>,
        wal: Option<Arc<dyn WriteAheadLog>>,
        options: WriteCacheOptions,
    ) -> Self {
        Self {
            registry,
            wal,
            page_size: options.page_size,
            groups: RwLock::new(BTreeMap::new()),
            cache_size: AtomicUsize::new(0),
            max_size: AtomicUsize::new(options.max_size),
            last_group_key: Mutex::new(None),
            group_ttl: options.group_ttl,
            sync_on_page_flush: options.sync_on_page_flush,
            backpressure: options.backpressure,
        }
    }

    /// Pages queued for write.
    pub fn size(&self) -> usize {
        self.cache_size.load(Ordering::Acquire)
    }

    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    pub fn has_wal(&self) -> bool {
        self.wal.is_some()
    }

    /// Queues a changed page for write.
    ///
    /// Returns `true` when the cache is now over budget and the caller
    /// must run a flush pass before going on.
    pub fn store(&self, pointer: Arc<CachePointer>) -> bool {
        let key = pointer.key();
        let group_key = key.group_key();
        let slot = key.group_slot();

        // The map lock is held while the group changes, so a flush cannot
        // drop the group from the map between lookup and insert.
        let added = {
            let groups = self.groups.read();
            match groups.get(&group_key) {
                Some(group) => Self::put(&mut group.lock(), slot, &pointer),
                None => {
                    drop(groups);
                    let mut groups = self.groups.write();
                    let group = groups
                        .entry(group_key)
                        .or_insert_with(|| Arc::new(Mutex::new(WriteGroup::new())));
                    let added = Self::put(&mut group.lock(), slot, &pointer);
                    added
                }
            }
        };

        pointer.clear_external_management_flag();

        let size = if added {
            self.cache_size.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.size()
        };
        size > self.max_size()
    }

    fn put(group: &mut WriteGroup, slot: usize, pointer: &Arc<CachePointer>) -> bool {
        let added = group.pages[slot].is_none();
        group.pages[slot] = Some(Arc::clone(pointer));
        group.recency_bit = true;
        pointer.bump_version();
        added
    }

    /// Queued copy of a page.
    pub fn get(&self, key: PageKey) -> Option<Arc<CachePointer>> {
        let groups = self.groups.read();
        let group = groups.get(&key.group_key())?;
        let pointer = group.lock().pages[key.group_slot()].clone();
        pointer
    }

    /// Returns the queued copy of a page or reads it from its file.
    ///
    /// Pages past the end of the file are allocated and start out zeroed.
    pub fn load(&self, key: PageKey) -> Result<Arc<CachePointer>> {
        if let Some(pointer) = self.get(key) {
            return Ok(pointer);
        }

        let file = self.registry.read().file(key.file_id)?;
        let mut buffer = vec![0u8; self.page_size].into_boxed_slice();
        {
            let mut file = file.lock();
            if key.page_index >= file.filled_up_to() {
                let page_count = key.page_index.checked_add(1).ok_or_else(|| {
                    StorageError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("page {} is out of addressable range", key),
                    ))
                })?;
                file.allocate(page_count)?;
            } else {
                file.read_page(key.page_index, &mut buffer)?;
            }
        }

        Ok(Arc::new(CachePointer::new(key, buffer)))
    }

    pub(crate) fn execute(&self, task: FlushTask) -> Result<()> {
        match task {
            FlushTask::All => self.flush_all(),
            FlushTask::Checkpoint => self.fuzzy_checkpoint(),
            FlushTask::File { file_id, action } => self.file_task(file_id, action),
        }
    }

    fn file_task(&self, file_id: FileId, action: FileAction) -> Result<()> {
        match action {
            FileAction::Flush => self.flush_file(file_id),
            FileAction::Close { flush } => {
                if flush {
                    self.flush_file(file_id)?;
                } else {
                    self.remove_file_pages(file_id);
                }
                self.registry.write().close_file(file_id);
                Ok(())
            }
            FileAction::Truncate => {
                self.remove_file_pages(file_id);
                let file = self.registry.read().file(file_id)?;
                let mut file = file.lock();
                file.shrink(0)?;
                file.sync()
            }
            FileAction::Delete => {
                self.remove_file_pages(file_id);
                self.registry.write().delete_file(file_id)
            }
        }
    }

    /// One background pass.
    ///
    /// Flushes one group, or a fifth of the groups above 80% fill and two
    /// fifths above 90%. When a full cache cannot give up enough groups
    /// because their pages are in use, the backpressure policy decides
    /// between growing and failing.
    pub fn periodic_flush(&self) -> Result<usize> {
        let group_count = self.group_count();
        if group_count == 0 {
            return Ok(0);
        }

        let max_size = self.max_size();
        let threshold = self.size() as f64 / max_size as f64;
        let (target, force) = if threshold > 0.9 {
            ((0.4 * group_count as f64) as usize, true)
        } else if threshold > 0.8 {
            ((0.2 * group_count as f64) as usize, true)
        } else {
            (1, false)
        };
        let target = target.max(1);

        let mut flushed = self.flush_ring(target, 0, false)?;
        if flushed < target && force {
            flushed = self.flush_ring(target, flushed, true)?;
        }

        if flushed < target && self.size() > self.max_size() {
            let grown = self.backpressure.relieve("write", self.max_size())?;
            self.max_size.store(grown, Ordering::Release);
        }

        debug!(
            "Periodic flush wrote {} of {} groups, {} pages still queued",
            flushed,
            target,
            self.size()
        );
        Ok(flushed)
    }

    /// Groups in ring order, starting right after the last visited group.
    fn ring(&self) -> Vec<(GroupKey, Arc<Mutex<WriteGroup>>)> {
        let groups = self.groups.read();
        let last = *self.last_group_key.lock();

        match last {
            Some(last) => groups
                .range((Bound::Excluded(last), Bound::Unbounded))
                .chain(groups.range(..=last))
                .map(|(k, g)| (*k, Arc::clone(g)))
                .collect(),
            None => groups.iter().map(|(k, g)| (*k, Arc::clone(g))).collect(),
        }
    }

    fn flush_ring(&self, target: usize, mut flushed: usize, force: bool) -> Result<usize> {
        for (key, group) in self.ring() {
            if flushed >= target {
                break;
            }

            let outcome = self.flush_group(key, &group, FlushMode::Periodic { force })?;
            *self.last_group_key.lock() = Some(key);

            if outcome == FlushOutcome::Flushed {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    fn flush_group(
        &self,
        key: GroupKey,
        group: &Arc<Mutex<WriteGroup>>,
        mode: FlushMode,
    ) -> Result<FlushOutcome> {
        let flushing = Arc::clone(&group.lock().flushing);
        // A background pass never waits: the group may be held by a forced
        // flush that is itself waiting for a page writer.
        let _flushing = match mode {
            FlushMode::Periodic { .. } => match flushing.try_lock() {
                Some(guard) => guard,
                None => return Ok(FlushOutcome::Skipped),
            },
            FlushMode::Forced => flushing.lock(),
        };

        let snapshot = match Self::snapshot(group, mode, self.group_ttl) {
            Some(snapshot) => snapshot,
            None => return Ok(FlushOutcome::Skipped),
        };
        let mut copies = match Self::copy_pages(snapshot, mode) {
            Some(copies) if !copies.is_empty() => copies,
            _ => return Ok(FlushOutcome::Skipped),
        };

        self.write_copies(key, &mut copies)?;
        self.retire(key, group, &copies);

        Ok(FlushOutcome::Flushed)
    }

    /// Pages of the group with their versions, `None` when the group is skipped.
    fn snapshot(
        group: &Mutex<WriteGroup>,
        mode: FlushMode,
        ttl: Duration,
    ) -> Option<Vec<(usize, Arc<CachePointer>, u64)>> {
        let mut group = group.lock();

        if let FlushMode::Periodic { force } = mode {
            let young = group.created.elapsed() < ttl;
            if group.recency_bit && young && !force {
                group.recency_bit = false;
                return None;
            }

            if group.pages.iter().flatten().any(|p| p.usages() > 0) {
                return None;
            }
        }

        group.recency_bit = false;
        Some(
            group
                .pages
                .iter()
                .enumerate()
                .filter_map(|(slot, p)| p.as_ref().map(|p| (slot, Arc::clone(p), p.version())))
                .collect(),
        )
    }

    fn copy_pages(
        snapshot: Vec<(usize, Arc<CachePointer>, u64)>,
        mode: FlushMode,
    ) -> Option<Vec<PageCopy>> {
        let mut copies = Vec::with_capacity(snapshot.len());
        for (slot, pointer, version) in snapshot {
            let data = match mode {
                FlushMode::Periodic { .. } => BytesMut::from(&pointer.try_read()?[..]),
                FlushMode::Forced => BytesMut::from(&pointer.read()[..]),
            };
            copies.push(PageCopy {
                slot,
                pointer,
                version,
                data,
            });
        }
        Some(copies)
    }

    /// Drops the written pages that were not stored again in the meantime.
    fn retire(&self, key: GroupKey, group: &Arc<Mutex<WriteGroup>>, copies: &[PageCopy]) {
        let mut groups = self.groups.write();
        let mut removed = 0;
        let now_empty = {
            let mut current = group.lock();
            for copy in copies {
                let unchanged = match &current.pages[copy.slot] {
                    Some(p) => Arc::ptr_eq(p, &copy.pointer) && p.version() == copy.version,
                    None => false,
                };
                if unchanged {
                    current.pages[copy.slot] = None;
                    removed += 1;
                }
            }
            current.is_empty()
        };

        if now_empty && groups.get(&key).is_some_and(|g| Arc::ptr_eq(g, group)) {
            groups.remove(&key);
        }
        self.cache_size.fetch_sub(removed, Ordering::AcqRel);
    }

    fn write_copies(&self, key: GroupKey, copies: &mut [PageCopy]) -> Result<()> {
        let file = self.registry.read().file(key.file_id)?;

        for copy in copies.iter_mut() {
            page::stamp(&mut copy.data[..]);
            let lsn = page::read_lsn(&copy.data);
            self.ensure_wal_durable(lsn)?;

            let page_index = key.page_key(copy.slot).page_index;
            let mut file = file.lock();
            file.write_page(page_index, &copy.data)?;
            if self.sync_on_page_flush {
                file.sync()?;
            }
            drop(file);

            copy.pointer.set_last_flushed_lsn(lsn);
        }

        Ok(())
    }

    /// A page may only reach the disk once the log records it depends on did.
    fn ensure_wal_durable(&self, lsn: Lsn) -> Result<()> {
        if let Some(wal) = &self.wal {
            let durable = matches!(wal.flushed_lsn(), Some(flushed) if flushed >= lsn);
            if !durable {
                wal.flush()?;
            }
        }
        Ok(())
    }

    fn file_groups(&self, file_id: FileId) -> Vec<(GroupKey, Arc<Mutex<WriteGroup>>)> {
        self.groups
            .read()
            .range(GroupKey::first_of(file_id)..=GroupKey::last_of(file_id))
            .map(|(k, g)| (*k, Arc::clone(g)))
            .collect()
    }

    /// Writes every queued page of the file and syncs it.
    pub fn flush_file(&self, file_id: FileId) -> Result<()> {
        for (key, group) in self.file_groups(file_id) {
            self.flush_group(key, &group, FlushMode::Forced)?;
        }

        let file = self.registry.read().file(file_id)?;
        let mut file = file.lock();
        file.sync()
    }

    pub fn flush_all(&self) -> Result<()> {
        let files = self.registry.read().open_files();
        for (file_id, _) in files {
            self.flush_file(file_id)?;
        }
        Ok(())
    }

    /// Drops the queued pages of a file without writing them.
    ///
    /// Waits for background passes still writing one of its groups, and
    /// empties each group so a pass that already picked it writes nothing.
    pub fn remove_file_pages(&self, file_id: FileId) {
        for (key, group) in self.file_groups(file_id) {
            let flushing = Arc::clone(&group.lock().flushing);
            let _flushing = flushing.lock();

            let mut groups = self.groups.write();
            if groups.get(&key).is_some_and(|g| Arc::ptr_eq(g, &group)) {
                groups.remove(&key);
            }
            let mut group = group.lock();
            let removed = group.len();
            group.pages = std::array::from_fn(|_| None);
            self.cache_size.fetch_sub(removed, Ordering::AcqRel);
        }

        let mut last = self.last_group_key.lock();
        if last.is_some_and(|k| k.file_id == file_id) {
            *last = None;
        }
    }

    /// Lowest LSN the log must keep for queued pages to be recoverable.
    fn min_dirty_lsn(&self, mut min_lsn: Lsn) -> Lsn {
        let groups: Vec<_> = self.groups.read().values().cloned().collect();
        for group in groups {
            let group = group.lock();
            for pointer in group.pages.iter().flatten() {
                if let Some(lsn) = pointer.last_flushed_lsn() {
                    min_lsn = min_lsn.min(lsn);
                }
            }
        }
        min_lsn
    }

    /// Records a fuzzy checkpoint and lets the log drop what it no longer needs.
    pub fn fuzzy_checkpoint(&self) -> Result<()> {
        let wal = match &self.wal {
            Some(wal) => wal,
            None => return Ok(()),
        };

        // Nothing to cut before the log was flushed once
        let flushed = match wal.flushed_lsn() {
            Some(lsn) => lsn,
            None => return Ok(()),
        };

        let min_lsn = self.min_dirty_lsn(flushed);
        debug!("Start fuzzy checkpoint, flushed LSN is {}", min_lsn);

        wal.log_fuzzy_checkpoint_start(min_lsn)?;
        let files = self.registry.read().open_files();
        for (_, file) in files {
            file.lock().sync()?;
        }
        wal.log_fuzzy_checkpoint_end()?;
        wal.flush()?;
        wal.cut_till(min_lsn)?;

        debug!("End fuzzy checkpoint");
        Ok(())
    }
}
