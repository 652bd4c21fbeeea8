use super::flush::{FileAction, FlushTask, FlushTimers, FlushWorker};
use super::guard::PageHandle;
use super::pointer::CachePointer;
use super::read_cache::{Residency, TwoQueue};
use super::sizing::{normalize_memory, Backpressure, CacheBudgets};
use super::write_cache::{WriteCache, WriteCacheOptions};
use super::{FileId, PageKey};
use crate::config::{CacheConfig, MIN_READ_CACHE_PAGES};
use crate::file::FileRegistry;
use crate::page;
use crate::wal::WriteAheadLog;
use crate::{Result, StorageError};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A stored page that failed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageVerificationError {
    pub file_id: FileId,
    pub file_name: String,
    pub page_index: u64,
    pub incorrect_magic_number: bool,
    pub incorrect_checksum: bool,
}

/// Page cache over the files of one storage directory.
///
/// Pages are loaded through a 2Q read cache. Changed pages are handed to
/// the write cache when their last handle is released and written back by
/// a background worker. All list changes of the read cache happen under
/// one mutex; the write cache locks per write group.
pub struct ReadWriteDiskCache {
    config: CacheConfig,
    state: Mutex<TwoQueue>,
    registry: Arc<RwLock<FileRegistry>>,
    write_cache: Arc<WriteCache>,
    worker: FlushWorker,
    closed: AtomicBool,
}

impl ReadWriteDiskCache {
    pub fn new(config: CacheConfig, wal: Option<Arc<dyn WriteAheadLog>>) -> Result<Self> {
        config.validate()?;

        let budgets = CacheBudgets::from_config(&config);
        let backpressure = Backpressure::from_config(&config);
        let registry = Arc::new(RwLock::new(FileRegistry::open(
            &config.storage_path,
            config.page_size,
        )?));

        let write_cache = Arc::new(WriteCache::new(
            Arc::clone(&registry),
            wal,
            WriteCacheOptions {
                page_size: config.page_size,
                max_size: budgets.write_pages,
                group_ttl: config.write_group_ttl,
                sync_on_page_flush: config.sync_on_page_flush,
                backpressure,
            },
        ));

        let timers = FlushTimers {
            flush_interval: config.page_flush_interval,
            checkpoint_interval: if write_cache.has_wal() {
                config.fuzzy_checkpoint_interval
            } else {
                None
            },
        };
        let worker = FlushWorker::start(
            Arc::clone(&write_cache),
            config.flush_queue_capacity,
            timers,
        )?;

        info!(
            "Page cache at {} started: read cache {} pages, write cache {} pages of {} bytes",
            config.storage_path.display(),
            budgets.read_pages,
            budgets.write_pages,
            config.page_size
        );

        Ok(Self {
            state: Mutex::new(TwoQueue::new(
                budgets.read_pages,
                backpressure,
                config.percent_of_pinned_pages,
            )),
            config,
            registry,
            write_cache,
            worker,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn ensure_file_open(&self, file_id: FileId) -> Result<()> {
        self.ensure_open()?;
        if !self.registry.read().is_open(file_id) {
            return Err(StorageError::FileNotOpen(file_id.0));
        }
        Ok(())
    }

    /// Opens the file `name`, creating it on first use.
    ///
    /// A file keeps its id across restarts of the cache.
    pub fn open_file(&self, name: &str) -> Result<FileId> {
        self.ensure_open()?;
        self.registry.write().open_file(name)
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.registry.read().file_id(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry.read().exists(name)
    }

    pub fn is_open(&self, file_id: FileId) -> bool {
        self.registry.read().is_open(file_id)
    }

    pub fn file_name(&self, file_id: FileId) -> Option<String> {
        self.registry.read().file_name(file_id)
    }

    /// Evicts the pages of a file from the read cache and hands the file
    /// over to the flush worker.
    ///
    /// Fails with [`StorageError::PageInUse`] if a page of the file is
    /// still loaded.
    fn file_task(&self, file_id: FileId, action: FileAction) -> Result<()> {
        self.ensure_file_open(file_id)?;
        self.state.lock().remove_file_pages(file_id)?;
        self.worker.execute(FlushTask::File { file_id, action })
    }

    /// Closes a file, writing its queued pages first when `flush` is set
    /// and dropping them otherwise.
    pub fn close_file(&self, file_id: FileId, flush: bool) -> Result<()> {
        self.file_task(file_id, FileAction::Close { flush })?;
        debug!("Closed file {}", file_id);
        Ok(())
    }

    pub fn delete_file(&self, file_id: FileId) -> Result<()> {
        self.file_task(file_id, FileAction::Delete)
    }

    /// Drops every page of the file. The file stays open and empty.
    pub fn truncate_file(&self, file_id: FileId) -> Result<()> {
        self.file_task(file_id, FileAction::Truncate)?;
        debug!("Truncated file {}", file_id);
        Ok(())
    }

    /// Renames the backing file. Cached pages are not touched.
    pub fn rename_file(&self, file_id: FileId, old_name: &str, new_name: &str) -> Result<()> {
        self.ensure_file_open(file_id)?;
        self.registry.write().rename_file(file_id, old_name, new_name)
    }

    /// Number of pages in the file, including allocated pages not written yet.
    pub fn filled_up_to(&self, file_id: FileId) -> Result<u64> {
        let file = self.registry.read().file(file_id)?;
        let count = file.lock().filled_up_to();
        Ok(count)
    }

    /// Loads a page for reading.
    pub fn load(&self, file_id: FileId, page_index: u64) -> Result<PageHandle<'_>> {
        self.ensure_file_open(file_id)?;
        let key = PageKey::new(file_id, page_index);
        let pointer = {
            let mut state = self.state.lock();
            self.load_locked(&mut state, key)?
        };
        Ok(PageHandle::new(self, pointer, false))
    }

    /// Loads a page that will be changed. It is queued for write once the
    /// handle is released.
    pub fn load_for_write(&self, file_id: FileId, page_index: u64) -> Result<PageHandle<'_>> {
        self.ensure_file_open(file_id)?;
        let key = PageKey::new(file_id, page_index);
        let pointer = {
            let mut state = self.state.lock();
            self.load_locked(&mut state, key)?
        };
        Ok(PageHandle::new(self, pointer, true))
    }

    /// Appends a zeroed page to the file and loads it for write.
    pub fn allocate_new_page(&self, file_id: FileId) -> Result<PageHandle<'_>> {
        self.ensure_file_open(file_id)?;
        let pointer = {
            let mut state = self.state.lock();
            let page_index = self.filled_up_to(file_id)?;
            self.load_locked(&mut state, PageKey::new(file_id, page_index))?
        };
        Ok(PageHandle::new(self, pointer, true))
    }

    fn load_locked(&self, state: &mut TwoQueue, key: PageKey) -> Result<Arc<CachePointer>> {
        if let Some(pointer) = state.touch(&key) {
            pointer.acquire();
            return Ok(pointer);
        }

        let promoted = state.make_room_for(&key)?;

        let pointer = self.write_cache.load(key)?;
        pointer.acquire();
        state.admit(key, Arc::clone(&pointer), promoted);
        Ok(pointer)
    }

    /// Installs a page built by the caller and returns it loaded for write.
    ///
    /// The buffer stays marked as externally managed until the page is
    /// queued for write. Fails if the page is already cached.
    pub fn put_page(
        &self,
        file_id: FileId,
        page_index: u64,
        buffer: Box<[u8]>,
    ) -> Result<PageHandle<'_>> {
        self.ensure_file_open(file_id)?;
        if buffer.len() != self.config.page_size {
            return Err(StorageError::InvalidConfig(format!(
                "page buffer of {} bytes, page size is {}",
                buffer.len(),
                self.config.page_size
            )));
        }

        let key = PageKey::new(file_id, page_index);
        let pointer = {
            let mut state = self.state.lock();
            let cached = state
                .peek(&key)
                .cloned()
                .or_else(|| self.write_cache.get(key));
            if let Some(cached) = cached {
                return Err(StorageError::PageInUse {
                    file_id: file_id.0,
                    page_index,
                    usages: cached.usages(),
                });
            }

            let promoted = state.make_room_for(&key)?;

            let pointer = Arc::new(CachePointer::external(key, buffer));
            pointer.acquire();
            state.admit(key, Arc::clone(&pointer), promoted);
            pointer
        };
        Ok(PageHandle::new(self, pointer, true))
    }

    /// Releases a page, same as dropping the handle but reports errors.
    pub fn release(&self, handle: PageHandle<'_>) -> Result<()> {
        handle.release()
    }

    /// Drops one usage and queues the page for write if it was changed.
    ///
    /// Once the cache is closed a changed page can no longer be written and
    /// the release fails with [`StorageError::Closed`].
    pub(super) fn release_pointer(&self, pointer: &Arc<CachePointer>, dirty: bool) -> Result<()> {
        let over_budget = {
            let mut state = self.state.lock();
            match state.release(pointer, dirty)? {
                Some(_) if self.closed.load(Ordering::Acquire) => {
                    error!("Page {} was changed after the cache was closed", pointer.key());
                    return Err(StorageError::Closed);
                }
                Some(changed) => self.write_cache.store(changed),
                None => false,
            }
        };

        // Runs on this thread: the worker may be in a forced flush waiting
        // for a page this thread still holds.
        if over_budget {
            self.write_cache.periodic_flush()?;
        }
        Ok(())
    }

    /// Keeps a loaded page in memory for good.
    ///
    /// Returns `false` when the pinned share of the read cache is used up,
    /// the page then stays evictable.
    pub fn pin_page(&self, handle: &PageHandle<'_>) -> Result<bool> {
        self.state.lock().pin(&handle.pointer().key())
    }

    /// Writes the queued pages of a file and syncs it.
    ///
    /// Waits for writers of those pages: do not call it while holding a
    /// write guard on a page of the file.
    pub fn flush_file(&self, file_id: FileId) -> Result<()> {
        self.ensure_file_open(file_id)?;
        self.worker.execute(FlushTask::File {
            file_id,
            action: FileAction::Flush,
        })
    }

    /// Writes the queued pages of every open file.
    pub fn flush_buffer(&self) -> Result<()> {
        self.ensure_open()?;
        self.worker.execute(FlushTask::All)
    }

    /// Writes every queued page and empties the read cache.
    pub fn clear(&self) -> Result<()> {
        self.flush_buffer()?;
        self.state.lock().clear()
    }

    /// Runs a fuzzy checkpoint now. Does nothing without a WAL.
    pub fn make_fuzzy_checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        self.worker.execute(FlushTask::Checkpoint)
    }

    /// Flushes everything, stops the flush worker and closes all files.
    ///
    /// Pages changed through handles still alive at this point are not
    /// written, releasing them fails.
    pub fn close(&self) -> Result<()> {
        {
            // Releases check the flag under the same lock, so every page
            // queued before it is set is flushed below.
            let _state = self.state.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }

        if let Err(e) = self.worker.execute(FlushTask::All) {
            self.closed.store(false, Ordering::Release);
            return Err(e);
        }
        self.worker.stop();

        let mut registry = self.registry.write();
        for (file_id, file) in registry.open_files() {
            file.lock().sync()?;
            registry.close_file(file_id);
        }
        registry.compact()?;

        info!("Page cache at {} closed", self.config.storage_path.display());
        Ok(())
    }

    /// Re-reads every stored page and checks its magic number and checksum.
    ///
    /// Queued pages are written first. Pages that were never written are
    /// skipped.
    pub fn check_stored_pages(&self) -> Result<Vec<PageVerificationError>> {
        self.flush_buffer()?;

        let files = self.registry.read().open_files();
        let mut errors = Vec::new();
        let mut buffer = vec![0u8; self.config.page_size];

        for (file_id, file) in files {
            let file_name = self.file_name(file_id).unwrap_or_default();
            let mut file = file.lock();

            for page_index in 0..file.filled_up_to() {
                file.read_page(page_index, &mut buffer)?;
                if page::is_blank(&buffer) {
                    continue;
                }

                let check = page::verify(&buffer);
                if !check.is_valid() {
                    warn!(
                        "Page {} of file {} failed verification: magic ok {}, checksum ok {}",
                        page_index, file_name, check.magic_ok, check.checksum_ok
                    );
                    errors.push(PageVerificationError {
                        file_id,
                        file_name: file_name.clone(),
                        page_index,
                        incorrect_magic_number: !check.magic_ok,
                        incorrect_checksum: !check.checksum_ok,
                    });
                }
            }
        }

        Ok(errors)
    }

    pub fn set_softly_closed(&self, file_id: FileId, softly_closed: bool) -> Result<()> {
        let file = self.registry.read().file(file_id)?;
        let mut file = file.lock();
        file.set_softly_closed(softly_closed)
    }

    pub fn set_all_softly_closed(&self, softly_closed: bool) -> Result<()> {
        let files = self.registry.read().open_files();
        for (_, file) in files {
            file.lock().set_softly_closed(softly_closed)?;
        }
        Ok(())
    }

    pub fn was_softly_closed(&self, file_id: FileId) -> Result<bool> {
        let file = self.registry.read().file(file_id)?;
        let softly_closed = file.lock().was_softly_closed();
        Ok(softly_closed)
    }

    /// Resizes the read cache budget, evicting what no longer fits.
    pub fn change_maximum_memory(&self, read_cache_max_memory: usize) -> Result<()> {
        let mut pages = normalize_memory(read_cache_max_memory, self.config.page_size);
        if self.config.check_min_size && pages < MIN_READ_CACHE_PAGES {
            warn!(
                "Read cache of {} pages is too small, using {} pages",
                pages, MIN_READ_CACHE_PAGES
            );
            pages = MIN_READ_CACHE_PAGES;
        }
        self.state.lock().set_max_size(pages.max(1))
    }

    /// Where the page sits in the read cache, `None` when not cached there.
    pub fn residency(&self, file_id: FileId, page_index: u64) -> Option<Residency> {
        self.state
            .lock()
            .residency(&PageKey::new(file_id, page_index))
    }

    /// Read cache budget in pages.
    pub fn max_size(&self) -> usize {
        self.state.lock().max_size()
    }

    /// Bytes held by cached pages, counting a page in both caches twice.
    pub fn used_memory(&self) -> usize {
        let pages = self.state.lock().resident_len() + self.write_cache.size();
        pages * self.config.page_size
    }

    /// Pages queued for write.
    pub fn write_cache_pages(&self) -> usize {
        self.write_cache.size()
    }

    /// Write cache budget in pages.
    pub fn write_cache_max_size(&self) -> usize {
        self.write_cache.max_size()
    }
}

impl Drop for ReadWriteDiskCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(
                "Failed to close page cache at {}: {}",
                self.config.storage_path.display(),
                e
            );
        }
    }
}
