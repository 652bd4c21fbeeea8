//! Fixtures shared by the page cache benchmarks.

use pagecache::{CacheConfig, FileId, ReadWriteDiskCache, Result};
use std::time::Duration;
use tempfile::TempDir;

pub const PAGE_SIZE: usize = 4096;

/// A cache over a scratch directory with one open file.
pub struct Fixture {
    // Declared first so the cache is closed before the directory goes away.
    pub cache: ReadWriteDiskCache,
    pub file_id: FileId,
    _dir: TempDir,
}

impl Fixture {
    /// Cache budgets are given in pages.
    pub fn new(read_pages: usize, write_pages: usize) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let config = CacheConfig::new(dir.path())
            .with_page_size(PAGE_SIZE)
            .with_read_cache_max_memory(read_pages * PAGE_SIZE)
            .with_write_cache_max_memory(write_pages * PAGE_SIZE)
            .with_check_min_size(false)
            .with_write_group_ttl(Duration::from_millis(10));

        let cache = ReadWriteDiskCache::new(config, None)?;
        let file_id = cache.open_file("bench.pcl")?;
        Ok(Self {
            cache,
            file_id,
            _dir: dir,
        })
    }

    /// Writes `pages` pages and flushes them so later loads hit the disk.
    pub fn populate(&self, pages: u64) -> Result<()> {
        for page_index in 0..pages {
            let mut handle = self.cache.load_for_write(self.file_id, page_index)?;
            handle.write()[64..72].copy_from_slice(&page_index.to_le_bytes());
            handle.release()?;
        }
        self.cache.flush_file(self.file_id)?;
        self.cache.clear()
    }
}
