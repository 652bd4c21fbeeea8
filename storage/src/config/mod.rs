//! Cache configuration
//!
//! Built once by the embedding storage engine and handed to
//! [`ReadWriteDiskCache::new`](crate::ReadWriteDiskCache::new) by value.

use crate::page::PAGE_HEADER_SIZE;
use crate::{Result, StorageError};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Smallest read cache allowed when `check_min_size` is on, in pages.
pub const MIN_READ_CACHE_PAGES: usize = 256;

/// Smallest write cache allowed when `check_min_size` is on, in pages.
pub const MIN_WRITE_CACHE_PAGES: usize = 16;

pub const MAX_PERCENT_OF_PINNED_PAGES: usize = 50;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheConfig {
    /// Directory holding the page files and the name/id map.
    pub storage_path: PathBuf,
    pub page_size: usize,
    /// Read cache budget in bytes.
    pub read_cache_max_memory: usize,
    /// Write cache budget in bytes.
    pub write_cache_max_memory: usize,
    /// Age under which a recently touched write group gets a second chance.
    pub write_group_ttl: Duration,
    /// Period of the background flush pass, `None` disables the timer.
    pub page_flush_interval: Option<Duration>,
    pub sync_on_page_flush: bool,
    /// Clamp budgets to the minimum page counts.
    pub check_min_size: bool,
    /// Grow a budget instead of failing when every resident page is in use.
    pub grow_on_demand: bool,
    /// Relative growth applied on each budget increase.
    pub growth_step: f64,
    pub percent_of_pinned_pages: usize,
    /// Period of fuzzy checkpoints, only used when a WAL is attached.
    pub fuzzy_checkpoint_interval: Option<Duration>,
    /// Capacity of the flush worker queue.
    pub flush_queue_capacity: usize,
}

impl CacheConfig {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            read_cache_max_memory: 256 * 1024 * 1024,
            write_cache_max_memory: 64 * 1024 * 1024,
            write_group_ttl: Duration::from_secs(30),
            page_flush_interval: Some(Duration::from_millis(25)),
            sync_on_page_flush: false,
            check_min_size: true,
            grow_on_demand: true,
            growth_step: 0.1,
            percent_of_pinned_pages: 20,
            fuzzy_checkpoint_interval: None,
            flush_queue_capacity: 64,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_read_cache_max_memory(mut self, bytes: usize) -> Self {
        self.read_cache_max_memory = bytes;
        self
    }

    pub fn with_write_cache_max_memory(mut self, bytes: usize) -> Self {
        self.write_cache_max_memory = bytes;
        self
    }

    pub fn with_write_group_ttl(mut self, ttl: Duration) -> Self {
        self.write_group_ttl = ttl;
        self
    }

    pub fn with_page_flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.page_flush_interval = interval;
        self
    }

    pub fn with_sync_on_page_flush(mut self, sync: bool) -> Self {
        self.sync_on_page_flush = sync;
        self
    }

    pub fn with_check_min_size(mut self, check: bool) -> Self {
        self.check_min_size = check;
        self
    }

    pub fn with_grow_on_demand(mut self, grow: bool) -> Self {
        self.grow_on_demand = grow;
        self
    }

    pub fn with_growth_step(mut self, step: f64) -> Self {
        self.growth_step = step;
        self
    }

    pub fn with_percent_of_pinned_pages(mut self, percent: usize) -> Self {
        self.percent_of_pinned_pages = percent;
        self
    }

    pub fn with_fuzzy_checkpoint_interval(mut self, interval: Option<Duration>) -> Self {
        self.fuzzy_checkpoint_interval = interval;
        self
    }

    pub fn with_flush_queue_capacity(mut self, capacity: usize) -> Self {
        self.flush_queue_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size <= PAGE_HEADER_SIZE {
            return Err(StorageError::InvalidConfig(format!(
                "page size {} does not fit the {} byte page header",
                self.page_size, PAGE_HEADER_SIZE
            )));
        }

        if self.read_cache_max_memory < self.page_size {
            return Err(StorageError::InvalidConfig(format!(
                "read cache budget {} is smaller than one page",
                self.read_cache_max_memory
            )));
        }

        if self.write_cache_max_memory < self.page_size {
            return Err(StorageError::InvalidConfig(format!(
                "write cache budget {} is smaller than one page",
                self.write_cache_max_memory
            )));
        }

        if !(self.growth_step > 0.0) {
            return Err(StorageError::InvalidConfig(format!(
                "growth step must be positive, got {}",
                self.growth_step
            )));
        }

        if self.percent_of_pinned_pages > MAX_PERCENT_OF_PINNED_PAGES {
            return Err(StorageError::InvalidConfig(format!(
                "percent of pinned pages cannot exceed {}, got {}",
                MAX_PERCENT_OF_PINNED_PAGES, self.percent_of_pinned_pages
            )));
        }

        if self.flush_queue_capacity == 0 {
            return Err(StorageError::InvalidConfig(
                "flush queue capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
