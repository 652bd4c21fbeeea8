//! Page budgets and what happens when a budget runs out.

use crate::config::CacheConfig;
use crate::{Result, StorageError};
use log::warn;

/// Converts a byte budget into a page count.
pub fn normalize_memory(bytes: usize, page_size: usize) -> usize {
    bytes / page_size
}

/// Page budget of the 2Q lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizing {
    max_size: usize,
    k_in: usize,
    k_out: usize,
}

impl QueueSizing {
    pub fn new(max_size: usize) -> Self {
        let mut sizing = Self {
            max_size: 0,
            k_in: 0,
            k_out: 0,
        };
        sizing.set_max_size(max_size);
        sizing
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.k_in = max_size / 4;
        self.k_out = max_size / 2;
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Quota of `A1in` above which it is evicted first.
    pub fn k_in(&self) -> usize {
        self.k_in
    }

    /// Number of ghosts kept in `A1out`.
    pub fn k_out(&self) -> usize {
        self.k_out
    }
}

/// Single policy applied by both caches when every resident page is in use.
///
/// Either the budget grows by `growth_step` and the caller proceeds, or
/// the caller gets [`StorageError::AllCacheEntriesAreUsed`].
#[derive(Debug, Clone, Copy)]
pub struct Backpressure {
    grow_on_demand: bool,
    growth_step: f64,
}

impl Backpressure {
    pub fn new(grow_on_demand: bool, growth_step: f64) -> Self {
        Self {
            grow_on_demand,
            growth_step,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.grow_on_demand, config.growth_step)
    }

    /// Returns the new budget or fails when growth is disabled.
    pub fn relieve(&self, cache: &'static str, max_size: usize) -> Result<usize> {
        if !self.grow_on_demand {
            return Err(StorageError::AllCacheEntriesAreUsed { cache, max_size });
        }

        let grown = (max_size as f64 * (1.0 + self.growth_step)).ceil() as usize;
        let grown = grown.max(max_size + 1);
        warn!(
            "All {} cache entries are used, max size is increased from {} to {} pages",
            cache, max_size, grown
        );
        Ok(grown)
    }
}

/// Page budgets derived from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBudgets {
    pub read_pages: usize,
    pub write_pages: usize,
}

impl CacheBudgets {
    pub fn from_config(config: &CacheConfig) -> Self {
        use crate::config::{MIN_READ_CACHE_PAGES, MIN_WRITE_CACHE_PAGES};

        let mut read_pages = normalize_memory(config.read_cache_max_memory, config.page_size);
        let mut write_pages = normalize_memory(config.write_cache_max_memory, config.page_size);

        if config.check_min_size {
            if read_pages < MIN_READ_CACHE_PAGES {
                warn!(
                    "Read cache of {} pages is too small, using {} pages",
                    read_pages, MIN_READ_CACHE_PAGES
                );
                read_pages = MIN_READ_CACHE_PAGES;
            }
            if write_pages < MIN_WRITE_CACHE_PAGES {
                warn!(
                    "Write cache of {} pages is too small, using {} pages",
                    write_pages, MIN_WRITE_CACHE_PAGES
                );
                write_pages = MIN_WRITE_CACHE_PAGES;
            }
        }

        Self {
            read_pages: read_pages.max(1),
            write_pages: write_pages.max(1),
        }
    }
}
