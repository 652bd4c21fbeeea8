use pagecache::file::HEADER_SIZE;
use pagecache::wal::{MemoryWal, WalEvent};
use pagecache::{
    CacheConfig, FileId, Lsn, ReadWriteDiskCache, Residency, StorageError, WriteAheadLog,
};
use pretty_assertions::assert_eq;
use rand::Rng;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

const PAGE_SIZE: usize = 256;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Four page read cache, sixteen page write cache, no background timer.
fn small_config(path: &Path) -> CacheConfig {
    CacheConfig::new(path)
        .with_page_size(PAGE_SIZE)
        .with_read_cache_max_memory(4 * PAGE_SIZE)
        .with_write_cache_max_memory(16 * PAGE_SIZE)
        .with_check_min_size(false)
        .with_page_flush_interval(None)
}

fn open(config: CacheConfig) -> ReadWriteDiskCache {
    init_logging();
    ReadWriteDiskCache::new(config, None).unwrap()
}

fn touch(cache: &ReadWriteDiskCache, file_id: FileId, page_index: u64) {
    cache.load(file_id, page_index).unwrap().release().unwrap();
}

fn write_byte(cache: &ReadWriteDiskCache, file_id: FileId, page_index: u64, offset: usize, value: u8) {
    let mut handle = cache.load_for_write(file_id, page_index).unwrap();
    handle.write()[offset] = value;
    handle.release().unwrap();
}

#[test]
fn test_single_access_pages_are_evicted_first() {
    let dir = tempdir().unwrap();
    let cache = open(small_config(dir.path()));
    let file_id = cache.open_file("index.pcl").unwrap();

    for page in 1..=5 {
        touch(&cache, file_id, page);
    }
    assert_eq!(cache.residency(file_id, 1), Some(Residency::A1Out));
    assert_eq!(cache.residency(file_id, 5), Some(Residency::A1In));

    // Second access while the ghost is remembered goes straight to Am
    touch(&cache, file_id, 1);
    assert_eq!(cache.residency(file_id, 1), Some(Residency::Am));
    assert_eq!(cache.residency(file_id, 2), Some(Residency::A1Out));

    // Further scans only churn A1in
    touch(&cache, file_id, 6);
    touch(&cache, file_id, 7);
    assert_eq!(cache.residency(file_id, 1), Some(Residency::Am));
    assert_eq!(cache.residency(file_id, 2), None);
    assert_eq!(cache.residency(file_id, 3), Some(Residency::A1Out));
    assert_eq!(cache.residency(file_id, 4), Some(Residency::A1Out));
    assert_eq!(cache.max_size(), 4);
}

#[test]
fn test_read_cache_grows_when_every_page_is_used() {
    let dir = tempdir().unwrap();
    let cache = open(small_config(dir.path()));
    let file_id = cache.open_file("index.pcl").unwrap();

    let handles: Vec<_> = (0..5).map(|page| cache.load(file_id, page).unwrap()).collect();
    assert_eq!(cache.max_size(), 5);
    drop(handles);
}

#[test]
fn test_read_cache_fails_when_growth_is_disabled() {
    let dir = tempdir().unwrap();
    let cache = open(small_config(dir.path()).with_grow_on_demand(false));
    let file_id = cache.open_file("index.pcl").unwrap();

    let _handles: Vec<_> = (0..4).map(|page| cache.load(file_id, page).unwrap()).collect();
    assert!(matches!(
        cache.load(file_id, 4),
        Err(StorageError::AllCacheEntriesAreUsed { cache: "read", max_size: 4 })
    ));
}

/// Fills a two page write cache with one group whose pages are in use.
fn overfill_write_cache(cache: &ReadWriteDiskCache, file_id: FileId) -> pagecache::Result<()> {
    write_byte(cache, file_id, 0, 50, 1);
    write_byte(cache, file_id, 1, 50, 1);
    assert_eq!(cache.write_cache_pages(), 2);

    let _first = cache.load(file_id, 0)?;
    let _second = cache.load(file_id, 1)?;
    let mut third = cache.load_for_write(file_id, 2)?;
    third.write()[50] = 1;
    third.release()
}

#[test]
fn test_write_cache_full_of_used_pages_fails() {
    let dir = tempdir().unwrap();
    let config = small_config(dir.path())
        .with_write_cache_max_memory(2 * PAGE_SIZE)
        .with_grow_on_demand(false);
    let cache = open(config);
    let file_id = cache.open_file("index.pcl").unwrap();

    let result = overfill_write_cache(&cache, file_id);
    assert!(matches!(
        result,
        Err(StorageError::AllCacheEntriesAreUsed { cache: "write", max_size: 2 })
    ));
}

#[test]
fn test_write_cache_full_of_used_pages_grows() {
    let dir = tempdir().unwrap();
    let config = small_config(dir.path()).with_write_cache_max_memory(2 * PAGE_SIZE);
    let cache = open(config);
    let file_id = cache.open_file("index.pcl").unwrap();

    overfill_write_cache(&cache, file_id).unwrap();
    assert_eq!(cache.write_cache_max_size(), 3);
    assert_eq!(cache.write_cache_pages(), 3);
}

#[test]
fn test_release_over_budget_while_forced_flush_waits() {
    let dir = tempdir().unwrap();
    let cache = open(small_config(dir.path()));
    let file_id = cache.open_file("index.pcl").unwrap();

    for page in 0..16 {
        write_byte(&cache, file_id, page, 60, 1);
    }
    assert_eq!(cache.write_cache_pages(), 16);

    let (parent_result, flush_result) = thread::scope(|s| {
        let mut parent = cache.load_for_write(file_id, 0).unwrap();
        let mut child = cache.load_for_write(file_id, 100).unwrap();
        let mut parent_bytes = parent.write();

        // Blocks on the write guard of page 0 held above
        let flusher = s.spawn(|| cache.flush_file(file_id));
        thread::sleep(Duration::from_millis(100));

        child.write()[60] = 2;
        let child_result = child.release();
        parent_bytes[60] = 2;
        drop(parent_bytes);

        let parent_result = child_result.and_then(|_| parent.release());
        (parent_result, flusher.join().unwrap())
    });

    parent_result.unwrap();
    flush_result.unwrap();
    cache.flush_file(file_id).unwrap();
    assert_eq!(cache.write_cache_pages(), 0);

    cache.clear().unwrap();
    assert_eq!(cache.load(file_id, 0).unwrap().read()[60], 2);
    assert_eq!(cache.load(file_id, 100).unwrap().read()[60], 2);
}

#[test]
fn test_written_pages_survive_reopen() -> anyhow::Result<()> {
    let dir = tempdir()?;
    {
        let cache = open(small_config(dir.path()));
        let file_id = cache.open_file("index.pcl")?;
        for page in 0..40 {
            write_byte(&cache, file_id, page, 200, page as u8);
        }
        cache.close()?;
    }

    let cache = open(small_config(dir.path()));
    let file_id = cache.open_file("index.pcl")?;
    assert_eq!(cache.filled_up_to(file_id)?, 40);
    for page in 0..40 {
        assert_eq!(cache.load(file_id, page)?.read()[200], page as u8);
    }
    assert!(cache.check_stored_pages()?.is_empty());
    Ok(())
}

#[test]
fn test_corrupted_page_is_reported() {
    let dir = tempdir().unwrap();
    {
        let cache = open(small_config(dir.path()));
        let file_id = cache.open_file("index.pcl").unwrap();
        for page in 0..3 {
            write_byte(&cache, file_id, page, 100, 7);
        }
    }

    // Flip one payload byte of page 1
    {
        let offset = (HEADER_SIZE + PAGE_SIZE + 100) as u64;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.path().join("index.pcl"))
            .unwrap();
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    }

    let cache = open(small_config(dir.path()));
    let file_id = cache.open_file("index.pcl").unwrap();
    let errors = cache.check_stored_pages().unwrap();

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].file_id, file_id);
    assert_eq!(errors[0].file_name, "index.pcl");
    assert_eq!(errors[0].page_index, 1);
    assert!(errors[0].incorrect_checksum);
    assert!(!errors[0].incorrect_magic_number);
}

#[test]
fn test_slow_wal_is_flushed_before_pages() {
    init_logging();
    let dir = tempdir().unwrap();
    let wal = Arc::new(MemoryWal::with_flush_delay(Duration::from_millis(20)));
    let cache =
        ReadWriteDiskCache::new(small_config(dir.path()), Some(wal.clone() as Arc<dyn WriteAheadLog>))
            .unwrap();
    let file_id = cache.open_file("index.pcl").unwrap();

    let lsn = wal.append();
    let mut handle = cache.load_for_write(file_id, 0).unwrap();
    handle.set_lsn(lsn);
    handle.release().unwrap();
    assert_eq!(wal.flushed_lsn(), None);

    cache.flush_file(file_id).unwrap();
    assert!(wal.flushed_lsn() >= Some(lsn));
    assert_eq!(wal.flush_count(), 1);

    let handle = cache.load(file_id, 0).unwrap();
    assert_eq!(handle.lsn(), lsn);
}

/// Log that can never be made durable.
struct BrokenWal;

impl WriteAheadLog for BrokenWal {
    fn flushed_lsn(&self) -> Option<Lsn> {
        None
    }

    fn flush(&self) -> pagecache::Result<()> {
        Err(StorageError::Wal("log device is gone".to_string()))
    }

    fn log_fuzzy_checkpoint_start(&self, _flushed_lsn: Lsn) -> pagecache::Result<Lsn> {
        Ok(Lsn::default())
    }

    fn log_fuzzy_checkpoint_end(&self) -> pagecache::Result<Lsn> {
        Ok(Lsn::default())
    }

    fn cut_till(&self, _lsn: Lsn) -> pagecache::Result<()> {
        Ok(())
    }
}

#[test]
fn test_page_is_not_written_when_wal_flush_fails() {
    init_logging();
    let dir = tempdir().unwrap();
    let cache = ReadWriteDiskCache::new(small_config(dir.path()), Some(Arc::new(BrokenWal))).unwrap();
    let file_id = cache.open_file("index.pcl").unwrap();

    let mut handle = cache.load_for_write(file_id, 0).unwrap();
    handle.set_lsn(Lsn::new(1, 1));
    handle.write()[100] = 5;
    handle.release().unwrap();

    assert!(matches!(cache.flush_file(file_id), Err(StorageError::Wal(_))));
    assert_eq!(cache.write_cache_pages(), 1);

    // Only the zeroed allocation made it to disk
    let mut bytes = Vec::new();
    std::fs::File::open(dir.path().join("index.pcl"))
        .unwrap()
        .read_to_end(&mut bytes)
        .unwrap();
    assert!(bytes[HEADER_SIZE..].iter().all(|b| *b == 0));

    // Nothing can be written back, drop the pages on close
    cache.close_file(file_id, false).unwrap();
}

#[test]
fn test_fuzzy_checkpoint() {
    init_logging();
    let dir = tempdir().unwrap();
    let wal = Arc::new(MemoryWal::new());
    let cache =
        ReadWriteDiskCache::new(small_config(dir.path()), Some(wal.clone() as Arc<dyn WriteAheadLog>))
            .unwrap();
    let file_id = cache.open_file("index.pcl").unwrap();

    let lsn = wal.append();
    let mut handle = cache.load_for_write(file_id, 0).unwrap();
    handle.set_lsn(lsn);
    handle.release().unwrap();
    cache.flush_file(file_id).unwrap();

    cache.make_fuzzy_checkpoint().unwrap();
    let events = wal.events();
    let start = events
        .iter()
        .position(|e| matches!(e, WalEvent::CheckpointStart(_)))
        .unwrap();
    assert_eq!(
        &events[start..],
        &[
            WalEvent::CheckpointStart(lsn),
            WalEvent::CheckpointEnd,
            WalEvent::Flush(wal.end()),
            WalEvent::CutTill(lsn),
        ]
    );
}

#[test]
fn test_truncate_drops_every_page() {
    let dir = tempdir().unwrap();
    let cache = open(small_config(dir.path()));
    let file_id = cache.open_file("index.pcl").unwrap();

    for page in 0..20 {
        write_byte(&cache, file_id, page, 30, 1);
    }
    cache.truncate_file(file_id).unwrap();

    assert_eq!(cache.filled_up_to(file_id).unwrap(), 0);
    assert_eq!(cache.write_cache_pages(), 0);
    for page in 0..20 {
        assert_eq!(cache.residency(file_id, page), None);
    }

    // The file is still usable and starts out empty
    assert_eq!(cache.load(file_id, 0).unwrap().read()[30], 0);
}

#[test]
fn test_truncate_of_used_page_fails() {
    let dir = tempdir().unwrap();
    let cache = open(small_config(dir.path()));
    let file_id = cache.open_file("index.pcl").unwrap();

    let handle = cache.load_for_write(file_id, 0).unwrap();
    let result = thread::scope(|s| s.spawn(|| cache.truncate_file(file_id)).join().unwrap());
    assert!(matches!(
        result,
        Err(StorageError::PageInUse { page_index: 0, usages: 1, .. })
    ));
    assert!(matches!(
        cache.delete_file(file_id),
        Err(StorageError::PageInUse { .. })
    ));

    handle.release().unwrap();
    cache.truncate_file(file_id).unwrap();
}

#[test]
fn test_delete_and_reopen_keeps_id() {
    let dir = tempdir().unwrap();
    let cache = open(small_config(dir.path()));
    let file_id = cache.open_file("index.pcl").unwrap();
    write_byte(&cache, file_id, 0, 30, 1);

    cache.delete_file(file_id).unwrap();
    assert!(!dir.path().join("index.pcl").exists());
    assert!(!cache.exists("index.pcl"));
    assert!(matches!(cache.load(file_id, 0), Err(StorageError::FileNotOpen(_))));

    assert_eq!(cache.open_file("index.pcl").unwrap(), file_id);
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 0);
}

#[test]
fn test_file_ids_survive_restart() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (first, second) = {
        let cache = open(small_config(dir.path()));
        let first = cache.open_file("first.pcl")?;
        let second = cache.open_file("second.pcl")?;
        assert_ne!(first, second);
        (first, second)
    };

    let cache = open(small_config(dir.path()));
    assert_eq!(cache.file_id("second.pcl"), Some(second));
    assert!(!cache.is_open(second));
    assert_eq!(cache.open_file("first.pcl")?, first);
    assert_eq!(cache.file_name(first).as_deref(), Some("first.pcl"));

    let third = cache.open_file("third.pcl")?;
    assert!(third > second);
    Ok(())
}

#[test]
fn test_close_file_without_flush_drops_changes() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let cache = open(small_config(dir.path()));

    let kept = cache.open_file("kept.pcl")?;
    let dropped = cache.open_file("dropped.pcl")?;
    write_byte(&cache, kept, 0, 30, 1);
    write_byte(&cache, dropped, 0, 30, 1);

    cache.close_file(kept, true)?;
    cache.close_file(dropped, false)?;
    assert_eq!(cache.write_cache_pages(), 0);
    assert!(!cache.is_open(kept));

    let kept = cache.open_file("kept.pcl")?;
    let dropped = cache.open_file("dropped.pcl")?;
    assert_eq!(cache.load(kept, 0)?.read()[30], 1);
    assert_eq!(cache.load(dropped, 0)?.read()[30], 0);
    Ok(())
}

#[test]
fn test_rename_keeps_cached_pages() {
    let dir = tempdir().unwrap();
    let cache = open(small_config(dir.path()));
    let file_id = cache.open_file("old.pcl").unwrap();
    write_byte(&cache, file_id, 0, 30, 9);

    cache.rename_file(file_id, "old.pcl", "new.pcl").unwrap();
    assert!(cache.exists("new.pcl"));
    assert!(!cache.exists("old.pcl"));
    assert_eq!(cache.write_cache_pages(), 1);

    cache.flush_file(file_id).unwrap();
    assert!(dir.path().join("new.pcl").exists());
    assert!(matches!(
        cache.rename_file(file_id, "old.pcl", "other.pcl"),
        Err(StorageError::FileNotFound(_))
    ));
}

#[test]
fn test_softly_closed_flag_is_persisted() {
    let dir = tempdir().unwrap();
    let file_id = {
        let cache = open(small_config(dir.path()));
        let file_id = cache.open_file("index.pcl").unwrap();
        assert!(!cache.was_softly_closed(file_id).unwrap());
        cache.set_all_softly_closed(true).unwrap();
        file_id
    };

    let cache = open(small_config(dir.path()));
    cache.open_file("index.pcl").unwrap();
    assert!(cache.was_softly_closed(file_id).unwrap());
    cache.set_softly_closed(file_id, false).unwrap();
    assert!(!cache.was_softly_closed(file_id).unwrap());
}

#[test]
fn test_pinned_page_is_never_evicted() {
    let dir = tempdir().unwrap();
    let cache = open(small_config(dir.path()).with_percent_of_pinned_pages(50));
    let file_id = cache.open_file("index.pcl").unwrap();

    let handle = cache.load(file_id, 0).unwrap();
    assert!(cache.pin_page(&handle).unwrap());
    handle.release().unwrap();

    for page in 1..20 {
        touch(&cache, file_id, page);
    }
    assert_eq!(cache.residency(file_id, 0), Some(Residency::Pinned));
    assert_eq!(cache.max_size(), 4);

    // Quota is half of four pages
    let second = cache.load(file_id, 1).unwrap();
    assert!(cache.pin_page(&second).unwrap());
    let third = cache.load(file_id, 2).unwrap();
    assert!(!cache.pin_page(&third).unwrap());
}

#[test]
fn test_clear_flushes_and_empties() {
    let dir = tempdir().unwrap();
    let cache = open(small_config(dir.path()));
    let file_id = cache.open_file("index.pcl").unwrap();

    write_byte(&cache, file_id, 0, 30, 3);
    cache.clear().unwrap();
    assert_eq!(cache.residency(file_id, 0), None);
    assert_eq!(cache.used_memory(), 0);
    assert_eq!(cache.load(file_id, 0).unwrap().read()[30], 3);
}

#[test]
fn test_background_flush_drains_write_cache() {
    let dir = tempdir().unwrap();
    let config = small_config(dir.path())
        .with_page_flush_interval(Some(Duration::from_millis(5)))
        .with_write_group_ttl(Duration::ZERO);
    let cache = open(config);
    let file_id = cache.open_file("index.pcl").unwrap();

    for page in 0..48 {
        write_byte(&cache, file_id, page, 30, 1);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while cache.write_cache_pages() > 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(cache.write_cache_pages(), 0);
}

#[test]
fn test_concurrent_load_and_release() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 400;
    const PAGES: u64 = 64;

    let dir = tempdir().unwrap();
    let config = small_config(dir.path())
        .with_read_cache_max_memory(16 * PAGE_SIZE)
        .with_page_flush_interval(Some(Duration::from_millis(1)))
        .with_write_group_ttl(Duration::from_millis(2));
    let cache = open(config);
    let file_id = cache.open_file("index.pcl").unwrap();

    let writes: usize = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    let mut rng = rand::thread_rng();
                    let mut writes = 0usize;
                    for _ in 0..ROUNDS {
                        let page = rng.gen_range(0..PAGES);
                        if rng.gen_bool(0.5) {
                            let mut handle = cache.load_for_write(file_id, page).unwrap();
                            {
                                let mut bytes = handle.write();
                                let counter =
                                    u32::from_le_bytes(bytes[100..104].try_into().unwrap());
                                bytes[100..104].copy_from_slice(&(counter + 1).to_le_bytes());
                            }
                            handle.release().unwrap();
                            writes += 1;
                        } else {
                            let handle = cache.load(file_id, page).unwrap();
                            let _ = handle.read()[100];
                            handle.release().unwrap();
                        }
                    }
                    writes
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).sum()
    });

    cache.flush_buffer().unwrap();
    cache.clear().unwrap();

    let mut total = 0usize;
    for page in 0..PAGES {
        let handle = cache.load(file_id, page).unwrap();
        let bytes = handle.read();
        total += u32::from_le_bytes(bytes[100..104].try_into().unwrap()) as usize;
    }
    assert_eq!(total, writes);
    assert!(cache.check_stored_pages().unwrap().is_empty());
}
