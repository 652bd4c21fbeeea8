//! Write-ahead log seam
//!
//! The cache never writes log records of its own except checkpoint markers.
//! It only needs to know how far the log is durable and to force it further
//! before a page that depends on unflushed records hits the disk.

use crate::page::Lsn;
use crate::Result;
use parking_lot::Mutex;
use std::time::Duration;

pub trait WriteAheadLog: Send + Sync {
    /// Last LSN known to be on stable storage, `None` before the first flush.
    fn flushed_lsn(&self) -> Option<Lsn>;

    /// Makes every record logged so far durable.
    fn flush(&self) -> Result<()>;

    fn log_fuzzy_checkpoint_start(&self, flushed_lsn: Lsn) -> Result<Lsn>;

    fn log_fuzzy_checkpoint_end(&self) -> Result<Lsn>;

    /// Drops log records older than `lsn`.
    fn cut_till(&self, lsn: Lsn) -> Result<()>;
}

/// Events recorded by [`MemoryWal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEvent {
    Flush(Lsn),
    CheckpointStart(Lsn),
    CheckpointEnd,
    CutTill(Lsn),
}

#[derive(Debug, Default)]
struct MemoryWalState {
    end: Lsn,
    flushed: Option<Lsn>,
    events: Vec<WalEvent>,
}

/// In-memory log that only tracks positions.
///
/// Records are never stored, `append` just advances the end of the log.
/// A flush delay makes it usable as a slow log in ordering tests.
#[derive(Debug, Default)]
pub struct MemoryWal {
    state: Mutex<MemoryWalState>,
    flush_delay: Option<Duration>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flush_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryWalState::default()),
            flush_delay: Some(delay),
        }
    }

    /// Logs a record and returns its LSN.
    pub fn append(&self) -> Lsn {
        let mut state = self.state.lock();
        state.end.position += 1;
        state.end
    }

    /// Moves to a new segment and returns the LSN of its first record.
    pub fn next_segment(&self) -> Lsn {
        let mut state = self.state.lock();
        state.end = Lsn::new(state.end.segment + 1, 0);
        state.end
    }

    pub fn end(&self) -> Lsn {
        self.state.lock().end
    }

    pub fn events(&self) -> Vec<WalEvent> {
        self.state.lock().events.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, WalEvent::Flush(_)))
            .count()
    }
}

impl WriteAheadLog for MemoryWal {
    fn flushed_lsn(&self) -> Option<Lsn> {
        self.state.lock().flushed
    }

    fn flush(&self) -> Result<()> {
        if let Some(delay) = self.flush_delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        let end = state.end;
        state.flushed = Some(end);
        state.events.push(WalEvent::Flush(end));
        Ok(())
    }

    fn log_fuzzy_checkpoint_start(&self, flushed_lsn: Lsn) -> Result<Lsn> {
        let mut state = self.state.lock();
        state.end.position += 1;
        state.events.push(WalEvent::CheckpointStart(flushed_lsn));
        Ok(state.end)
    }

    fn log_fuzzy_checkpoint_end(&self) -> Result<Lsn> {
        let mut state = self.state.lock();
        state.end.position += 1;
        state.events.push(WalEvent::CheckpointEnd);
        Ok(state.end)
    }

    fn cut_till(&self, lsn: Lsn) -> Result<()> {
        self.state.lock().events.push(WalEvent::CutTill(lsn));
        Ok(())
    }
}
