//! Background flush worker
//!
//! Explicit flushes and file operations run on one thread. Callers submit
//! tasks through a bounded channel and may wait on the returned ticket.
//! Between requests the worker runs the periodic flush and fuzzy
//! checkpoints on their own timers. The pass forced by a full write cache
//! runs on the releasing thread instead, see
//! [`ReadWriteDiskCache::release`](super::ReadWriteDiskCache::release).

use super::write_cache::WriteCache;
use super::FileId;
use crate::{Result, StorageError};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What happens to a file once its queued pages are dealt with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileAction {
    Flush,
    Close { flush: bool },
    Truncate,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushTask {
    All,
    Checkpoint,
    File { file_id: FileId, action: FileAction },
}

enum Request {
    Task {
        task: FlushTask,
        done: Sender<Result<()>>,
    },
    Shutdown,
}

/// Completion of a submitted task.
pub(crate) struct FlushTicket {
    done: Receiver<Result<()>>,
}

impl FlushTicket {
    pub fn wait(self) -> Result<()> {
        // A dropped sender means the worker is gone.
        self.done.recv().unwrap_or(Err(StorageError::Closed))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FlushTimers {
    pub flush_interval: Option<Duration>,
    pub checkpoint_interval: Option<Duration>,
}

pub(crate) struct FlushWorker {
    requests: Sender<Request>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlushWorker {
    pub fn start(cache: Arc<WriteCache>, capacity: usize, timers: FlushTimers) -> Result<Self> {
        let (requests, receiver) = bounded(capacity.max(1));
        let handle = thread::Builder::new()
            .name("pagecache-flush".to_string())
            .spawn(move || run(cache, receiver, timers))?;

        debug!("Flush worker started with {:?}", timers);
        Ok(Self {
            requests,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn submit(&self, task: FlushTask) -> FlushTicket {
        let (done, receiver) = bounded(1);
        // On failure the request and its sender are dropped, so the
        // ticket resolves to `Closed`.
        let _ = self.requests.send(Request::Task { task, done });
        FlushTicket { done: receiver }
    }

    pub fn execute(&self, task: FlushTask) -> Result<()> {
        self.submit(task).wait()
    }

    /// Lets the worker finish queued tasks and joins it.
    pub fn stop(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = self.requests.send(Request::Shutdown);
            if handle.join().is_err() {
                error!("Flush worker panicked");
            }
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn next_deadline(interval: Option<Duration>, from: Instant) -> Option<Instant> {
    interval.map(|interval| from + interval)
}

fn run(cache: Arc<WriteCache>, requests: Receiver<Request>, timers: FlushTimers) {
    let now = Instant::now();
    let mut next_flush = next_deadline(timers.flush_interval, now);
    let mut next_checkpoint = next_deadline(timers.checkpoint_interval, now);

    loop {
        let deadline = match (next_flush, next_checkpoint) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let request = match deadline {
            Some(deadline) => match requests.recv_deadline(deadline) {
                Ok(request) => Some(request),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match requests.recv() {
                Ok(request) => Some(request),
                Err(_) => break,
            },
        };

        match request {
            Some(Request::Shutdown) => break,
            Some(Request::Task { task, done }) => {
                let result = cache.execute(task);
                if let Err(e) = &result {
                    debug!("Flush task {:?} failed: {}", task, e);
                }
                let _ = done.send(result);
            }
            None => {
                let now = Instant::now();
                if next_flush.is_some_and(|at| at <= now) {
                    if let Err(e) = cache.periodic_flush() {
                        error!("Periodic flush failed: {}", e);
                    }
                    next_flush = next_deadline(timers.flush_interval, Instant::now());
                }
                if next_checkpoint.is_some_and(|at| at <= now) {
                    if let Err(e) = cache.fuzzy_checkpoint() {
                        error!("Fuzzy checkpoint failed: {}", e);
                    }
                    next_checkpoint = next_deadline(timers.checkpoint_interval, Instant::now());
                }
            }
        }
    }

    debug!("Flush worker stopped");
}
