//! Passive observability hooks for the page cache.
//!
//! The cache reports page faults, evictions and flushes to a [`PageCacheTracer`].
//! Tracers never influence cache behaviour; they only count.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::CacheError;

/// Progress of one flush operation (a page run written back to its file).
pub trait FlushEvent: Send {
    /// Adds bytes written to the backing file.
    fn add_bytes_written(&mut self, bytes: u64);
    /// Adds pages flushed by this event.
    fn add_pages_flushed(&mut self, pages: usize);
    /// The flush completed successfully.
    fn done(self: Box<Self>);
    /// The flush failed with `error`.
    fn failed(self: Box<Self>, error: &CacheError);
}

/// Receives page cache events.
pub trait PageCacheTracer: Send + Sync {
    /// A file was mapped for the first time.
    fn mapped_file(&self, _path: &Path) {}
    /// The last mapping of a file was released.
    fn unmapped_file(&self, _path: &Path) {}
    /// A cursor pinned a resident page.
    fn hit(&self) {}
    /// A page was faulted in, reading `bytes` from storage.
    fn fault(&self, _bytes: u64) {}
    /// A page fault failed.
    fn fault_failed(&self) {}
    /// A frame was evicted.
    fn evicted(&self) {}
    /// Evicting a frame failed while writing it back.
    fn eviction_failed(&self) {}
    /// A sweep of the eviction controller started.
    fn eviction_run(&self) {}
    /// Begins a flush of pages of `path`.
    fn begin_flush(&self, path: &Path) -> Box<dyn FlushEvent + '_>;
}

/// Flush event that ignores everything.
pub struct NoopFlushEvent;

impl FlushEvent for NoopFlushEvent {
    fn add_bytes_written(&mut self, _bytes: u64) {}
    fn add_pages_flushed(&mut self, _pages: usize) {}
    fn done(self: Box<Self>) {}
    fn failed(self: Box<Self>, _error: &CacheError) {}
}

/// Tracer that discards all events.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoopTracer;

impl PageCacheTracer for NoopTracer {
    fn begin_flush(&self, _path: &Path) -> Box<dyn FlushEvent + '_> {
        Box::new(NoopFlushEvent)
    }
}

/// Thread-safe tracer backed by atomic counters.
#[derive(Default, Debug)]
pub struct CountingTracer {
    mapped_files: AtomicU64,
    unmapped_files: AtomicU64,
    hits: AtomicU64,
    faults: AtomicU64,
    bytes_read: AtomicU64,
    fault_failures: AtomicU64,
    evictions: AtomicU64,
    eviction_failures: AtomicU64,
    eviction_runs: AtomicU64,
    flushes: AtomicU64,
    pages_flushed: AtomicU64,
    bytes_written: AtomicU64,
    flush_failures: AtomicU64,
}

/// Point-in-time copy of [`CountingTracer`] counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerSnapshot {
    /// Files mapped.
    pub mapped_files: u64,
    /// Files unmapped.
    pub unmapped_files: u64,
    /// Pins served from resident frames.
    pub hits: u64,
    /// Completed page faults.
    pub faults: u64,
    /// Bytes read by page faults.
    pub bytes_read: u64,
    /// Failed page faults.
    pub fault_failures: u64,
    /// Evicted frames.
    pub evictions: u64,
    /// Evictions that failed to write back.
    pub eviction_failures: u64,
    /// Eviction sweeps.
    pub eviction_runs: u64,
    /// Completed flush events.
    pub flushes: u64,
    /// Pages written by flushes.
    pub pages_flushed: u64,
    /// Bytes written by flushes.
    pub bytes_written: u64,
    /// Failed flush events.
    pub flush_failures: u64,
}

impl CountingTracer {
    /// Creates a tracer with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> TracerSnapshot {
        TracerSnapshot {
            mapped_files: self.mapped_files.load(Ordering::Relaxed),
            unmapped_files: self.unmapped_files.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            fault_failures: self.fault_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            eviction_failures: self.eviction_failures.load(Ordering::Relaxed),
            eviction_runs: self.eviction_runs.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            pages_flushed: self.pages_flushed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

struct CountingFlushEvent<'a> {
    tracer: &'a CountingTracer,
    bytes: u64,
    pages: usize,
}

impl FlushEvent for CountingFlushEvent<'_> {
    fn add_bytes_written(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    fn add_pages_flushed(&mut self, pages: usize) {
        self.pages += pages;
    }

    fn done(self: Box<Self>) {
        let tracer = self.tracer;
        tracer.flushes.fetch_add(1, Ordering::Relaxed);
        tracer
            .pages_flushed
            .fetch_add(self.pages as u64, Ordering::Relaxed);
        tracer.bytes_written.fetch_add(self.bytes, Ordering::Relaxed);
    }

    fn failed(self: Box<Self>, _error: &CacheError) {
        self.tracer.flush_failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl PageCacheTracer for CountingTracer {
    fn mapped_file(&self, _path: &Path) {
        self.mapped_files.fetch_add(1, Ordering::Relaxed);
    }

    fn unmapped_file(&self, _path: &Path) {
        self.unmapped_files.fetch_add(1, Ordering::Relaxed);
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn fault(&self, bytes: u64) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    fn fault_failed(&self) {
        self.fault_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn eviction_failed(&self) {
        self.eviction_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn eviction_run(&self) {
        self.eviction_runs.fetch_add(1, Ordering::Relaxed);
    }

    fn begin_flush(&self, _path: &Path) -> Box<dyn FlushEvent + '_> {
        Box::new(CountingFlushEvent {
            tracer: self,
            bytes: 0,
            pages: 0,
        })
    }
}

impl fmt::Display for TracerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} faults={} evictions={} flushes={} pages_flushed={} bytes_written={} failures={}",
            self.hits,
            self.faults,
            self.evictions,
            self.flushes,
            self.pages_flushed,
            self.bytes_written,
            self.fault_failures + self.eviction_failures + self.flush_failures
        )
    }
}
