use std::fmt;
use std::io::IoSlice;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use super::frame::{FrameArena, StableCopy};
use super::limiter::{IoLimiter, IoStamp, Unlimited};
use super::options::PageCacheOptions;
use super::paged_file::{FileMapping, MapOptions, PagedFile};
use super::swapper::{PageSwapperFactory, StdSwapperFactory};
use super::table::{FAULTING, UNMAPPED};
use crate::primitives::concurrency::{Backoff, JobHandle, JobScheduler, ThreadJobScheduler};
use crate::trace::{NoopTracer, PageCacheTracer};
use crate::types::{CacheError, FileId, FrameId, PageId, Result};
use crate::version::{EmptyVersionContextSupplier, VersionContextSupplier};

/// Snapshot of frame usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total frames.
    pub capacity: usize,
    /// Frames on the free list.
    pub free: usize,
    /// Frames bound to a file page.
    pub resident: usize,
    /// Frames with at least one pin.
    pub pinned: usize,
    /// Bound frames with unflushed changes.
    pub dirty: usize,
    /// Files currently mapped.
    pub mapped_files: usize,
    /// True after a flush failure.
    pub degraded: bool,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capacity={} free={} resident={} pinned={} dirty={} files={}{}",
            self.capacity,
            self.free,
            self.resident,
            self.pinned,
            self.dirty,
            self.mapped_files,
            if self.degraded { " DEGRADED" } else { "" }
        )
    }
}

#[derive(Default)]
struct Registry {
    by_path: FxHashMap<PathBuf, Arc<FileMapping>>,
    by_id: FxHashMap<FileId, Arc<FileMapping>>,
    next_id: u32,
}

pub(crate) struct CacheInner {
    pub(crate) options: PageCacheOptions,
    pub(crate) arena: FrameArena,
    pub(crate) tracer: Arc<dyn PageCacheTracer>,
    pub(crate) contexts: Arc<dyn VersionContextSupplier>,
    swappers: Arc<dyn PageSwapperFactory>,
    eviction_limiter: Arc<dyn IoLimiter>,
    /// Stamp threaded through eviction write-backs on every thread.
    eviction_stamp: AtomicU64,
    registry: RwLock<Registry>,
    /// Serializes map, unmap and close.
    map_lock: Mutex<()>,
    evictor: Mutex<Option<Box<dyn JobHandle>>>,
    closed: AtomicBool,
    degraded: AtomicBool,
}

impl CacheInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.degraded.load(Ordering::Acquire) {
            return Err(CacheError::Degraded);
        }
        Ok(())
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            error!("pagecache.degraded");
        }
    }

    pub(crate) fn mapping(&self, id: FileId) -> Option<Arc<FileMapping>> {
        self.registry.read().by_id.get(&id).cloned()
    }

    fn mappings_by_id(&self) -> Vec<Arc<FileMapping>> {
        let mut mappings: Vec<_> = self.registry.read().by_id.values().cloned().collect();
        mappings.sort_by_key(|mapping| mapping.id);
        mappings
    }

    /// Accounts one eviction write-back with the eviction limiter.
    pub(crate) fn limit_eviction_io(&self) {
        let previous = IoStamp(self.eviction_stamp.load(Ordering::Acquire));
        let next = self.eviction_limiter.maybe_limit_io(previous, 1);
        self.eviction_stamp.fetch_max(next.0, Ordering::AcqRel);
    }

    pub(crate) fn wake_evictor(&self) {
        if let Some(job) = self.evictor.lock().as_ref() {
            job.trigger();
        }
    }

    // ---- mapping ----

    fn map_file(&self, path: &Path, page_size: usize, options: MapOptions) -> Result<Arc<FileMapping>> {
        self.ensure_usable()?;
        if page_size == 0 || page_size > self.arena.frame_size() {
            return Err(CacheError::Invalid(
                "file page size must be positive and no larger than the cache page size",
            ));
        }
        let _guard = self.map_lock.lock();
        if let Some(existing) = self.registry.read().by_path.get(path).cloned() {
            if existing.page_size != page_size {
                return Err(CacheError::MappingConflict {
                    path: path.to_path_buf(),
                    existing: existing.page_size,
                    requested: page_size,
                });
            }
            if options.truncate_existing {
                return Err(CacheError::Invalid("cannot truncate a file that is already mapped"));
            }
            existing.refs.fetch_add(1, Ordering::AcqRel);
            existing.reopen();
            return Ok(existing);
        }

        let swapper = self.swappers.open(path, page_size, options.create)?;
        if options.truncate_existing {
            swapper.truncate()?;
        }
        let last_page = swapper.last_page_id()?;
        let mut registry = self.registry.write();
        let id = FileId(registry.next_id);
        registry.next_id += 1;
        let mapping = Arc::new(FileMapping::new(
            id,
            path.to_path_buf(),
            page_size,
            swapper,
            last_page,
        ));
        registry.by_path.insert(path.to_path_buf(), Arc::clone(&mapping));
        registry.by_id.insert(id, Arc::clone(&mapping));
        drop(registry);
        self.tracer.mapped_file(path);
        info!(file = %path.display(), file_id = id.0, page_size, pages = ?last_page.map(|p| p.0 + 1), "pagecache.map");
        Ok(mapping)
    }

    pub(crate) fn unmap(&self, mapping: &Arc<FileMapping>) -> Result<()> {
        let _guard = self.map_lock.lock();
        self.ensure_open()?;
        if mapping.refs.fetch_sub(1, Ordering::AcqRel) > 1 {
            return Ok(());
        }
        // Zero references from here on. On failure the mapping stays
        // registered and is picked up again by `map` or released by `close`.
        self.ensure_usable()?;
        mapping.mark_unmapped();
        let released = self
            .flush_mapping(mapping, &Unlimited)
            .and_then(|()| self.evict_file(mapping))
            .and_then(|()| self.force_mapping(mapping));
        if let Err(err) = released {
            mapping.reopen();
            return Err(err);
        }
        let mut registry = self.registry.write();
        registry.by_path.remove(&mapping.path);
        registry.by_id.remove(&mapping.id);
        drop(registry);
        self.tracer.unmapped_file(&mapping.path);
        info!(file = %mapping.path.display(), file_id = mapping.id.0, "pagecache.unmap");
        Ok(())
    }

    // ---- pinning and faulting ----

    /// Pins the frame holding `page`, faulting it in when absent.
    pub(crate) fn pin(&self, mapping: &FileMapping, page: PageId, no_fault: bool) -> Result<FrameId> {
        let mut backoff = Backoff::new();
        loop {
            match mapping.table.get(page) {
                UNMAPPED => {
                    if no_fault {
                        return Err(CacheError::NoFault(page));
                    }
                    if mapping.is_unmapped() {
                        return Err(CacheError::Closed);
                    }
                    if mapping
                        .table
                        .compare_exchange(page, UNMAPPED, FAULTING)
                        .is_ok()
                    {
                        return self.fault(mapping, page);
                    }
                }
                FAULTING => backoff.snooze(),
                entry => {
                    let frame_id = FrameId(entry);
                    let frame = self.arena.frame(frame_id);
                    if frame.try_pin() {
                        if frame.is_bound_to(mapping.id, page) {
                            // Pairs with the fence in `close`: either close counts
                            // this pin or this thread sees the cache closed.
                            fence(Ordering::SeqCst);
                            if self.is_closed() {
                                frame.unpin();
                                return Err(CacheError::Closed);
                            }
                            frame.mark_referenced();
                            self.tracer.hit();
                            return Ok(frame_id);
                        }
                        frame.unpin();
                    }
                    backoff.snooze();
                }
            }
        }
    }

    /// Loads `page` into a fresh frame. The caller owns the FAULTING entry.
    fn fault(&self, mapping: &FileMapping, page: PageId) -> Result<FrameId> {
        // Close counts FAULTING entries as pins; see `pin`.
        fence(Ordering::SeqCst);
        let frame_id = match self.ensure_usable().and_then(|()| self.acquire_frame()) {
            Ok(frame_id) => frame_id,
            Err(err) => {
                self.abandon_fault(mapping, page);
                return Err(err);
            }
        };
        let frame = self.arena.frame(frame_id);
        let mut buf = vec![0u8; self.arena.frame_size()];
        let read = match mapping.swapper.read(page, &mut buf[..mapping.page_size]) {
            Ok(read) => read,
            Err(err) => {
                self.arena.push_free(frame_id);
                self.abandon_fault(mapping, page);
                self.tracer.fault_failed();
                debug!(file = %mapping.path.display(), page = page.0, error = %err, "pagecache.fault.failed");
                return Err(CacheError::PageFault {
                    path: mapping.path.clone(),
                    page,
                    source: err.into_io_error(),
                });
            }
        };
        frame.copy_in(0, &buf);
        frame.bind(mapping.id, page);
        frame.publish_pinned();
        let published = mapping.table.compare_exchange(page, FAULTING, frame_id.0);
        debug_assert!(published.is_ok(), "faulting entry changed under its owner");
        self.tracer.fault(read as u64);
        if self.arena.free_len() < self.options.keep_free {
            self.wake_evictor();
        }
        Ok(frame_id)
    }

    fn abandon_fault(&self, mapping: &FileMapping, page: PageId) {
        let reset = mapping.table.compare_exchange(page, FAULTING, UNMAPPED);
        debug_assert!(reset.is_ok(), "faulting entry changed under its owner");
    }

    /// Takes a free frame, evicting one on this thread when the free list is empty.
    fn acquire_frame(&self) -> Result<FrameId> {
        for _ in 0..2 {
            if let Some(frame_id) = self.arena.pop_free() {
                return Ok(frame_id);
            }
            self.wake_evictor();
            if let Some(frame_id) = self.evict_one()? {
                return Ok(frame_id);
            }
        }
        warn!(capacity = self.arena.capacity(), "pagecache.exhausted");
        Err(CacheError::CacheExhausted {
            capacity: self.arena.capacity(),
        })
    }

    // ---- flushing ----

    /// Writes back every dirty page of `mapping` in ascending page order.
    pub(crate) fn flush_mapping(&self, mapping: &FileMapping, limiter: &dyn IoLimiter) -> Result<()> {
        let dirty: Vec<(PageId, FrameId)> = mapping
            .table
            .resident()
            .into_iter()
            .filter(|(_, frame_id)| self.arena.frame(*frame_id).is_dirty())
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        let mut runs = RunFlusher::new(self, mapping, limiter);
        for (page, frame_id) in dirty {
            runs.add(page, frame_id)?;
        }
        runs.finish()
    }

    pub(crate) fn force_mapping(&self, mapping: &FileMapping) -> Result<()> {
        mapping.swapper.force().map_err(|err| {
            self.mark_degraded();
            warn!(file = %mapping.path.display(), error = %err, "pagecache.force.failed");
            CacheError::FlushFailed {
                path: mapping.path.clone(),
                page: mapping.last_page_id().unwrap_or(PageId(0)),
                source: err.into_io_error(),
            }
        })
    }

    fn flush_all(&self, limiter: &dyn IoLimiter) -> Result<()> {
        let mappings = self.mappings_by_id();
        for mapping in &mappings {
            self.flush_mapping(mapping, limiter)?;
        }
        for mapping in &mappings {
            self.force_mapping(mapping)?;
        }
        Ok(())
    }

    // ---- lifecycle ----

    /// Pinned frames plus pages being faulted in.
    fn outstanding_pins(&self) -> usize {
        let pinned = self
            .arena
            .frames()
            .filter(|(_, frame)| frame.pin_count() > 0)
            .count();
        let faulting: usize = self
            .registry
            .read()
            .by_id
            .values()
            .map(|mapping| mapping.table.faulting())
            .sum();
        pinned + faulting
    }

    fn close(&self) -> Result<()> {
        let _guard = self.map_lock.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Cursors re-check `closed` after pinning, so past this fence no new
        // pin can survive unnoticed.
        fence(Ordering::SeqCst);
        let outstanding = self.outstanding_pins();
        if outstanding > 0 {
            self.closed.store(false, Ordering::SeqCst);
            return Err(CacheError::PinsOutstanding(outstanding));
        }
        let evictor = self.evictor.lock().take();
        if let Some(job) = evictor {
            job.cancel();
        }
        let flushed = if self.is_degraded() {
            warn!("pagecache.close.degraded_skip_flush");
            Ok(())
        } else {
            self.flush_all(&Unlimited)
        };
        let registry = std::mem::take(&mut *self.registry.write());
        let mut discarded = 0;
        for mapping in registry.by_id.values() {
            mapping.mark_unmapped();
            discarded += self.release_file(mapping);
            self.tracer.unmapped_file(&mapping.path);
        }
        if discarded > 0 {
            warn!(pages = discarded, "pagecache.close.discarded_dirty");
        }
        info!(files = registry.by_id.len(), ok = flushed.is_ok(), "pagecache.close");
        flushed
    }

    fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            capacity: self.arena.capacity(),
            free: self.arena.free_len(),
            mapped_files: self.registry.read().by_id.len(),
            degraded: self.is_degraded(),
            ..CacheStats::default()
        };
        for (_, frame) in self.arena.frames() {
            if frame.binding().is_some() {
                stats.resident += 1;
                if frame.is_dirty() {
                    stats.dirty += 1;
                }
            }
            if frame.pin_count() > 0 {
                stats.pinned += 1;
            }
        }
        stats
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Some(job) = self.evictor.get_mut().take() {
            job.cancel();
        }
    }
}

/// Groups consecutive dirty pages into vectored writes.
struct RunFlusher<'a> {
    cache: &'a CacheInner,
    mapping: &'a FileMapping,
    limiter: &'a dyn IoLimiter,
    stamp: IoStamp,
    first: PageId,
    frames: Vec<FrameId>,
    buf: Vec<u8>,
}

impl<'a> RunFlusher<'a> {
    fn new(cache: &'a CacheInner, mapping: &'a FileMapping, limiter: &'a dyn IoLimiter) -> Self {
        Self {
            cache,
            mapping,
            limiter,
            stamp: IoStamp::INITIAL,
            first: PageId(0),
            frames: Vec::new(),
            buf: Vec::new(),
        }
    }

    fn add(&mut self, page: PageId, frame_id: FrameId) -> Result<()> {
        let extends_run = self.first.0 + self.frames.len() as u64 == page.0
            && self.frames.len() < self.cache.options.flush_batch_pages;
        if !self.frames.is_empty() && !extends_run {
            self.flush_run()?;
        }
        let frame = self.cache.arena.frame(frame_id);
        // A frame that cannot be pinned is being evicted, and eviction writes it back.
        if !frame.try_pin() {
            return Ok(());
        }
        if !frame.is_bound_to(self.mapping.id, page) || !frame.is_dirty() {
            frame.unpin();
            return Ok(());
        }
        let start = self.buf.len();
        self.buf.resize(start + self.mapping.page_size, 0);
        if frame.copy_stable(&mut self.buf[start..]) == StableCopy::HeldByCaller {
            self.buf.truncate(start);
            frame.unpin();
            warn!(file = %self.mapping.path.display(), page = page.0, "pagecache.flush.own_write_lock");
            return Err(CacheError::WriteLockedByCaller(page));
        }
        if self.frames.is_empty() {
            self.first = page;
        }
        self.frames.push(frame_id);
        Ok(())
    }

    fn flush_run(&mut self) -> Result<()> {
        if self.frames.is_empty() {
            return Ok(());
        }
        let cache = self.cache;
        let mut event = cache.tracer.begin_flush(&self.mapping.path);
        let written = {
            let slices: Vec<IoSlice<'_>> = self
                .buf
                .chunks(self.mapping.page_size)
                .map(IoSlice::new)
                .collect();
            self.mapping.swapper.write_run(self.first, &slices)
        };
        let pages = self.frames.len();
        let result = match written {
            Ok(()) => {
                event.add_pages_flushed(pages);
                event.add_bytes_written(self.buf.len() as u64);
                event.done();
                self.release(false);
                self.stamp = self.limiter.maybe_limit_io(self.stamp, 1);
                Ok(())
            }
            Err(err) => {
                self.release(true);
                let err = CacheError::FlushFailed {
                    path: self.mapping.path.clone(),
                    page: self.first,
                    source: err.into_io_error(),
                };
                event.failed(&err);
                cache.mark_degraded();
                warn!(file = %self.mapping.path.display(), page = self.first.0, pages, error = %err, "pagecache.flush.failed");
                Err(err)
            }
        };
        self.buf.clear();
        result
    }

    fn release(&mut self, redirty: bool) {
        for frame_id in self.frames.drain(..) {
            let frame = self.cache.arena.frame(frame_id);
            if redirty {
                frame.set_dirty();
            }
            frame.unpin();
        }
    }

    fn finish(mut self) -> Result<()> {
        self.flush_run()
    }
}

impl Drop for RunFlusher<'_> {
    fn drop(&mut self) {
        self.release(true);
    }
}

/// Builds a [`PageCache`] with injected collaborators.
pub struct PageCacheBuilder {
    options: PageCacheOptions,
    swappers: Arc<dyn PageSwapperFactory>,
    tracer: Arc<dyn PageCacheTracer>,
    contexts: Arc<dyn VersionContextSupplier>,
    scheduler: Arc<dyn JobScheduler>,
    eviction_limiter: Arc<dyn IoLimiter>,
}

impl PageCacheBuilder {
    fn new(options: PageCacheOptions) -> Self {
        Self {
            options,
            swappers: Arc::new(StdSwapperFactory),
            tracer: Arc::new(NoopTracer),
            contexts: Arc::new(EmptyVersionContextSupplier::default()),
            scheduler: Arc::new(ThreadJobScheduler::new()),
            eviction_limiter: Arc::new(Unlimited),
        }
    }

    /// Sets the factory used to open mapped files (default: real files).
    pub fn swapper_factory(mut self, swappers: Arc<dyn PageSwapperFactory>) -> Self {
        self.swappers = swappers;
        self
    }

    /// Sets the event sink (default: no-op).
    pub fn tracer(mut self, tracer: Arc<dyn PageCacheTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Sets where cursors get their version context (default: empty contexts).
    pub fn version_contexts(mut self, contexts: Arc<dyn VersionContextSupplier>) -> Self {
        self.contexts = contexts;
        self
    }

    /// Sets the scheduler running the background evictor (default: one thread).
    pub fn scheduler(mut self, scheduler: Arc<dyn JobScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Sets the limiter throttling eviction write-backs (default: unlimited).
    pub fn eviction_limiter(mut self, limiter: Arc<dyn IoLimiter>) -> Self {
        self.eviction_limiter = limiter;
        self
    }

    /// Allocates the frames and starts the evictor.
    pub fn build(self) -> Result<PageCache> {
        self.options.validate()?;
        let inner = Arc::new(CacheInner {
            arena: FrameArena::new(self.options.max_pages, self.options.page_size),
            tracer: self.tracer,
            contexts: self.contexts,
            swappers: self.swappers,
            eviction_limiter: self.eviction_limiter,
            eviction_stamp: AtomicU64::new(IoStamp::INITIAL.0),
            registry: RwLock::new(Registry::default()),
            map_lock: Mutex::new(()),
            evictor: Mutex::new(None),
            closed: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            options: self.options,
        });
        if inner.options.background_eviction {
            let weak: Weak<CacheInner> = Arc::downgrade(&inner);
            let job = self.scheduler.schedule_recurring(
                "pagecache-evictor",
                inner.options.eviction_period_duration(),
                Arc::new(move || {
                    if let Some(cache) = weak.upgrade() {
                        cache.run_background_eviction();
                    }
                }),
            )?;
            *inner.evictor.lock() = Some(job);
        }
        info!(
            max_pages = inner.options.max_pages,
            page_size = inner.options.page_size,
            background_eviction = inner.options.background_eviction,
            "pagecache.open"
        );
        Ok(PageCache { inner })
    }
}

/// Fixed-size buffer pool over mapped files.
pub struct PageCache {
    inner: Arc<CacheInner>,
}

impl PageCache {
    /// Starts building a cache with `options`.
    pub fn builder(options: PageCacheOptions) -> PageCacheBuilder {
        PageCacheBuilder::new(options)
    }

    /// Opens a cache over real files with default collaborators.
    pub fn open(options: PageCacheOptions) -> Result<Self> {
        Self::builder(options).build()
    }

    /// Maps `path` with `page_size`. Mapping an already mapped file with the
    /// same page size returns another handle on the same mapping.
    pub fn map(&self, path: impl AsRef<Path>, page_size: usize, options: MapOptions) -> Result<PagedFile> {
        let mapping = self.inner.map_file(path.as_ref(), page_size, options)?;
        Ok(PagedFile::new(Arc::clone(&self.inner), mapping))
    }

    /// Flushes every dirty page of every mapped file in (file, page) order,
    /// then forces all files.
    pub fn flush_and_force(&self, limiter: &dyn IoLimiter) -> Result<()> {
        self.inner.ensure_usable()?;
        self.inner.flush_all(limiter)
    }

    /// Flushes every file and returns all frames to the free list. Fails, leaving
    /// the cache open, while cursors still hold pins.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Evicts up to `count` frames on the calling thread; returns how many were evicted.
    pub fn evict(&self, count: usize) -> Result<usize> {
        self.inner.ensure_usable()?;
        let mut evicted = 0;
        while evicted < count {
            match self.inner.evict_one()? {
                Some(frame_id) => {
                    self.inner.arena.push_free(frame_id);
                    evicted += 1;
                }
                None => break,
            }
        }
        Ok(evicted)
    }

    /// Current frame usage.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }

    /// Frame size in bytes.
    pub fn page_size(&self) -> usize {
        self.inner.arena.frame_size()
    }

    /// Number of frames.
    pub fn max_pages(&self) -> usize {
        self.inner.arena.capacity()
    }

    /// True after a flush failure; the cache must be closed and re-opened.
    pub fn is_degraded(&self) -> bool {
        self.inner.is_degraded()
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(err) = self.inner.close() {
            warn!(error = %err, "pagecache.drop.close_failed");
        }
    }
}

impl fmt::Debug for PageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCache")
            .field("options", &self.inner.options)
            .field("stats", &self.inner.stats())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}
