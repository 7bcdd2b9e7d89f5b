//! Clock-sweep eviction, shared by the background evictor, faulting threads
//! and file unmapping.

use tracing::{debug, error, warn};

use super::cache::CacheInner;
use super::frame::Frame;
use super::paged_file::FileMapping;
use super::table::{FAULTING, UNMAPPED};
use crate::primitives::concurrency::Backoff;
use crate::types::{CacheError, FrameId, PageId, Result};

impl CacheInner {
    /// Runs the clock for at most two rotations and evicts the first frame
    /// that is unpinned and was not referenced since the hand last passed.
    ///
    /// The evicted frame is returned claimed and unbound; the caller either
    /// keeps it or pushes it onto the free list.
    pub(crate) fn evict_one(&self) -> Result<Option<FrameId>> {
        let rotations = self.arena.capacity() * 2;
        for _ in 0..rotations {
            let frame_id = self.arena.tick();
            let frame = self.arena.frame(frame_id);
            if frame.is_claimed() || frame.pin_count() > 0 {
                continue;
            }
            let Some((file, page)) = frame.binding() else {
                continue;
            };
            if frame.take_reference() {
                continue;
            }
            let Some(mapping) = self.mapping(file) else {
                continue;
            };
            if !frame.try_claim() {
                continue;
            }
            if !frame.is_bound_to(file, page) {
                frame.unclaim();
                continue;
            }
            if let Err(err) = self.write_back(&mapping, page, frame) {
                frame.unclaim();
                self.tracer.eviction_failed();
                self.mark_degraded();
                warn!(file = %mapping.path.display(), page = page.0, error = %err, "pagecache.evict.flush_failed");
                return Err(err);
            }
            self.detach(&mapping, page, frame_id, frame);
            return Ok(Some(frame_id));
        }
        Ok(None)
    }

    /// Writes a claimed frame back if it is dirty, then lets the eviction
    /// limiter account for the write.
    fn write_back(&self, mapping: &FileMapping, page: PageId, frame: &Frame) -> Result<()> {
        if !frame.is_dirty() {
            return Ok(());
        }
        let mut buf = vec![0u8; mapping.page_size];
        frame.copy_out(0, &mut buf);
        let mut event = self.tracer.begin_flush(&mapping.path);
        match mapping.swapper.write(page, &buf) {
            Ok(()) => {
                frame.take_dirty();
                event.add_pages_flushed(1);
                event.add_bytes_written(buf.len() as u64);
                event.done();
                self.limit_eviction_io();
                Ok(())
            }
            Err(err) => {
                let err = CacheError::FlushFailed {
                    path: mapping.path.clone(),
                    page,
                    source: err.into_io_error(),
                };
                event.failed(&err);
                Err(err)
            }
        }
    }

    /// Unlinks a claimed, clean frame from its page.
    fn detach(&self, mapping: &FileMapping, page: PageId, frame_id: FrameId, frame: &Frame) {
        unlink(mapping, page, frame_id, frame);
        self.tracer.evicted();
    }

    /// Moves every frame of `mapping` onto the free list without writing it
    /// back; returns how many of them were still dirty.
    ///
    /// Only for a closed cache: pins that appear here belong to cursors that
    /// lost the race with `close` and are about to drop them.
    pub(crate) fn release_file(&self, mapping: &FileMapping) -> usize {
        let mut discarded = 0;
        for (page, _) in mapping.table.resident() {
            let mut backoff = Backoff::new();
            loop {
                let entry = mapping.table.get(page);
                if entry == UNMAPPED || entry == FAULTING {
                    break;
                }
                let frame_id = FrameId(entry);
                let frame = self.arena.frame(frame_id);
                if !frame.try_claim() {
                    backoff.snooze();
                    continue;
                }
                if !frame.is_bound_to(mapping.id, page) {
                    frame.unclaim();
                    continue;
                }
                if frame.is_dirty() {
                    discarded += 1;
                }
                unlink(mapping, page, frame_id, frame);
                self.arena.push_free(frame_id);
                break;
            }
        }
        discarded
    }

    /// Evicts every page of `mapping` onto the free list.
    ///
    /// Fails with `PinsOutstanding` when cursors still hold pages of the file;
    /// the unpinned pages are evicted regardless.
    pub(crate) fn evict_file(&self, mapping: &FileMapping) -> Result<()> {
        let mut pinned = mapping.table.faulting();
        for (page, _) in mapping.table.resident() {
            let mut backoff = Backoff::new();
            loop {
                let entry = mapping.table.get(page);
                if entry == UNMAPPED || entry == FAULTING {
                    break;
                }
                let frame_id = FrameId(entry);
                let frame = self.arena.frame(frame_id);
                if frame.try_claim() {
                    if !frame.is_bound_to(mapping.id, page) {
                        frame.unclaim();
                        continue;
                    }
                    if let Err(err) = self.write_back(mapping, page, frame) {
                        frame.unclaim();
                        self.mark_degraded();
                        return Err(err);
                    }
                    self.detach(mapping, page, frame_id, frame);
                    self.arena.push_free(frame_id);
                    break;
                }
                if frame.pin_count() > 0 {
                    pinned += 1;
                    break;
                }
                // Claimed by a concurrent evictor that will unlink it.
                backoff.snooze();
            }
        }
        if pinned > 0 {
            return Err(CacheError::PinsOutstanding(pinned));
        }
        Ok(())
    }

    /// One run of the background evictor: refill the free list up to `keep_free`.
    pub(crate) fn run_background_eviction(&self) {
        if self.is_closed() || self.is_degraded() {
            return;
        }
        self.tracer.eviction_run();
        let mut evicted = 0usize;
        while self.arena.free_len() < self.options.keep_free {
            match self.evict_one() {
                Ok(Some(frame_id)) => {
                    self.arena.push_free(frame_id);
                    evicted += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "pagecache.evictor.failed");
                    break;
                }
            }
        }
        if evicted > 0 {
            debug!(evicted, free = self.arena.free_len(), "pagecache.evictor.run");
        }
    }
}

fn unlink(mapping: &FileMapping, page: PageId, frame_id: FrameId, frame: &Frame) {
    let unlinked = mapping.table.compare_exchange(page, frame_id.0, UNMAPPED);
    debug_assert!(unlinked.is_ok(), "translation entry changed under a frame claim");
    frame.unbind();
}
