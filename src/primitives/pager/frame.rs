use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::primitives::concurrency::Backoff;
use crate::types::{FileId, FrameId, PageId};

const UNBOUND_FILE: u32 = u32::MAX;
const CLAIMED: u32 = 1 << 31;
const PIN_MASK: u32 = CLAIMED - 1;
const NO_WRITER: u64 = 0;

static NEXT_WRITER_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static WRITER_TOKEN: u64 = NEXT_WRITER_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Nonzero id of the calling thread, recorded while it holds a write lock.
fn writer_token() -> u64 {
    WRITER_TOKEN.with(|token| *token)
}

/// Outcome of [`Frame::copy_stable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StableCopy {
    /// The bytes were copied at one stable version and the dirty bit cleared.
    Copied,
    /// The calling thread holds the write lock; nothing was copied.
    HeldByCaller,
}

/// One page-sized buffer plus the metadata that ties it to a file page.
///
/// The `state` word packs the pin count with a CLAIMED bit. A claimed frame is
/// owned by exactly one thread (a faulter, an evictor or the free list) and
/// cannot be pinned. `version` is the seqlock counter: odd while a writer holds
/// the frame, and `writer` then names the holding thread.
pub struct Frame {
    version: AtomicU64,
    writer: AtomicU64,
    state: AtomicU32,
    file: AtomicU32,
    page: AtomicU64,
    dirty: AtomicBool,
    reference: AtomicBool,
    last_modifier: AtomicU64,
    buf: Box<[AtomicU8]>,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            version: AtomicU64::new(0),
            writer: AtomicU64::new(NO_WRITER),
            state: AtomicU32::new(CLAIMED),
            file: AtomicU32::new(UNBOUND_FILE),
            page: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            reference: AtomicBool::new(false),
            last_modifier: AtomicU64::new(0),
            buf: (0..page_size).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    // ---- pin / claim ----

    /// Adds a pin unless the frame is claimed.
    pub fn try_pin(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & CLAIMED != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn unpin(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & PIN_MASK > 0, "unpin of an unpinned frame");
    }

    pub fn pin_count(&self) -> u32 {
        self.state.load(Ordering::Acquire) & PIN_MASK
    }

    pub fn is_claimed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLAIMED != 0
    }

    /// Takes exclusive ownership of an unpinned frame.
    pub fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(0, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Gives up a claim without pinning.
    pub fn unclaim(&self) {
        self.state.store(0, Ordering::Release);
    }

    /// Turns the caller's claim into a single pin.
    pub fn publish_pinned(&self) {
        self.state.store(1, Ordering::Release);
    }

    // ---- binding ----

    pub fn binding(&self) -> Option<(FileId, PageId)> {
        let file = self.file.load(Ordering::Acquire);
        if file == UNBOUND_FILE {
            return None;
        }
        Some((FileId(file), PageId(self.page.load(Ordering::Acquire))))
    }

    pub fn is_bound_to(&self, file: FileId, page: PageId) -> bool {
        self.binding() == Some((file, page))
    }

    /// Tags the frame with a file page. Caller must hold the claim.
    pub fn bind(&self, file: FileId, page: PageId) {
        self.page.store(page.0, Ordering::Release);
        self.file.store(file.0, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.reference.store(true, Ordering::Relaxed);
        self.last_modifier.store(0, Ordering::Release);
    }

    /// Clears the tag. Caller must hold the claim.
    pub fn unbind(&self) {
        self.file.store(UNBOUND_FILE, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.reference.store(false, Ordering::Relaxed);
    }

    // ---- clock and dirty bits ----

    pub fn mark_referenced(&self) {
        self.reference.store(true, Ordering::Relaxed);
    }

    /// Clears the clock bit, returning whether it was set.
    pub fn take_reference(&self) -> bool {
        self.reference.swap(false, Ordering::Relaxed)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn last_modifier(&self) -> u64 {
        self.last_modifier.load(Ordering::Acquire)
    }

    pub fn raise_last_modifier(&self, tx: u64) {
        self.last_modifier.fetch_max(tx, Ordering::AcqRel);
    }

    // ---- seqlock ----

    /// Waits for an even version and returns it.
    pub fn stable_version(&self) -> u64 {
        let mut backoff = Backoff::new();
        loop {
            let version = self.version.load(Ordering::Acquire);
            if version & 1 == 0 {
                return version;
            }
            backoff.snooze();
        }
    }

    /// Returns the version if no writer holds the frame right now.
    pub fn try_stable_version(&self) -> Option<u64> {
        let version = self.version.load(Ordering::Acquire);
        (version & 1 == 0).then_some(version)
    }

    /// True when nothing was written since `version` was observed.
    pub fn validate(&self, version: u64) -> bool {
        fence(Ordering::Acquire);
        self.version.load(Ordering::Relaxed) == version
    }

    /// Acquires the exclusive write token, blocking other writers, and marks the frame dirty.
    pub fn write_lock(&self) {
        let mut backoff = Backoff::new();
        loop {
            let version = self.version.load(Ordering::Relaxed);
            if version & 1 == 0
                && self
                    .version
                    .compare_exchange_weak(version, version + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                fence(Ordering::Release);
                self.writer.store(writer_token(), Ordering::Relaxed);
                self.dirty.store(true, Ordering::Release);
                return;
            }
            backoff.snooze();
        }
    }

    pub fn write_unlock(&self) {
        self.writer.store(NO_WRITER, Ordering::Relaxed);
        let prev = self.version.fetch_add(1, Ordering::Release);
        debug_assert!(prev & 1 == 1, "write_unlock without write_lock");
    }

    // ---- bytes ----

    pub fn copy_out(&self, at: usize, dst: &mut [u8]) {
        for (slot, byte) in dst.iter_mut().zip(&self.buf[at..]) {
            *slot = byte.load(Ordering::Relaxed);
        }
    }

    pub fn copy_in(&self, at: usize, src: &[u8]) {
        for (byte, value) in self.buf[at..].iter().zip(src) {
            byte.store(*value, Ordering::Relaxed);
        }
    }

    pub fn fill(&self, from: usize, to: usize, value: u8) {
        for byte in &self.buf[from..to] {
            byte.store(value, Ordering::Relaxed);
        }
    }

    /// True while the calling thread holds the write lock.
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.try_stable_version().is_none() && self.writer.load(Ordering::Relaxed) == writer_token()
    }

    /// Copies the first `dst.len()` bytes as they stood at one stable version,
    /// waiting out writers on other threads.
    ///
    /// Clears the dirty bit first so that a writer arriving mid-copy re-dirties
    /// the frame. Waiting on the caller's own write lock would never end, so
    /// that case returns [`StableCopy::HeldByCaller`] with the frame still dirty.
    pub fn copy_stable(&self, dst: &mut [u8]) -> StableCopy {
        let mut backoff = Backoff::new();
        loop {
            let Some(version) = self.try_stable_version() else {
                if self.is_write_locked_by_current_thread() {
                    return StableCopy::HeldByCaller;
                }
                backoff.snooze();
                continue;
            };
            self.dirty.store(false, Ordering::Release);
            self.copy_out(0, dst);
            if self.validate(version) {
                return StableCopy::Copied;
            }
            self.set_dirty();
        }
    }
}

/// Fixed pool of frames with a free list and a clock hand.
pub struct FrameArena {
    frames: Box<[Frame]>,
    free: Mutex<Vec<FrameId>>,
    hand: AtomicUsize,
    frame_size: usize,
}

impl FrameArena {
    /// Allocates `capacity` frames of `frame_size` bytes, all on the free list.
    pub fn new(capacity: usize, frame_size: usize) -> Self {
        let frames: Box<[Frame]> = (0..capacity).map(|_| Frame::new(frame_size)).collect();
        let free = (0..capacity as u32).rev().map(FrameId).collect();
        Self {
            frames,
            free: Mutex::new(free),
            hand: AtomicUsize::new(0),
            frame_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frame(&self, id: FrameId) -> &Frame {
        &self.frames[id.0 as usize]
    }

    pub fn frames(&self) -> impl Iterator<Item = (FrameId, &Frame)> {
        self.frames
            .iter()
            .enumerate()
            .map(|(idx, frame)| (FrameId(idx as u32), frame))
    }

    /// Pops a claimed, unbound frame.
    pub fn pop_free(&self) -> Option<FrameId> {
        self.free.lock().pop()
    }

    /// Returns a claimed, unbound frame to the free list.
    pub fn push_free(&self, id: FrameId) {
        debug_assert!(self.frame(id).is_claimed());
        self.free.lock().push(id);
    }

    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }

    /// Advances the clock hand and returns the frame under it.
    pub fn tick(&self) -> FrameId {
        let idx = self.hand.fetch_add(1, Ordering::Relaxed) % self.frames.len();
        FrameId(idx as u32)
    }
}
