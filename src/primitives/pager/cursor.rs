use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use bitflags::bitflags;

use super::cache::CacheInner;
use super::paged_file::FileMapping;
use crate::types::{CacheError, FrameId, PageId, Result};
use crate::version::VersionContext;

bitflags! {
    /// Access mode of a [`PageCursor`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PfFlags: u32 {
        /// Optimistic reads validated with `should_retry`.
        const SHARED_READ = 1;
        /// Exclusive writes, one writer per page.
        const EXCLUSIVE_WRITE = 1 << 1;
        /// Writers stop at the end of the file instead of growing it.
        const NO_GROW = 1 << 2;
        /// Fail with `NoFault` instead of reading an absent page.
        const NO_FAULT = 1 << 3;
    }
}

struct Pinned {
    page: PageId,
    frame: FrameId,
    /// Seqlock version observed by a reader; unused by writers.
    version: u64,
}

/// Cursor over the pages of a mapped file.
///
/// A cursor starts unbound. [`next`](Self::next) binds the page it was opened
/// at, then the following pages; [`next_to`](Self::next_to) jumps. While bound
/// it holds a pin on the frame, and a write cursor also holds the page's write
/// lock. Both are released when the cursor moves on or is dropped.
///
/// Readers must loop until [`should_retry`](Self::should_retry) returns false:
///
/// ```ignore
/// let mut cursor = file.io(page, PfFlags::SHARED_READ)?;
/// if cursor.next()? {
///     let value = loop {
///         let value = cursor.get_u64_at(0);
///         if !cursor.should_retry()? {
///             break value;
///         }
///     };
///     cursor.check_and_clear_bounds_flag()?;
/// }
/// ```
///
/// Accesses outside the page never panic: reads return zero, writes are
/// dropped and the bounds flag is raised.
pub struct PageCursor {
    cache: Arc<CacheInner>,
    mapping: Arc<FileMapping>,
    flags: PfFlags,
    ctx: Arc<dyn VersionContext>,
    /// `None` once the cursor has passed `PageId(u64::MAX)`.
    next_page: Option<PageId>,
    current: Option<Pinned>,
    offset: usize,
    out_of_bounds: Option<usize>,
}

macro_rules! typed_accessors {
    ($($ty:ty => $get:ident, $get_at:ident, $put:ident, $put_at:ident;)*) => {
        $(
            #[doc = concat!("Reads a big-endian `", stringify!($ty), "` at the offset and advances past it.")]
            pub fn $get(&mut self) -> $ty {
                let at = self.advance(size_of::<$ty>());
                self.$get_at(at)
            }

            #[doc = concat!("Reads a big-endian `", stringify!($ty), "` at `at` without moving the offset.")]
            pub fn $get_at(&mut self, at: usize) -> $ty {
                let mut raw = [0u8; size_of::<$ty>()];
                self.read_into(at, &mut raw);
                <$ty>::from_be_bytes(raw)
            }

            #[doc = concat!("Writes a big-endian `", stringify!($ty), "` at the offset and advances past it.")]
            pub fn $put(&mut self, value: $ty) {
                let at = self.advance(size_of::<$ty>());
                self.$put_at(at, value);
            }

            #[doc = concat!("Writes a big-endian `", stringify!($ty), "` at `at` without moving the offset.")]
            pub fn $put_at(&mut self, at: usize, value: $ty) {
                self.write_from(at, &value.to_be_bytes());
            }
        )*
    };
}

impl PageCursor {
    pub(crate) fn new(
        cache: Arc<CacheInner>,
        mapping: Arc<FileMapping>,
        page: PageId,
        flags: PfFlags,
        ctx: Arc<dyn VersionContext>,
    ) -> Self {
        Self {
            cache,
            mapping,
            flags,
            ctx,
            next_page: Some(page),
            current: None,
            offset: 0,
            out_of_bounds: None,
        }
    }

    fn is_writer(&self) -> bool {
        self.flags.contains(PfFlags::EXCLUSIVE_WRITE)
    }

    // ---- positioning ----

    /// Binds the next page. Returns false when a reader (or a `NO_GROW`
    /// writer) would move past the last page of the file.
    pub fn next(&mut self) -> Result<bool> {
        let page = self
            .next_page
            .ok_or(CacheError::Invalid("cursor moved past the last page id"))?;
        self.next_to(page)
    }

    /// Binds `page`, with the same end-of-file rules as [`next`](Self::next).
    ///
    /// Pages whose byte range ends past `i64::MAX` are rejected as invalid. A
    /// `NO_FAULT` writer past the end of the file fails with `NoFault` without
    /// growing the file.
    pub fn next_to(&mut self, page: PageId) -> Result<bool> {
        self.release();
        self.cache.ensure_open()?;
        if !self.mapping.is_addressable(page) {
            return Err(CacheError::Invalid("page offset does not fit in a file position"));
        }
        let within_file = matches!(self.mapping.last_page_id(), Some(last) if page <= last);
        if !within_file {
            if !self.is_writer() || self.flags.contains(PfFlags::NO_GROW) {
                return Ok(false);
            }
            if self.flags.contains(PfFlags::NO_FAULT) {
                return Err(CacheError::NoFault(page));
            }
            self.mapping.grow_to(page);
        }
        let frame_id = self
            .cache
            .pin(&self.mapping, page, self.flags.contains(PfFlags::NO_FAULT))?;
        let frame = self.cache.arena.frame(frame_id);
        let version = if self.is_writer() {
            frame.write_lock();
            0
        } else {
            if frame.last_modifier() > self.ctx.last_closed_tx_id() {
                self.ctx.mark_as_dirty();
            }
            frame.stable_version()
        };
        self.current = Some(Pinned {
            page,
            frame: frame_id,
            version,
        });
        self.offset = 0;
        self.next_page = page.next();
        Ok(true)
    }

    /// For readers: true if a writer touched the page since the read began.
    /// The cursor is then re-armed and the caller must redo the whole read.
    /// Writers never need to retry.
    pub fn should_retry(&mut self) -> Result<bool> {
        if self.is_writer() {
            return Ok(false);
        }
        let Some(pinned) = self.current.as_mut() else {
            return Ok(false);
        };
        let frame = self.cache.arena.frame(pinned.frame);
        if frame.validate(pinned.version) {
            return Ok(false);
        }
        pinned.version = frame.stable_version();
        self.out_of_bounds = None;
        Ok(true)
    }

    /// Returns an `OutOfBounds` error once if any access since the last call
    /// fell outside the page.
    pub fn check_and_clear_bounds_flag(&mut self) -> Result<()> {
        match self.out_of_bounds.take() {
            Some(offset) => Err(CacheError::OutOfBounds {
                page: self
                    .current_page_id()
                    .or(self.next_page)
                    .unwrap_or(PageId(u64::MAX)),
                offset,
            }),
            None => Ok(()),
        }
    }

    /// Moves the offset used by relative accessors.
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Offset used by relative accessors.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Page the cursor is bound to.
    pub fn current_page_id(&self) -> Option<PageId> {
        self.current.as_ref().map(|pinned| pinned.page)
    }

    /// Page size of the mapped file.
    pub fn current_page_size(&self) -> usize {
        self.mapping.page_size
    }

    /// Highest transaction that wrote the bound page, or 0.
    pub fn last_modifier(&self) -> u64 {
        self.current
            .as_ref()
            .map_or(0, |pinned| self.cache.arena.frame(pinned.frame).last_modifier())
    }

    // ---- data ----

    typed_accessors! {
        u8 => get_u8, get_u8_at, put_u8, put_u8_at;
        u16 => get_u16, get_u16_at, put_u16, put_u16_at;
        u32 => get_u32, get_u32_at, put_u32, put_u32_at;
        u64 => get_u64, get_u64_at, put_u64, put_u64_at;
        i32 => get_i32, get_i32_at, put_i32, put_i32_at;
        i64 => get_i64, get_i64_at, put_i64, put_i64_at;
    }

    /// Fills `dst` from the offset and advances past it.
    pub fn get_bytes(&mut self, dst: &mut [u8]) {
        let at = self.advance(dst.len());
        self.read_into(at, dst);
    }

    /// Copies `src` to the offset and advances past it.
    pub fn put_bytes(&mut self, src: &[u8]) {
        let at = self.advance(src.len());
        self.write_from(at, src);
    }

    /// Zeroes the whole page. Write cursors only.
    pub fn zap_page(&mut self) {
        match self.writable_frame(0, self.mapping.page_size) {
            Some(frame_id) => self.cache.arena.frame(frame_id).fill(0, self.mapping.page_size, 0),
            None => self.raise_bounds(0),
        }
    }

    /// Releases the page; same as dropping the cursor.
    pub fn close(self) {}

    fn advance(&mut self, len: usize) -> usize {
        let at = self.offset;
        self.offset = self.offset.saturating_add(len);
        at
    }

    fn in_page(&self, at: usize, len: usize) -> bool {
        at.checked_add(len)
            .is_some_and(|end| end <= self.mapping.page_size)
    }

    fn raise_bounds(&mut self, at: usize) {
        self.out_of_bounds.get_or_insert(at);
    }

    fn writable_frame(&self, at: usize, len: usize) -> Option<FrameId> {
        if !self.is_writer() || !self.in_page(at, len) {
            return None;
        }
        self.current.as_ref().map(|pinned| pinned.frame)
    }

    fn read_into(&mut self, at: usize, dst: &mut [u8]) {
        let frame_id = self.current.as_ref().map(|pinned| pinned.frame);
        match frame_id {
            Some(frame_id) if self.in_page(at, dst.len()) => {
                self.cache.arena.frame(frame_id).copy_out(at, dst);
            }
            _ => {
                dst.fill(0);
                self.raise_bounds(at);
            }
        }
    }

    fn write_from(&mut self, at: usize, src: &[u8]) {
        match self.writable_frame(at, src.len()) {
            Some(frame_id) => self.cache.arena.frame(frame_id).copy_in(at, src),
            None => self.raise_bounds(at),
        }
    }

    fn release(&mut self) {
        let Some(pinned) = self.current.take() else {
            return;
        };
        let frame = self.cache.arena.frame(pinned.frame);
        if self.is_writer() {
            frame.raise_last_modifier(self.ctx.committing_tx_id());
            frame.write_unlock();
        }
        frame.unpin();
    }
}

impl Drop for PageCursor {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCursor")
            .field("file", &self.mapping.id)
            .field("flags", &self.flags)
            .field("page", &self.current_page_id())
            .field("offset", &self.offset)
            .finish()
    }
}
