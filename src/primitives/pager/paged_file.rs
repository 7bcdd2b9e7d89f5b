use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::cache::CacheInner;
use super::cursor::{PageCursor, PfFlags};
use super::limiter::IoLimiter;
use super::swapper::PageSwapper;
use super::table::TranslationTable;
use crate::types::{CacheError, FileId, PageId, Result};
use crate::version::VersionContext;

/// How [`PageCache::map`](super::PageCache::map) opens the file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapOptions {
    /// Create the file when it does not exist.
    pub create: bool,
    /// Truncate the file to zero length when it is first mapped.
    pub truncate_existing: bool,
}

impl MapOptions {
    /// Options that create a missing file.
    pub fn create() -> Self {
        Self {
            create: true,
            truncate_existing: false,
        }
    }

    /// Also truncate the file on first map.
    pub fn truncate_existing(mut self) -> Self {
        self.truncate_existing = true;
        self
    }
}

/// Cache-side state of one mapped file, shared by every handle and cursor on it.
pub(crate) struct FileMapping {
    pub(crate) id: FileId,
    pub(crate) path: PathBuf,
    pub(crate) page_size: usize,
    pub(crate) swapper: Arc<dyn PageSwapper>,
    pub(crate) table: TranslationTable,
    /// -1 while the file has no pages.
    last_page: AtomicI64,
    pub(crate) refs: AtomicUsize,
    unmapped: AtomicBool,
}

impl FileMapping {
    pub(crate) fn new(
        id: FileId,
        path: PathBuf,
        page_size: usize,
        swapper: Arc<dyn PageSwapper>,
        last_page: Option<PageId>,
    ) -> Self {
        Self {
            id,
            path,
            page_size,
            swapper,
            table: TranslationTable::new(),
            last_page: AtomicI64::new(last_page.map_or(-1, |page| page.0 as i64)),
            refs: AtomicUsize::new(1),
            unmapped: AtomicBool::new(false),
        }
    }

    /// Stops cursors from faulting new pages of this file.
    pub(crate) fn mark_unmapped(&self) {
        self.unmapped.store(true, Ordering::Release);
    }

    pub(crate) fn reopen(&self) {
        self.unmapped.store(false, Ordering::Release);
    }

    pub(crate) fn is_unmapped(&self) -> bool {
        self.unmapped.load(Ordering::Acquire)
    }

    pub(crate) fn last_page_id(&self) -> Option<PageId> {
        let last = self.last_page.load(Ordering::Acquire);
        (last >= 0).then(|| PageId(last as u64))
    }

    /// True when every byte of `page` lies at a file offset up to `i64::MAX`.
    pub(crate) fn is_addressable(&self, page: PageId) -> bool {
        page.0
            .checked_add(1)
            .and_then(|pages| pages.checked_mul(self.page_size as u64))
            .is_some_and(|end| end <= i64::MAX as u64)
    }

    /// Extends the logical end of the file to include `page`, which must be
    /// addressable.
    pub(crate) fn grow_to(&self, page: PageId) {
        debug_assert!(self.is_addressable(page));
        self.last_page.fetch_max(page.0 as i64, Ordering::AcqRel);
    }
}

/// Handle on a mapped file. Cursors are opened from here.
///
/// Every `map` call returns its own handle; the file stays mapped until the
/// last handle is closed or dropped.
pub struct PagedFile {
    cache: Arc<CacheInner>,
    mapping: Arc<FileMapping>,
    closed: bool,
}

impl PagedFile {
    pub(crate) fn new(cache: Arc<CacheInner>, mapping: Arc<FileMapping>) -> Self {
        Self {
            cache,
            mapping,
            closed: false,
        }
    }

    /// Opens a cursor positioned before `page`; the first `next()` binds it.
    pub fn io(&self, page: PageId, flags: PfFlags) -> Result<PageCursor> {
        let ctx = self.cache.contexts.version_context();
        self.io_with_context(page, flags, ctx)
    }

    /// Like [`io`](Self::io) with an explicit version context.
    pub fn io_with_context(
        &self,
        page: PageId,
        flags: PfFlags,
        ctx: Arc<dyn VersionContext>,
    ) -> Result<PageCursor> {
        let read = flags.contains(PfFlags::SHARED_READ);
        let write = flags.contains(PfFlags::EXCLUSIVE_WRITE);
        if read == write {
            return Err(CacheError::Invalid(
                "exactly one of SHARED_READ and EXCLUSIVE_WRITE is required",
            ));
        }
        self.cache.ensure_open()?;
        if read {
            ctx.init_read();
        }
        Ok(PageCursor::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.mapping),
            page,
            flags,
            ctx,
        ))
    }

    /// Highest page id in the file, including pages grown but not yet flushed.
    pub fn last_page_id(&self) -> Option<PageId> {
        self.mapping.last_page_id()
    }

    /// Number of pages in the file.
    pub fn page_count(&self) -> u64 {
        self.last_page_id().map_or(0, |page| page.0 + 1)
    }

    /// Page size this file was mapped with.
    pub fn page_size(&self) -> usize {
        self.mapping.page_size
    }

    /// Mapped file path.
    pub fn path(&self) -> &Path {
        &self.mapping.path
    }

    /// Flushes this file's dirty pages and forces them to storage.
    pub fn flush_and_force(&self, limiter: &dyn IoLimiter) -> Result<()> {
        self.cache.ensure_usable()?;
        self.cache.flush_mapping(&self.mapping, limiter)?;
        self.cache.force_mapping(&self.mapping)
    }

    /// Releases this handle. Closing the last handle flushes the file, evicts
    /// its pages and unmaps it.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.cache.unmap(&self.mapping)
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match self.cache.unmap(&self.mapping) {
            Ok(()) | Err(CacheError::Closed) => {}
            Err(err) => {
                warn!(file = %self.mapping.path.display(), error = %err, "pagecache.unmap.drop_failed");
            }
        }
    }
}

impl fmt::Debug for PagedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedFile")
            .field("file", &self.mapping.id)
            .field("path", &self.mapping.path)
            .field("page_size", &self.mapping.page_size)
            .field("last_page_id", &self.mapping.last_page_id())
            .finish()
    }
}
