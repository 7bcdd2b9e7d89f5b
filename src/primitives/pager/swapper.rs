use std::io::IoSlice;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::primitives::io::{FileIo, MemFileSystem, StdFileIo};
use crate::types::{CacheError, PageId, Result};

/// Moves raw page bytes between frames and one backing file.
pub trait PageSwapper: Send + Sync {
    /// File backing this swapper.
    fn path(&self) -> &Path;
    /// Page size used to compute file offsets.
    fn page_size(&self) -> usize;
    /// Reads `page` into `dst`, zero-filling whatever lies past the end of the
    /// file. Returns the number of bytes that came from storage.
    fn read(&self, page: PageId, dst: &mut [u8]) -> Result<usize>;
    /// Writes one page.
    fn write(&self, page: PageId, src: &[u8]) -> Result<()>;
    /// Writes consecutive pages starting at `first` with one vectored call.
    fn write_run(&self, first: PageId, pages: &[IoSlice<'_>]) -> Result<()>;
    /// Makes previous writes durable.
    fn force(&self) -> Result<()>;
    /// Last page with any bytes on storage, or `None` for an empty file.
    fn last_page_id(&self) -> Result<Option<PageId>>;
    /// Truncates the file to zero length.
    fn truncate(&self) -> Result<()>;
}

/// Opens swappers for mapped files.
pub trait PageSwapperFactory: Send + Sync {
    /// Opens `path`; a missing file is created only when `create` is set.
    fn open(&self, path: &Path, page_size: usize, create: bool) -> Result<Arc<dyn PageSwapper>>;
}

/// Swapper over a single [`FileIo`] handle.
pub struct SingleFileSwapper {
    path: PathBuf,
    page_size: usize,
    io: Arc<dyn FileIo>,
}

impl SingleFileSwapper {
    /// Wraps `io`, addressing it in pages of `page_size` bytes.
    pub fn new(path: PathBuf, page_size: usize, io: Arc<dyn FileIo>) -> Self {
        Self {
            path,
            page_size,
            io,
        }
    }

    fn offset(&self, page: PageId) -> Result<u64> {
        page.0
            .checked_mul(self.page_size as u64)
            .ok_or(CacheError::Invalid("page offset overflow"))
    }
}

impl PageSwapper for SingleFileSwapper {
    fn path(&self) -> &Path {
        &self.path
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, page: PageId, dst: &mut [u8]) -> Result<usize> {
        let offset = self.offset(page)?;
        let len = self.io.len()?;
        let available = len.saturating_sub(offset).min(dst.len() as u64) as usize;
        if available > 0 {
            self.io.read_at(offset, &mut dst[..available])?;
        }
        dst[available..].fill(0);
        Ok(available)
    }

    fn write(&self, page: PageId, src: &[u8]) -> Result<()> {
        self.io.write_at(self.offset(page)?, src)
    }

    fn write_run(&self, first: PageId, pages: &[IoSlice<'_>]) -> Result<()> {
        self.io.writev_at(self.offset(first)?, pages)
    }

    fn force(&self) -> Result<()> {
        self.io.sync_all()
    }

    fn last_page_id(&self) -> Result<Option<PageId>> {
        let len = self.io.len()?;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(PageId(len.div_ceil(self.page_size as u64) - 1)))
    }

    fn truncate(&self) -> Result<()> {
        debug!(path = %self.path.display(), "swapper.truncate");
        self.io.truncate(0)
    }
}

/// Factory over real files.
#[derive(Default, Clone, Copy, Debug)]
pub struct StdSwapperFactory;

impl PageSwapperFactory for StdSwapperFactory {
    fn open(&self, path: &Path, page_size: usize, create: bool) -> Result<Arc<dyn PageSwapper>> {
        let io = StdFileIo::open(path, create)?;
        Ok(Arc::new(SingleFileSwapper::new(
            path.to_path_buf(),
            page_size,
            Arc::new(io),
        )))
    }
}

/// Factory over a [`MemFileSystem`], mainly for tests.
#[derive(Default, Clone)]
pub struct MemSwapperFactory {
    fs: MemFileSystem,
}

impl MemSwapperFactory {
    /// Opens files from `fs`.
    pub fn new(fs: MemFileSystem) -> Self {
        Self { fs }
    }

    /// The file system the swappers read and write.
    pub fn file_system(&self) -> &MemFileSystem {
        &self.fs
    }
}

impl PageSwapperFactory for MemSwapperFactory {
    fn open(&self, path: &Path, page_size: usize, create: bool) -> Result<Arc<dyn PageSwapper>> {
        let io = self.fs.open(path, create)?;
        Ok(Arc::new(SingleFileSwapper::new(
            path.to_path_buf(),
            page_size,
            io,
        )))
    }
}
