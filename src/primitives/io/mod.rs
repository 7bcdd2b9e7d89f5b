#![forbid(unsafe_code)]

use std::{
    fs::File,
    io::{self, IoSlice},
    path::Path,
    sync::Arc,
};

use tracing::trace;

use crate::types::{CacheError, Result};

mod mem;

pub use mem::{MemFileIo, MemFileSystem};

/// Offset-addressed file access used by page swappers.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`, failing with `UnexpectedEof` on a short file.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file when needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Writes multiple buffers back to back starting at `off`.
    fn writev_at(&self, mut off: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        for slice in bufs {
            if slice.is_empty() {
                continue;
            }
            self.write_at(off, slice)?;
            off = off
                .checked_add(slice.len() as u64)
                .ok_or(CacheError::Invalid("writev offset overflow"))?;
        }
        Ok(())
    }
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;
    /// True for a zero-length file.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Sets the file length, zero-extending or cutting as needed.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// One positional read; may return fewer bytes than asked for.
#[cfg(unix)]
fn pread(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, dst, off)
}

#[cfg(unix)]
fn pwrite(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, src, off)
}

// `seek_read`/`seek_write` move the cursor on Windows; nothing here relies on it.
#[cfg(windows)]
fn pread(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, dst, off)
}

#[cfg(windows)]
fn pwrite(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, src, off)
}

#[cfg(not(any(unix, windows)))]
fn pread(_file: &File, _dst: &mut [u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "positional reads unsupported"))
}

#[cfg(not(any(unix, windows)))]
fn pwrite(_file: &File, _src: &[u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "positional writes unsupported"))
}

/// File handle shared between clones, addressed only by offset.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }

    /// Opens `path` read-write. A missing file is created only when `create` is set.
    pub fn open(path: impl AsRef<Path>, create: bool) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            match pread(&self.file, dst, off) {
                Ok(0) => {
                    return Err(CacheError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("short read at offset {off}"),
                    )));
                }
                Ok(n) => {
                    dst = &mut dst[n..];
                    off += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            match pwrite(&self.file, src, off) {
                Ok(0) => {
                    return Err(CacheError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("zero-length write at offset {off}"),
                    )));
                }
                Ok(n) => {
                    src = &src[n..];
                    off += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.file.sync_all().map_err(|err| {
            trace!(error = %err, "io.sync_all.failed");
            CacheError::from(err)
        })
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.file.set_len(len)?)
    }
}
